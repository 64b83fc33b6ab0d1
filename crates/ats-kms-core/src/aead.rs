//! AES-256-GCM sealing with mandatory AAD
//!
//! Every ciphertext in the store is bound to its context through AAD: the
//! canonical JSON of the record's identifying metadata. Transplanting a
//! ciphertext between methods, keys, or purposes changes the AAD and fails
//! the GCM tag check. IVs are 12 random bytes, fresh per encryption; the
//! 16-byte tag is appended to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Serialize};

use crate::constants::{AES_IV_LEN, AES_KEY_LEN};
use crate::effects::RandomEffects;
use crate::error::{KmsError, Result};

/// An AES-GCM ciphertext with its IV; the tag is appended to `ciphertext`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// 12-byte nonce used for this encryption
    pub iv: Vec<u8>,
    /// Ciphertext followed by the 16-byte authentication tag
    pub ciphertext: Vec<u8>,
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != AES_KEY_LEN {
        return Err(KmsError::crypto(format!(
            "AES-256-GCM key must be {AES_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}

/// Encrypt with a fresh random IV and the given AAD
pub fn seal(
    key: &[u8],
    plaintext: &[u8],
    aad: &[u8],
    effects: &dyn RandomEffects,
) -> Result<SealedBox> {
    let cipher = cipher(key)?;
    let mut iv = vec![0u8; AES_IV_LEN];
    effects.fill(&mut iv);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| KmsError::crypto("AES-GCM encryption failed"))?;
    Ok(SealedBox { iv, ciphertext })
}

/// Decrypt; fails if the key, IV, AAD, or ciphertext do not match
pub fn open(key: &[u8], sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.iv.len() != AES_IV_LEN {
        return Err(KmsError::crypto(format!(
            "AES-GCM IV must be {AES_IV_LEN} bytes, got {}",
            sealed.iv.len()
        )));
    }
    let cipher = cipher(key)?;
    cipher
        .decrypt(
            Nonce::from_slice(&sealed.iv),
            Payload {
                msg: &sealed.ciphertext,
                aad,
            },
        )
        .map_err(|_| KmsError::crypto("AES-GCM decryption failed (tag mismatch)"))
}
