//! Ed25519 signing for the audit chain
//!
//! Audit signers are seed-addressed: the UAK seed comes out of HKDF, LAK
//! and KIAK seeds out of the RNG. Only this module touches dalek types.

use ed25519_dalek::Signer as _;

use crate::error::{KmsError, Result};

/// Length of an Ed25519 seed or public key
pub const KEY_LEN: usize = 32;

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Derive the public key for a 32-byte seed
pub fn public_key(seed: &[u8]) -> Result<[u8; KEY_LEN]> {
    let seed: [u8; KEY_LEN] = seed
        .try_into()
        .map_err(|_| KmsError::crypto("Ed25519 seed must be exactly 32 bytes"))?;
    let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
    Ok(signing.verifying_key().to_bytes())
}

/// Sign a message with a 32-byte seed
pub fn sign(seed: &[u8], message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let seed: [u8; KEY_LEN] = seed
        .try_into()
        .map_err(|_| KmsError::crypto("Ed25519 seed must be exactly 32 bytes"))?;
    let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
    Ok(signing.sign(message).to_bytes())
}

/// Verify a signature against a 32-byte public key
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let public_key: [u8; KEY_LEN] = public_key
        .try_into()
        .map_err(|_| KmsError::crypto("Ed25519 public key must be exactly 32 bytes"))?;
    let signature: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| KmsError::crypto("Ed25519 signature must be exactly 64 bytes"))?;
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(&public_key)
        .map_err(|e| KmsError::crypto(e.to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&signature);
    Ok(verifying.verify_strict(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let seed = [7u8; 32];
        let signature = sign(&seed, b"audit entry").unwrap();
        let public = public_key(&seed).unwrap();
        assert!(verify(&public, b"audit entry", &signature).unwrap());
        assert!(!verify(&public, b"other entry", &signature).unwrap());
    }

    #[test]
    fn invalid_lengths_rejected() {
        assert!(public_key(&[0u8; 31]).is_err());
        assert!(sign(&[0u8; 33], b"m").is_err());
        assert!(verify(&[0u8; 32], b"m", &[0u8; 63]).is_err());
    }
}
