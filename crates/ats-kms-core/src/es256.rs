//! ECDSA P-256 (ES256) operations for VAPID keys
//!
//! Private keys travel as PKCS#8 DER inside [`SecretBytes`]; public keys as
//! the 65-byte uncompressed SEC1 point. JWS signatures are always the
//! 64-byte P-1363 `r ‖ s` form; [`der_to_p1363`] converts signatures from
//! platforms that emit ASN.1 DER.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use zeroize::Zeroizing;

use crate::effects::{RandomEffects, RandomEffectsExt};
use crate::error::{KmsError, Result};
use crate::secret::SecretBytes;

/// Length of an uncompressed SEC1 P-256 public point
pub const PUBLIC_KEY_LEN: usize = 65;

/// Length of a P-1363 ES256 signature
pub const SIGNATURE_LEN: usize = 64;

/// An ES256 signing keypair
pub struct Es256KeyPair {
    signing: SigningKey,
}

impl Es256KeyPair {
    /// Generate a fresh keypair from the effects RNG
    pub fn generate(effects: &dyn RandomEffects) -> Self {
        // A random 32-byte string is a valid scalar with overwhelming
        // probability; loop on the negligible rejection cases.
        loop {
            let seed = Zeroizing::new(effects.random_array::<32>());
            if let Ok(signing) = SigningKey::from_slice(seed.as_slice()) {
                return Self { signing };
            }
        }
    }

    /// Import a private key from PKCS#8 DER
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let signing = SigningKey::from_pkcs8_der(der)
            .map_err(|e| KmsError::crypto(format!("PKCS#8 import: {e}")))?;
        Ok(Self { signing })
    }

    /// Export the private key as PKCS#8 DER
    pub fn to_pkcs8_der(&self) -> Result<SecretBytes> {
        let doc = self
            .signing
            .to_pkcs8_der()
            .map_err(|e| KmsError::crypto(format!("PKCS#8 export: {e}")))?;
        Ok(SecretBytes::from_slice(doc.as_bytes()))
    }

    /// The 65-byte uncompressed public point (leading `0x04`)
    pub fn public_key_uncompressed(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.signing.verifying_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Sign a message (SHA-256 over the input, RFC 6979 nonces), P-1363 form
    pub fn sign_p1363(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signature: Signature = self.signing.sign(message);
        let bytes = signature.to_bytes();
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&bytes);
        out
    }
}

/// Verify a P-1363 ES256 signature against an uncompressed public point
pub fn verify_p1363(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let verifying = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| KmsError::crypto(format!("invalid P-256 public key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| KmsError::crypto(format!("invalid P-1363 signature: {e}")))?;
    Ok(verifying.verify(message, &signature).is_ok())
}

/// Convert an ASN.1 DER ECDSA signature to 64-byte P-1363
///
/// DER form is `SEQUENCE { INTEGER r, INTEGER s }` (~70-72 bytes, leading
/// `0x30`); each integer is left-zero-padded to 32 bytes in the output.
pub fn der_to_p1363(der: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let signature = Signature::from_der(der)
        .map_err(|e| KmsError::crypto(format!("invalid DER signature: {e}")))?;
    let bytes = signature.to_bytes();
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::FixedEffects;

    #[test]
    fn public_point_is_uncompressed() {
        let fx = FixedEffects::new(11, 0);
        let pair = Es256KeyPair::generate(&fx);
        let public = pair.public_key_uncompressed();
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04);
    }

    #[test]
    fn pkcs8_roundtrip_preserves_key() {
        let fx = FixedEffects::new(11, 0);
        let pair = Es256KeyPair::generate(&fx);
        let der = pair.to_pkcs8_der().unwrap();
        let restored = Es256KeyPair::from_pkcs8_der(der.as_slice()).unwrap();
        assert_eq!(
            pair.public_key_uncompressed(),
            restored.public_key_uncompressed()
        );
    }

    #[test]
    fn sign_then_verify() {
        let fx = FixedEffects::new(11, 0);
        let pair = Es256KeyPair::generate(&fx);
        let signature = pair.sign_p1363(b"header.payload");
        assert_eq!(signature.len(), 64);
        assert!(verify_p1363(&pair.public_key_uncompressed(), b"header.payload", &signature)
            .unwrap());
        assert!(!verify_p1363(&pair.public_key_uncompressed(), b"header.tampered", &signature)
            .unwrap());
    }

    #[test]
    fn der_conversion_matches_fixed_form() {
        let fx = FixedEffects::new(11, 0);
        let pair = Es256KeyPair::generate(&fx);
        let signature: Signature = pair.signing.sign(b"msg");
        let der = signature.to_der();
        assert_eq!(der.as_bytes()[0], 0x30);
        let converted = der_to_p1363(der.as_bytes()).unwrap();
        assert_eq!(converted, pair.sign_p1363(b"msg"));
    }
}
