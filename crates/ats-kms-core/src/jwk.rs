//! RFC 7638 JWK thumbprints for P-256 public keys
//!
//! The thumbprint of the canonical `{"crv","kty","x","y"}` JWK is the `kid`
//! under which a wrapped key is stored, so key identifiers are
//! content-derived and stable across exports.

use serde_json::json;

use crate::b64url;
use crate::error::{KmsError, Result};
use crate::es256::PUBLIC_KEY_LEN;
use crate::hashing::sha256;

/// Build the public JWK for a 65-byte uncompressed P-256 point
pub fn p256_public_jwk(public_key: &[u8]) -> Result<serde_json::Value> {
    if public_key.len() != PUBLIC_KEY_LEN || public_key[0] != 0x04 {
        return Err(KmsError::crypto(
            "P-256 public key must be a 65-byte uncompressed point",
        ));
    }
    let x = &public_key[1..33];
    let y = &public_key[33..65];
    Ok(json!({
        "kty": "EC",
        "crv": "P-256",
        "x": b64url::encode(x),
        "y": b64url::encode(y),
    }))
}

/// RFC 7638 thumbprint: SHA-256 of the canonical required-member JWK
pub fn thumbprint(public_key: &[u8]) -> Result<String> {
    let jwk = p256_public_jwk(public_key)?;
    // Required members in lexicographic order; the canonical serializer
    // enforces exactly the ordering RFC 7638 specifies.
    let canonical = crate::canonical::to_canonical_json(&jwk)?;
    Ok(b64url::encode(sha256(canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::FixedEffects;
    use crate::es256::Es256KeyPair;

    #[test]
    fn thumbprint_is_stable_and_urlsafe() {
        let fx = FixedEffects::new(5, 0);
        let pair = Es256KeyPair::generate(&fx);
        let public = pair.public_key_uncompressed();
        let a = thumbprint(&public).unwrap();
        let b = thumbprint(&public).unwrap();
        assert_eq!(a, b);
        // 32 hash bytes -> 43 base64url chars, no padding
        assert_eq!(a.len(), 43);
        assert!(!a.contains('='));
    }

    #[test]
    fn canonical_member_order() {
        let fx = FixedEffects::new(5, 0);
        let pair = Es256KeyPair::generate(&fx);
        let jwk = p256_public_jwk(&pair.public_key_uncompressed()).unwrap();
        let canonical = crate::canonical::to_canonical_json(&jwk).unwrap();
        assert!(canonical.starts_with(r#"{"crv":"P-256","kty":"EC","x":""#));
    }

    #[test]
    fn compressed_point_rejected() {
        assert!(thumbprint(&[0x02; 33]).is_err());
    }
}
