//! SHA-256 helpers
//!
//! The chain hash, JWK thumbprint, KCV, and signer ids all use SHA-256;
//! this module is the single place the digest is named.

use sha2::{Digest, Sha256};

/// Hash bytes to a 32-byte SHA-256 digest
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// Hash bytes and render the digest as lowercase hex
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(sha256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
