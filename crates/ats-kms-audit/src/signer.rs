//! Audit signer handles
//!
//! A signer is a 32-byte Ed25519 seed plus, for delegated signers, the
//! UAK-signed certificate that authorizes it. Seeds are borrowed so the
//! caller's zeroizing buffer stays the single owner.

use ats_kms_core::records::{AuditSignerKind, DelegationCert};
use ats_kms_core::{b64url, ed25519, hashing, Result};

/// The key signing one audit entry
pub enum AuditSigner<'a> {
    /// User Audit Key, available only inside an unlock scope
    Uak {
        /// HKDF-derived Ed25519 seed
        seed: &'a [u8],
    },
    /// Lease Audit Key with its delegation certificate
    Lak {
        /// Per-lease random Ed25519 seed
        seed: &'a [u8],
        /// UAK-signed delegation attached to every LAK entry
        cert: DelegationCert,
    },
    /// Instance Audit Key; the cert is absent before the first unlock
    Kiak {
        /// Per-install random Ed25519 seed
        seed: &'a [u8],
        /// UAK-signed delegation, once one exists
        cert: Option<DelegationCert>,
    },
}

impl AuditSigner<'_> {
    /// Which kind of key this is
    pub fn kind(&self) -> AuditSignerKind {
        match self {
            Self::Uak { .. } => AuditSignerKind::Uak,
            Self::Lak { .. } => AuditSignerKind::Lak,
            Self::Kiak { .. } => AuditSignerKind::Kiak,
        }
    }

    fn seed(&self) -> &[u8] {
        match self {
            Self::Uak { seed } | Self::Lak { seed, .. } | Self::Kiak { seed, .. } => seed,
        }
    }

    /// Raw Ed25519 public key for this signer
    pub fn public_key(&self) -> Result<[u8; 32]> {
        ed25519::public_key(self.seed())
    }

    /// `signerId`: base64url SHA-256 of the raw public key
    pub fn signer_id(&self) -> Result<String> {
        Ok(signer_id_for(&self.public_key()?))
    }

    /// Certificate to embed in the entry, if this signer carries one
    pub fn cert(&self) -> Option<DelegationCert> {
        match self {
            Self::Uak { .. } => None,
            Self::Lak { cert, .. } => Some(cert.clone()),
            Self::Kiak { cert, .. } => cert.clone(),
        }
    }

    /// Sign the raw chain-hash digest
    pub fn sign(&self, digest: &[u8]) -> Result<[u8; 64]> {
        ed25519::sign(self.seed(), digest)
    }
}

/// Compute the `signerId` for a raw Ed25519 public key
pub fn signer_id_for(public_key: &[u8]) -> String {
    b64url::encode(hashing::sha256(public_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_id_is_hash_of_public_key() {
        let signer = AuditSigner::Uak { seed: &[9u8; 32] };
        let public = signer.public_key().unwrap();
        assert_eq!(signer.signer_id().unwrap(), signer_id_for(&public));
        assert_eq!(signer.kind(), AuditSignerKind::Uak);
    }
}
