//! The unlock scope
//!
//! [`UnlockContext`] is the only place a decrypted Master Secret exists.
//! It owns the MS in a zeroize-on-drop buffer and hands out derived keys;
//! the MS itself never leaves the crate. Dropping the context wipes the
//! secret on every exit path.

use ats_kms_core::constants::{AES_KEY_LEN, INFO_MKEK, INFO_SESSION_KEK, INFO_UAK};
use ats_kms_core::kdf::hkdf_sha256;
use ats_kms_core::{Result, SecretBytes};

/// Scoped access to a decrypted Master Secret
pub struct UnlockContext {
    user_id: String,
    ms: SecretBytes,
    mkek_salt: Vec<u8>,
    unlocked_at: u64,
}

impl UnlockContext {
    pub(crate) fn new(
        user_id: String,
        ms: SecretBytes,
        mkek_salt: Vec<u8>,
        unlocked_at: u64,
    ) -> Self {
        Self {
            user_id,
            ms,
            mkek_salt,
            unlocked_at,
        }
    }

    /// User this scope is unlocked for
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Unix ms the MS was decrypted
    pub fn unlocked_at(&self) -> u64 {
        self.unlocked_at
    }

    /// The Master Secret; crate-internal, used only to enroll new methods
    pub(crate) fn master_secret(&self) -> &SecretBytes {
        &self.ms
    }

    /// Derive the MKEK wrapping application keys
    pub fn derive_mkek(&self) -> Result<SecretBytes> {
        hkdf_sha256(
            self.ms.as_slice(),
            &self.mkek_salt,
            INFO_MKEK,
            AES_KEY_LEN,
        )
    }

    /// Derive the SessionKEK for a lease salt
    pub fn derive_session_kek(&self, lease_salt: &[u8]) -> Result<SecretBytes> {
        hkdf_sha256(self.ms.as_slice(), lease_salt, INFO_SESSION_KEK, AES_KEY_LEN)
    }

    /// Derive the User Audit Key seed
    ///
    /// Fixed empty salt: the UAK anchors chain verification and must come
    /// out identical at every unlock.
    pub fn derive_uak_seed(&self) -> Result<SecretBytes> {
        hkdf_sha256(self.ms.as_slice(), &[], INFO_UAK, 32)
    }
}

impl std::fmt::Debug for UnlockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockContext")
            .field("user_id", &self.user_id)
            .field("unlocked_at", &self.unlocked_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> UnlockContext {
        UnlockContext::new(
            "u1".into(),
            SecretBytes::from_slice(&[7u8; 32]),
            vec![9u8; 16],
            1_000,
        )
    }

    #[test]
    fn uak_is_deterministic_across_unlocks() {
        let a = context().derive_uak_seed().unwrap();
        let b = context().derive_uak_seed().unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn derived_keys_differ_by_purpose() {
        let ctx = context();
        let mkek = ctx.derive_mkek().unwrap();
        let session = ctx.derive_session_kek(&[1u8; 32]).unwrap();
        let uak = ctx.derive_uak_seed().unwrap();
        assert_ne!(mkek.as_slice(), session.as_slice());
        assert_ne!(mkek.as_slice(), uak.as_slice());
    }

    #[test]
    fn session_kek_depends_on_lease_salt() {
        let ctx = context();
        let a = ctx.derive_session_kek(&[1u8; 32]).unwrap();
        let b = ctx.derive_session_kek(&[2u8; 32]).unwrap();
        assert_ne!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn debug_never_prints_secret() {
        let rendered = format!("{:?}", context());
        assert!(!rendered.contains("ms"));
    }
}
