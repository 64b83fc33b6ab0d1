//! Chain hashing and entry construction

use ats_kms_core::canonical::to_canonical_json;
use ats_kms_core::constants::{GENESIS_PREVIOUS_HASH, KMS_VERSION};
use ats_kms_core::records::AuditEntry;
use ats_kms_core::{hashing, KmsError, Result};

/// Everything an operation reports about itself before chaining and signing
#[derive(Debug, Clone, Default)]
pub struct AuditEventDraft {
    /// Operation name
    pub op: String,
    /// Key the operation touched
    pub kid: Option<String>,
    /// Request id the operation ran under
    pub request_id: String,
    /// User the operation ran for
    pub user_id: Option<String>,
    /// Origin reported by the transport
    pub origin: Option<String>,
    /// Lease the operation ran under
    pub lease_id: Option<String>,
    /// Unix ms the Master Secret was decrypted
    pub unlock_time: Option<u64>,
    /// Unix ms the Master Secret was zeroized
    pub lock_time: Option<u64>,
    /// Operation-specific detail
    pub details: Option<serde_json::Value>,
}

impl AuditEventDraft {
    /// Start a draft for an operation
    pub fn new(op: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Attach the user
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the key id
    pub fn kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Attach the lease id
    pub fn lease(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    /// Attach detail JSON
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach the unlock window
    pub fn unlock_window(mut self, unlock_time: u64, lock_time: u64) -> Self {
        self.unlock_time = Some(unlock_time);
        self.lock_time = Some(lock_time);
        self
    }

    /// Turn the draft into an unchained, unsigned entry
    pub fn into_entry(
        self,
        seq_num: u64,
        timestamp: u64,
        previous_hash: String,
        signer: ats_kms_core::records::AuditSignerKind,
        signer_id: String,
        cert: Option<ats_kms_core::records::DelegationCert>,
    ) -> AuditEntry {
        let duration = match (self.unlock_time, self.lock_time) {
            (Some(unlock), Some(lock)) => Some(lock.saturating_sub(unlock)),
            _ => None,
        };
        AuditEntry {
            kms_version: KMS_VERSION,
            seq_num,
            timestamp,
            op: self.op,
            kid: self.kid,
            request_id: self.request_id,
            user_id: self.user_id,
            origin: self.origin,
            lease_id: self.lease_id,
            unlock_time: self.unlock_time,
            lock_time: self.lock_time,
            duration,
            details: self.details,
            previous_hash,
            chain_hash: String::new(),
            signer,
            signer_id,
            cert,
            sig: String::new(),
            sig_new: None,
        }
    }
}

/// Previous hash for the entry that will follow `last`
pub fn previous_hash_after(last: Option<&AuditEntry>) -> (u64, String) {
    match last {
        Some(entry) => (entry.seq_num + 1, entry.chain_hash.clone()),
        None => (0, GENESIS_PREVIOUS_HASH.to_string()),
    }
}

/// Canonical chain hash of an entry, excluding `sig`, `sigNew`, `chainHash`
pub fn compute_chain_hash(entry: &AuditEntry) -> Result<String> {
    let mut value = serde_json::to_value(entry)
        .map_err(|e| KmsError::internal(format!("entry serialization: {e}")))?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| KmsError::internal("entry did not serialize to an object"))?;
    fields.remove("sig");
    fields.remove("sigNew");
    fields.remove("chainHash");
    let canonical = to_canonical_json(&value)?;
    Ok(hex::encode(hashing::sha256(canonical)))
}

/// Decode a chain hash into the digest the signature covers
pub fn chain_hash_digest(chain_hash: &str) -> Result<Vec<u8>> {
    hex::decode(chain_hash).map_err(|e| KmsError::internal(format!("chain hash not hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ats_kms_core::records::AuditSignerKind;

    fn entry() -> AuditEntry {
        AuditEventDraft::new("sign", "r1")
            .user("u1")
            .kid("kid-1")
            .unlock_window(100, 150)
            .into_entry(
                0,
                200,
                GENESIS_PREVIOUS_HASH.to_string(),
                AuditSignerKind::Uak,
                "signer".into(),
                None,
            )
    }

    #[test]
    fn duration_derived_from_window() {
        assert_eq!(entry().duration, Some(50));
    }

    #[test]
    fn hash_ignores_sig_fields() {
        let mut a = entry();
        a.chain_hash = compute_chain_hash(&a).unwrap();
        let mut b = a.clone();
        b.sig = "forged".into();
        b.sig_new = Some("also forged".into());
        assert_eq!(a.chain_hash, compute_chain_hash(&b).unwrap());
    }

    #[test]
    fn hash_covers_every_other_field() {
        let a = entry();
        let mut b = a.clone();
        b.op = "setup".into();
        assert_ne!(
            compute_chain_hash(&a).unwrap(),
            compute_chain_hash(&b).unwrap()
        );
        let mut c = a.clone();
        c.previous_hash = "1".repeat(64);
        assert_ne!(
            compute_chain_hash(&a).unwrap(),
            compute_chain_hash(&c).unwrap()
        );
    }
}
