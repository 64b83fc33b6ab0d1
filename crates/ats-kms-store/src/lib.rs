//! Persistent store behind the KMS
//!
//! Five logical collections: `enrollments`, `wrapped_keys`, `leases`, the
//! append-only `audit_entries`, and a small `meta` map. The contract is
//! deliberately narrow: single-record atomicity, ordered scans, and
//! append-ordering for audit entries. No compound transactions.
//!
//! [`MemoryStore`] is the reference implementation; alternative backends
//! implement [`Store`] and inherit the same test suite semantics.

pub mod memory;
pub mod retention;

pub use memory::MemoryStore;

use async_trait::async_trait;

use ats_kms_core::records::{AuditEntry, EnrollmentRecord, LeaseRecord, WrappedKeyRecord};
use ats_kms_core::Result;

/// Storage contract for all KMS collections
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace an enrollment record
    async fn put_enrollment(&self, record: EnrollmentRecord) -> Result<()>;

    /// Fetch an enrollment by its storage id
    async fn get_enrollment(&self, id: &str) -> Result<Option<EnrollmentRecord>>;

    /// Delete an enrollment; returns whether it existed
    async fn delete_enrollment(&self, id: &str) -> Result<bool>;

    /// All enrollments, optionally restricted to one user, ordered by id
    async fn scan_enrollments(&self, user_id: Option<&str>) -> Result<Vec<EnrollmentRecord>>;

    /// Insert or replace a wrapped key record
    async fn put_wrapped_key(&self, record: WrappedKeyRecord) -> Result<()>;

    /// Fetch a wrapped key by kid
    async fn get_wrapped_key(&self, kid: &str) -> Result<Option<WrappedKeyRecord>>;

    /// Delete a wrapped key; returns whether it existed
    async fn delete_wrapped_key(&self, kid: &str) -> Result<bool>;

    /// All wrapped keys, optionally restricted to one user, ordered by kid
    async fn scan_wrapped_keys(&self, user_id: Option<&str>) -> Result<Vec<WrappedKeyRecord>>;

    /// Insert or replace a lease record
    async fn put_lease(&self, record: LeaseRecord) -> Result<()>;

    /// Fetch a lease by id
    async fn get_lease(&self, lease_id: &str) -> Result<Option<LeaseRecord>>;

    /// Delete a lease; returns whether it existed
    async fn delete_lease(&self, lease_id: &str) -> Result<bool>;

    /// All leases, optionally restricted to one user, ordered by id
    async fn scan_leases(&self, user_id: Option<&str>) -> Result<Vec<LeaseRecord>>;

    /// Append an audit entry; `seq_num` must continue the chain
    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;

    /// Fetch an audit entry by sequence number
    async fn get_audit(&self, seq_num: u64) -> Result<Option<AuditEntry>>;

    /// Audit entries with `seq_num >= from`, ascending, at most `limit`
    async fn scan_audit(&self, from: u64, limit: usize) -> Result<Vec<AuditEntry>>;

    /// The most recently appended audit entry
    async fn last_audit(&self) -> Result<Option<AuditEntry>>;

    /// Number of retained audit entries
    async fn audit_len(&self) -> Result<u64>;

    /// Drop audit entries with `seq_num < keep_from`; returns how many
    async fn prune_audit(&self, keep_from: u64) -> Result<u64>;

    /// Insert or replace a meta value
    async fn put_meta(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch a meta value
    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a meta value; returns whether it existed
    async fn delete_meta(&self, key: &str) -> Result<bool>;

    /// Wipe every collection (user-initiated reset)
    async fn clear_all(&self) -> Result<()>;
}

/// Meta keys used across the workspace
pub mod meta_keys {
    /// Per-user MKEK HKDF salt: `mkek-salt/{userId}`
    pub fn mkek_salt(user_id: &str) -> String {
        format!("mkek-salt/{user_id}")
    }

    /// Per-user cached UAK public key: `uak-pub/{userId}`
    pub fn uak_pub(user_id: &str) -> String {
        format!("uak-pub/{user_id}")
    }

    /// Cached raw public key by signer id: `audit-pub/{signerId}`
    pub fn audit_pub(signer_id: &str) -> String {
        format!("audit-pub/{signer_id}")
    }

    /// Instance id of this install
    pub const INSTANCE_ID: &str = "instance-id";

    /// KIAK seed for this install
    pub const KIAK_SEED: &str = "kiak-seed";

    /// UAK-signed KIAK delegation certificate
    pub const KIAK_CERT: &str = "kiak-cert";

    /// User whose UAK signed the KIAK certificate
    pub const KIAK_CERT_ISSUER: &str = "kiak-cert-issuer";

    /// Fail-secure lock flag
    pub const LOCKED: &str = "locked";
}
