//! Protocol constants and versioned domain-separation strings
//!
//! Every HKDF derivation uses a fixed, versioned `info` string. Re-using
//! derived bytes across purposes is forbidden; a new purpose gets a new
//! string and a version bump gets a new `/vN` suffix.

/// Record format version carried by every persisted record
pub const KMS_VERSION: u32 = 2;

/// Algorithm suite version for enrollment ciphertexts
pub const ALG_VERSION: u32 = 1;

/// Maximum `kmsVersion` this build will agree to decrypt
pub const MAX_SUPPORTED_KMS_VERSION: u32 = KMS_VERSION;

/// HKDF info for the Master Key Encryption Key
pub const INFO_MKEK: &[u8] = b"ATS/KMS/MKEK/v1";

/// HKDF info for per-lease SessionKEKs
pub const INFO_SESSION_KEK: &[u8] = b"ATS/KMS/SessionKEK/v1";

/// HKDF info for the User Audit Key seed
pub const INFO_UAK: &[u8] = b"ATS/KMS/UAK/v1";

/// HKDF info for the passkey-gate pepper wrap key
pub const INFO_PEPPER: &[u8] = b"ATS/KMS/pepper/v1";

/// HKDF info for the passkey-PRF wrap key
pub const INFO_PRF_WRAP: &[u8] = b"ATS/KMS/PRF-wrap/v1";

/// HKDF info for the passkey-gate MS wrap key (derived from the pepper)
pub const INFO_GATE_WRAP: &[u8] = b"ATS/KMS/gate-wrap/v1";

/// Master Secret length in bytes
pub const MS_LEN: usize = 32;

/// AES-GCM key length in bytes
pub const AES_KEY_LEN: usize = 32;

/// AES-GCM IV length in bytes
pub const AES_IV_LEN: usize = 12;

/// PBKDF2 salt length in bytes
pub const PBKDF2_SALT_LEN: usize = 16;

/// MKEK HKDF salt length in bytes
pub const MKEK_SALT_LEN: usize = 16;

/// Lease salt length in bytes
pub const LEASE_SALT_LEN: usize = 32;

/// Passkey-PRF application salt length in bytes
pub const PRF_APP_SALT_LEN: usize = 32;

/// `previousHash` of the genesis audit entry: 64 zero hex characters
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Hosts (and their subdomains) accepted for push subscription endpoints
pub const PUSH_ENDPOINT_ALLOWED_HOSTS: &[&str] = &[
    "fcm.googleapis.com",
    "web.push.apple.com",
    "updates.push.services.mozilla.com",
    "notify.windows.com",
];

/// Audit operation names
pub mod ops {
    /// First-time enrollment of a user
    pub const SETUP: &str = "setup";
    /// Additional enrollment under an existing MS
    pub const ENROLLMENT_ADD: &str = "enrollment.add";
    /// Enrollment removal
    pub const ENROLLMENT_REMOVE: &str = "enrollment.remove";
    /// VAPID keypair generation
    pub const VAPID_GENERATE: &str = "vapid.generate";
    /// VAPID keypair regeneration
    pub const VAPID_REGENERATE: &str = "vapid.regenerate";
    /// User-authenticated JWT signature
    pub const SIGN: &str = "sign";
    /// JWT payload rejected by RFC 8292 policy
    pub const POLICY_VIOLATION: &str = "policy_violation";
    /// Lease creation
    pub const LEASE_CREATE: &str = "lease.create";
    /// Background JWT issuance under a lease
    pub const LEASE_ISSUE: &str = "lease.issue";
    /// Lease extension
    pub const LEASE_EXTEND: &str = "lease.extend";
    /// Expired lease observed or deleted
    pub const LEASE_EXPIRE: &str = "lease.expire";
    /// Lease quota rejection
    pub const LEASE_QUOTA_EXCEEDED: &str = "lease.quota_exceeded";
    /// Failed unlock attempt
    pub const UNLOCK_FAILED: &str = "unlock_failed";
    /// Push subscription stored
    pub const SUBSCRIPTION_SET: &str = "subscription.set";
    /// Push subscription removed
    pub const SUBSCRIPTION_REMOVE: &str = "subscription.remove";
    /// Instance initialization
    pub const KMS_INIT: &str = "kms.init";
    /// Full store reset
    pub const KMS_RESET: &str = "kms.reset";
    /// Fail-secure lock engaged
    pub const KMS_LOCK: &str = "kms.lock";
    /// Audit retention pruning run
    pub const AUDIT_PRUNE: &str = "audit.prune";
}
