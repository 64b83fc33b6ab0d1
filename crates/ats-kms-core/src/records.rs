//! Persisted record shapes shared across the workspace
//!
//! Field names serialize in the store's wire convention (camelCase, tagged
//! unions); optional fields are omitted rather than serialized as null so
//! canonical hashing sees identical bytes on re-read. Every record carries
//! `kmsVersion`; decryption refuses records newer than
//! [`crate::constants::MAX_SUPPORTED_KMS_VERSION`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::aead::SealedBox;
use crate::constants::{ALG_VERSION, KMS_VERSION};
use crate::error::Result;

/// Authentication method discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnrollmentMethod {
    /// Passphrase stretched with PBKDF2
    #[serde(rename = "passphrase")]
    Passphrase,
    /// Passkey with the WebAuthn PRF extension
    #[serde(rename = "passkey-prf")]
    PasskeyPrf,
    /// Passkey without PRF; a stored pepper supplies the entropy
    #[serde(rename = "passkey-gate")]
    PasskeyGate,
}

impl EnrollmentMethod {
    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passphrase => "passphrase",
            Self::PasskeyPrf => "passkey-prf",
            Self::PasskeyGate => "passkey-gate",
        }
    }
}

/// Method-specific enrollment parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum EnrollmentConfig {
    /// PBKDF2-HMAC-SHA-256 parameters and key confirmation value
    #[serde(rename = "passphrase", rename_all = "camelCase")]
    Passphrase {
        /// Calibrated iteration count, reused verbatim at unlock
        iterations: u32,
        /// 16-byte PBKDF2 salt
        salt: Vec<u8>,
        /// Unix ms of the calibration run
        last_calibrated_at: u64,
        /// Fingerprint of the platform the calibration was measured on
        platform_hash: String,
        /// SHA-256 of the PBKDF2 verification half
        kcv: Vec<u8>,
    },
    /// HKDF over the credential's PRF output
    #[serde(rename = "passkey-prf", rename_all = "camelCase")]
    PasskeyPrf {
        /// WebAuthn credential id
        credential_id: Vec<u8>,
        /// Relying party id the credential is scoped to
        rp_id: String,
        /// 32-byte salt the host passes to the PRF extension
        app_salt: Vec<u8>,
        /// HKDF salt for the wrap key derivation
        hkdf_salt: Vec<u8>,
        /// HKDF info string in force for this enrollment
        info: String,
    },
    /// Credential-gated pepper; no PRF output available
    #[serde(rename = "passkey-gate", rename_all = "camelCase")]
    PasskeyGate {
        /// WebAuthn credential id
        credential_id: Vec<u8>,
        /// Relying party id the credential is scoped to
        rp_id: String,
        /// Pepper sealed under the credential-derived key
        pepper_wrapped: SealedBox,
        /// HKDF salt for the pepper wrap key
        pepper_salt: Vec<u8>,
    },
}

impl EnrollmentConfig {
    /// Method discriminant of this config
    pub fn method(&self) -> EnrollmentMethod {
        match self {
            Self::Passphrase { .. } => EnrollmentMethod::Passphrase,
            Self::PasskeyPrf { .. } => EnrollmentMethod::PasskeyPrf,
            Self::PasskeyGate { .. } => EnrollmentMethod::PasskeyGate,
        }
    }

    /// Credential id for passkey methods
    pub fn credential_id(&self) -> Option<&[u8]> {
        match self {
            Self::Passphrase { .. } => None,
            Self::PasskeyPrf { credential_id, .. } | Self::PasskeyGate { credential_id, .. } => {
                Some(credential_id)
            }
        }
    }
}

/// One enrollment of one user under one method
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRecord {
    /// Store key: `{userId}/{method}` or `{userId}/{method}/{credentialId}`
    pub id: String,
    /// Owner of the Master Secret
    pub user_id: String,
    /// Record format version
    pub kms_version: u32,
    /// Algorithm suite version
    pub alg_version: u32,
    /// Method-specific parameters
    #[serde(flatten)]
    pub config: EnrollmentConfig,
    /// Master Secret sealed under the method's wrap key
    #[serde(rename = "encryptedMS")]
    pub encrypted_ms: Vec<u8>,
    /// IV of the MS ciphertext
    #[serde(rename = "msIV")]
    pub ms_iv: Vec<u8>,
    /// AAD the MS ciphertext is bound to (informational; rebuilt at decrypt)
    #[serde(rename = "msAAD")]
    pub ms_aad: String,
    /// MS format version
    pub ms_version: u32,
    /// Unix ms of enrollment
    pub created_at: u64,
}

impl EnrollmentRecord {
    /// Compute the store key for a `(user, method, credential?)` triple
    pub fn storage_id(
        user_id: &str,
        method: EnrollmentMethod,
        credential_id: Option<&[u8]>,
    ) -> String {
        match credential_id {
            Some(credential_id) => format!(
                "{user_id}/{}/{}",
                method.as_str(),
                crate::b64url::encode(credential_id)
            ),
            None => format!("{user_id}/{}", method.as_str()),
        }
    }
}

/// What a wrapped key is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPurpose {
    /// VAPID signing key for Web Push
    #[serde(rename = "vapid")]
    Vapid,
    /// User audit key material
    #[serde(rename = "audit-user")]
    AuditUser,
    /// Instance audit key material
    #[serde(rename = "audit-instance")]
    AuditInstance,
}

impl KeyPurpose {
    /// Wire name of the purpose
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vapid => "vapid",
            Self::AuditUser => "audit-user",
            Self::AuditInstance => "audit-instance",
        }
    }
}

/// A Web Push subscription attached to a VAPID key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    /// Push service endpoint URL (HTTPS, allow-listed host)
    pub endpoint: String,
    /// Expiry reported by the push service, unix ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<u64>,
    /// Client ECDH public key, base64url
    pub p256dh: String,
    /// Client auth secret, base64url
    pub auth: String,
    /// Endpoint label used by per-eid quotas
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eid: Option<String>,
}

/// An application key wrapped under the MKEK
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyRecord {
    /// RFC 7638 thumbprint of the public key
    pub kid: String,
    /// Record format version
    pub kms_version: u32,
    /// Owner of the key
    pub user_id: String,
    /// PKCS#8 private key sealed under the MKEK
    pub wrapped_key: Vec<u8>,
    /// IV of the wrap ciphertext
    pub iv: Vec<u8>,
    /// AAD the wrap is bound to (informational; rebuilt at unwrap)
    pub aad: String,
    /// 65-byte uncompressed public point
    pub public_key_raw: Vec<u8>,
    /// JWS algorithm, always `ES256`
    pub alg: String,
    /// What the key is for
    pub purpose: KeyPurpose,
    /// Unix ms of generation
    pub created_at: u64,
    /// Unix ms of the most recent signing use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
    /// At most one push subscription; lost on regeneration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<PushSubscription>,
}

/// Per-lease issuance limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseQuotas {
    /// Sliding-hour cap on issued JWTs
    pub tokens_per_hour: u32,
    /// Token-bucket refill rate, tokens per minute
    pub sends_per_minute: u32,
    /// Token-bucket capacity
    pub burst_sends: u32,
    /// Sliding-minute cap per endpoint label
    pub sends_per_minute_per_eid: u32,
}

/// Mutable quota bookkeeping persisted with the lease
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    /// Issue timestamps inside the current sliding hour, unix ms
    pub hour_window: Vec<u64>,
    /// Tokens currently in the bucket
    pub bucket_tokens: f64,
    /// Unix ms of the last bucket refill
    pub bucket_refilled_at: u64,
    /// Issue timestamps per endpoint label inside the sliding minute
    pub eid_windows: BTreeMap<String, Vec<u64>>,
}

/// Which audit key signed an entry or is delegated by a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSignerKind {
    /// User Audit Key, derived from the Master Secret
    #[serde(rename = "UAK")]
    Uak,
    /// Lease Audit Key, delegated per lease
    #[serde(rename = "LAK")]
    Lak,
    /// KMS Instance Audit Key, delegated per install
    #[serde(rename = "KIAK")]
    Kiak,
}

/// A UAK-signed delegation of audit signing authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationCert {
    /// Always `audit-delegation`
    #[serde(rename = "type")]
    pub cert_type: String,
    /// Certificate format version
    pub version: u32,
    /// LAK or KIAK
    pub signer_kind: AuditSignerKind,
    /// Lease the delegate is scoped to (LAK certs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// Instance the delegate is scoped to (KIAK certs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Delegate Ed25519 public key, base64url
    pub delegate_pub: String,
    /// Operations the delegate may sign; `*` means any
    pub scope: Vec<String>,
    /// Validity start, unix ms
    pub not_before: u64,
    /// Validity end, unix ms; open-ended when null
    pub not_after: Option<u64>,
    /// Hash of the enclave code bundle in force at issuance
    pub code_hash: String,
    /// Hash of the enclave manifest in force at issuance
    pub manifest_hash: String,
    /// Record format version
    pub kms_version: u32,
    /// UAK signature over the canonical unsigned certificate, base64url
    pub sig: String,
}

/// A time-bounded capability to issue JWTs without user authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Lease id (UUID)
    pub lease_id: String,
    /// Owner of the lease
    pub user_id: String,
    /// Requested TTL in hours
    pub ttl_hours: u32,
    /// Unix ms of creation
    pub created_at: u64,
    /// Unix ms of expiry
    pub exp: u64,
    /// Whether the lease may be extended without user authentication
    pub auto_extend: bool,
    /// Issuance limits
    pub quotas: LeaseQuotas,
    /// Mutable quota bookkeeping
    pub quota_state: QuotaState,
    /// VAPID private key (PKCS#8) sealed under the SessionKEK
    pub wrapped_lease_key: Vec<u8>,
    /// IV of that ciphertext
    #[serde(rename = "wrappedLeaseKeyIV")]
    pub wrapped_lease_key_iv: Vec<u8>,
    /// 32-byte HKDF salt the SessionKEK was derived with
    pub lease_salt: Vec<u8>,
    /// kid of the VAPID key the lease references
    pub kid: String,
    /// UAK-signed delegation for the lease audit key
    pub lak_delegation_cert: DelegationCert,
    /// Lease Audit Key seed; persists so background issuance survives restarts
    pub lak_seed: Vec<u8>,
    /// SessionKEK bytes; handed out only to the issuing engine
    pub session_kek: Vec<u8>,
}

/// One hash-chained, signed audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Record format version, always 2
    pub kms_version: u32,
    /// Monotonically increasing sequence number, 0-based
    pub seq_num: u64,
    /// Unix ms the entry was appended
    pub timestamp: u64,
    /// Operation name
    pub op: String,
    /// Key the operation touched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Request id the operation ran under
    pub request_id: String,
    /// User the operation ran for; absent for system events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Origin reported by the transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Lease the operation ran under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// Unix ms the Master Secret was decrypted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_time: Option<u64>,
    /// Unix ms the Master Secret was zeroized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_time: Option<u64>,
    /// `lock_time - unlock_time`, in ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Operation-specific detail, e.g. `policy_violation` reasons
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// `chainHash` of the previous entry; 64 zero hex chars at genesis
    pub previous_hash: String,
    /// SHA-256 (hex) of the canonical entry minus `sig`/`chainHash`
    pub chain_hash: String,
    /// Which key kind signed this entry
    pub signer: AuditSignerKind,
    /// base64url SHA-256 of the signer's raw public key
    pub signer_id: String,
    /// Delegation certificate; required for LAK entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<DelegationCert>,
    /// Ed25519 signature over the raw chain hash, base64url
    pub sig: String,
    /// Reserved migration slot for a successor signature scheme
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig_new: Option<String>,
}

/// AAD binding the Master Secret ciphertext to its enrollment context
pub fn ms_aad(method: EnrollmentMethod, credential_id: Option<&[u8]>) -> Result<String> {
    let mut fields = json!({
        "kmsVersion": KMS_VERSION,
        "method": method.as_str(),
        "algVersion": ALG_VERSION,
        "purpose": "ms-encryption",
    });
    if let Some(credential_id) = credential_id {
        fields["credentialId"] = json!(crate::b64url::encode(credential_id));
    }
    crate::canonical::to_canonical_json(&fields)
}

/// AAD binding a wrapped application key to its identity
pub fn wrapped_key_aad(
    kid: &str,
    alg: &str,
    purpose: KeyPurpose,
    created_at: u64,
) -> Result<String> {
    crate::canonical::to_canonical_json(&json!({
        "kmsVersion": KMS_VERSION,
        "kid": kid,
        "alg": alg,
        "purpose": purpose.as_str(),
        "createdAt": created_at,
        "keyType": "private-pkcs8",
    }))
}

/// AAD binding a lease's key copy to the lease
pub fn lease_key_aad(lease_id: &str, kid: &str) -> Result<String> {
    crate::canonical::to_canonical_json(&json!({
        "kmsVersion": KMS_VERSION,
        "leaseId": lease_id,
        "kid": kid,
        "purpose": "lease-key",
    }))
}
