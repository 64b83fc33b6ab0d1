//! Unified error type for all KMS operations
//!
//! Every fallible operation in the workspace returns [`KmsError`]. The enum
//! mirrors the error codes surfaced at the RPC boundary; [`KmsError::code`]
//! is the single mapping both the dispatcher and tests rely on.

use serde::{Deserialize, Serialize};

/// Unified error type for all KMS operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum KmsError {
    /// Malformed RPC envelope or unknown method
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// What was malformed
        message: String,
    },

    /// Parameter failed validation at the RPC boundary
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// Which parameter and why
        message: String,
    },

    /// No enrollment exists for the user
    #[error("KMS is not set up for this user")]
    NotSetup,

    /// Setup was called for a user that already has an enrollment
    #[error("KMS is already set up; use addEnrollment to add methods")]
    AlreadySetup,

    /// Passphrase shorter than the eight character minimum
    #[error("Passphrase must be at least {min} characters")]
    PassphraseTooShort {
        /// Minimum accepted length
        min: usize,
    },

    /// Passphrase failed the key confirmation value check
    #[error("Incorrect passphrase")]
    IncorrectPassphrase,

    /// Passkey assertion could not be used to recover the wrap key
    #[error("Passkey authentication failed: {message}")]
    PasskeyAuthenticationFailed {
        /// Failure detail
        message: String,
    },

    /// No enrollment exists for the presented credential
    #[error("Passkey not available: {message}")]
    PasskeyNotAvailable {
        /// Failure detail
        message: String,
    },

    /// Credential was enrolled with PRF but no PRF output was supplied
    #[error("Passkey PRF output required but not supported by this credential")]
    PasskeyPrfNotSupported,

    /// No wrapped key stored under the requested kid
    #[error("Key not found: {kid}")]
    KeyNotFound {
        /// The missing key identifier
        kid: String,
    },

    /// No lease stored under the requested id
    #[error("Lease not found: {lease_id}")]
    LeaseNotFound {
        /// The missing lease id
        lease_id: String,
    },

    /// Lease exists but its expiry has passed
    #[error("Lease expired: {lease_id}")]
    LeaseExpired {
        /// The expired lease id
        lease_id: String,
    },

    /// Lease references a kid that is no longer the user's current VAPID key
    #[error("Lease references a stale key: {lease_id}")]
    LeaseWrongKey {
        /// The stale lease id
        lease_id: String,
    },

    /// A lease quota rejected the operation
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        /// Which quota and its limit
        message: String,
    },

    /// Unlock attempts are throttled
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the cooldown lapses
        retry_after_secs: u64,
    },

    /// JWT payload violated RFC 8292 policy
    #[error("Policy violation: {reason}")]
    PolicyViolation {
        /// Machine-readable reason, e.g. `exp_too_long`
        reason: String,
    },

    /// A cryptographic primitive failed
    #[error("Crypto error: {message}")]
    Crypto {
        /// Original failure message
        message: String,
    },

    /// The persistent store failed
    #[error("Storage error: {message}")]
    Storage {
        /// Original failure message
        message: String,
    },

    /// Fail-secure mode is active; data-plane operations are refused
    #[error("KMS is locked pending integrity verification")]
    KmsLocked,

    /// The request exceeded its deadline
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded
        timeout_ms: u64,
    },

    /// Internal invariant failure
    #[error("Internal error: {message}")]
    Internal {
        /// Failure detail
        message: String,
    },
}

impl KmsError {
    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an invalid params error
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Create a crypto error, preserving the primitive's message
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a quota exceeded error
    pub fn quota(message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
        }
    }

    /// Create a policy violation error
    pub fn policy(reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            reason: reason.into(),
        }
    }

    /// The stable code surfaced as `error.code` at the RPC boundary
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::InvalidParams { .. } => "INVALID_PARAMS",
            Self::NotSetup => "NOT_SETUP",
            Self::AlreadySetup => "ALREADY_SETUP",
            Self::PassphraseTooShort { .. } => "PASSPHRASE_TOO_SHORT",
            Self::IncorrectPassphrase => "INCORRECT_PASSPHRASE",
            Self::PasskeyAuthenticationFailed { .. } => "PASSKEY_AUTHENTICATION_FAILED",
            Self::PasskeyNotAvailable { .. } => "PASSKEY_NOT_AVAILABLE",
            Self::PasskeyPrfNotSupported => "PASSKEY_PRF_NOT_SUPPORTED",
            Self::KeyNotFound { .. } => "KEY_NOT_FOUND",
            Self::LeaseNotFound { .. } => "LEASE_NOT_FOUND",
            Self::LeaseExpired { .. } => "LEASE_EXPIRED",
            Self::LeaseWrongKey { .. } => "LEASE_WRONG_KEY",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::PolicyViolation { .. } => "POLICY_VIOLATION",
            Self::Crypto { .. } => "CRYPTO_ERROR",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::KmsLocked => "KMS_LOCKED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, KmsError>;
