//! Runtime configuration
//!
//! Defaults reproduce the documented service behavior; deployments override
//! individual knobs through TOML. Nothing here is secret.

use serde::{Deserialize, Serialize};

use crate::error::{KmsError, Result};

/// PBKDF2 calibration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Pbkdf2Config {
    /// Iterations used when calibration is skipped or fails
    pub default_iterations: u32,
    /// Calibration never goes below this
    pub min_iterations: u32,
    /// Lower edge of the target derivation window, in milliseconds
    pub target_min_ms: u64,
    /// Upper edge of the target derivation window, in milliseconds
    pub target_max_ms: u64,
}

impl Default for Pbkdf2Config {
    fn default() -> Self {
        Self {
            default_iterations: 600_000,
            min_iterations: 100_000,
            target_min_ms: 250,
            target_max_ms: 500,
        }
    }
}

/// Unlock attempt throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockLimitConfig {
    /// Failures tolerated inside the rolling window
    pub max_failures: u32,
    /// Rolling window, in seconds
    pub window_secs: u64,
    /// Cooldown applied once the window is exhausted, in seconds
    pub cooldown_secs: u64,
}

impl Default for UnlockLimitConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window_secs: 300,
            cooldown_secs: 3600,
        }
    }
}

/// Per-key signing throttle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignLimitConfig {
    /// Hard cap on signatures per key per hour
    pub max_per_hour: u32,
    /// Emit a warning once this many signatures land inside `warn_window_secs`
    pub warn_threshold: u32,
    /// Window for the warning counter, in seconds
    pub warn_window_secs: u64,
}

impl Default for SignLimitConfig {
    fn default() -> Self {
        Self {
            max_per_hour: 100,
            warn_threshold: 50,
            warn_window_secs: 600,
        }
    }
}

/// Audit log retention policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Keep at least this many entries
    pub min_entries: u64,
    /// Keep entries younger than this many days
    pub min_age_days: u64,
    /// Never prune below this many entries
    pub floor: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_entries: 500,
            min_age_days: 30,
            floor: 50,
        }
    }
}

/// Default quotas applied to new leases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Maximum lease TTL in hours
    pub max_ttl_hours: u32,
    /// Sliding-hour cap on issued JWTs
    pub tokens_per_hour: u32,
    /// Token-bucket refill rate, tokens per minute
    pub sends_per_minute: u32,
    /// Token-bucket capacity
    pub burst_sends: u32,
    /// Sliding-minute cap per endpoint label
    pub sends_per_minute_per_eid: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_ttl_hours: 720,
            tokens_per_hour: 100,
            sends_per_minute: 60,
            burst_sends: 100,
            sends_per_minute_per_eid: 30,
        }
    }
}

/// JWT issuance policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Default token lifetime when the caller supplies no `exp`, in seconds
    pub default_ttl_secs: u64,
    /// Maximum `exp` horizon accepted by policy, in seconds
    pub max_exp_secs: u64,
    /// Default `sub` claim when no subscription-derived contact exists
    pub default_subject: String,
    /// Default `aud` claim when the VAPID key has no subscription yet
    pub default_audience: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 900,
            max_exp_secs: 86_400,
            default_subject: "mailto:admin@example.com".to_string(),
            default_audience: "https://fcm.googleapis.com".to_string(),
        }
    }
}

/// Hashes of the deployed enclave bundle, embedded in delegation certs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationInfo {
    /// Hash of the code bundle in force
    pub code_hash: String,
    /// Hash of the manifest in force
    pub manifest_hash: String,
}

impl Default for AttestationInfo {
    fn default() -> Self {
        Self {
            code_hash: "unattested".to_string(),
            manifest_hash: "unattested".to_string(),
        }
    }
}

/// Top-level KMS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// PBKDF2 calibration knobs
    pub pbkdf2: Pbkdf2Config,
    /// Unlock throttling knobs
    pub unlock_limit: UnlockLimitConfig,
    /// Signing throttle knobs
    pub sign_limit: SignLimitConfig,
    /// Audit retention knobs
    pub retention: RetentionConfig,
    /// Lease defaults
    pub lease: LeaseConfig,
    /// JWT policy knobs
    pub jwt: JwtConfig,
    /// Bundle hashes embedded in delegation certificates
    pub attestation: AttestationInfo,
    /// Default request deadline, in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            pbkdf2: Pbkdf2Config::default(),
            unlock_limit: UnlockLimitConfig::default(),
            sign_limit: SignLimitConfig::default(),
            retention: RetentionConfig::default(),
            lease: LeaseConfig::default(),
            jwt: JwtConfig::default(),
            attestation: AttestationInfo::default(),
            request_timeout_ms: 10_000,
        }
    }
}

impl KmsConfig {
    /// Parse a TOML document, filling unspecified fields with defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input)
            .map_err(|e| KmsError::invalid_params(format!("config parse error: {e}")))
    }
}
