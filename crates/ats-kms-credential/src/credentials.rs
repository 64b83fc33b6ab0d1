//! Authentication credential types
//!
//! `AuthCredentials` is the discriminated union every authenticated RPC
//! carries. The WebAuthn ceremony itself happens in the host; the KMS
//! consumes its outputs (credential id, PRF output).

use serde::{Deserialize, Serialize};

use ats_kms_core::records::EnrollmentMethod;

/// Proof of user authority for one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum AuthCredentials {
    /// Knowledge of the enrolled passphrase
    #[serde(rename = "passphrase", rename_all = "camelCase")]
    Passphrase {
        /// User the credentials belong to
        user_id: String,
        /// The passphrase itself
        passphrase: String,
    },
    /// A fresh PRF evaluation from the enrolled passkey
    #[serde(rename = "passkey-prf", rename_all = "camelCase")]
    PasskeyPrf {
        /// User the credentials belong to
        user_id: String,
        /// WebAuthn credential id
        credential_id: Vec<u8>,
        /// 32-byte PRF extension output for the enrolled appSalt
        prf_output: Vec<u8>,
    },
    /// A completed assertion from the enrolled gate passkey
    #[serde(rename = "passkey-gate", rename_all = "camelCase")]
    PasskeyGate {
        /// User the credentials belong to
        user_id: String,
        /// WebAuthn credential id
        credential_id: Vec<u8>,
    },
}

impl AuthCredentials {
    /// User these credentials authenticate
    pub fn user_id(&self) -> &str {
        match self {
            Self::Passphrase { user_id, .. }
            | Self::PasskeyPrf { user_id, .. }
            | Self::PasskeyGate { user_id, .. } => user_id,
        }
    }

    /// Method discriminant
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

/// Parameters for enrolling an additional method under the existing MS
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum NewEnrollment {
    /// Add a passphrase
    #[serde(rename = "passphrase", rename_all = "camelCase")]
    Passphrase {
        /// The new passphrase
        passphrase: String,
    },
    /// Add a PRF-capable passkey
    #[serde(rename = "passkey-prf", rename_all = "camelCase")]
    PasskeyPrf {
        /// WebAuthn credential id
        credential_id: Vec<u8>,
        /// Relying party id
        rp_id: String,
        /// Salt the host evaluated the PRF extension with
        app_salt: Vec<u8>,
        /// 32-byte PRF output for that salt
        prf_output: Vec<u8>,
    },
    /// Add a gate passkey
    #[serde(rename = "passkey-gate", rename_all = "camelCase")]
    PasskeyGate {
        /// WebAuthn credential id
        credential_id: Vec<u8>,
        /// Relying party id
        rp_id: String,
    },
}

/// Enrollment metadata returned to callers; never includes key material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentInfo {
    /// Storage id of the enrollment
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Method name
    pub method: String,
    /// Credential id, base64url, for passkey methods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    /// Unix ms of enrollment
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_tag_by_method() {
        let creds = AuthCredentials::Passphrase {
            user_id: "u1".into(),
            passphrase: "hunter22!".into(),
        };
        let value = serde_json::to_value(&creds).unwrap();
        assert_eq!(value["method"], "passphrase");
        assert_eq!(value["userId"], "u1");
        let parsed: AuthCredentials = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.method(), EnrollmentMethod::Passphrase);
    }
}
