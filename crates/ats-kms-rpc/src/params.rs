//! Request envelopes and validated parameter shapes
//!
//! Every method's parameters deserialize into one of these structs with
//! unknown fields rejected; a shape mismatch surfaces as `INVALID_PARAMS`
//! before any dispatch happens. Binary fields travel as raw byte arrays.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ats_kms_core::records::PushSubscription;
use ats_kms_credential::{AuthCredentials, NewEnrollment};
use ats_kms_engine::ExtendLeaseRequest;

/// Incoming RPC message
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    /// Correlation id echoed in the reply
    pub id: String,
    /// Method name
    pub method: String,
    /// Method parameters; `{}` when omitted
    #[serde(default)]
    pub params: Value,
    /// Origin reported by the transport
    #[serde(default)]
    pub origin: Option<String>,
}

/// Outgoing RPC reply
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    /// Correlation id of the request
    pub id: String,
    /// Present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Structured error surfaced to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Stable error code from the taxonomy
    pub code: String,
    /// Human-readable detail
    pub message: String,
}

impl RpcResponse {
    /// Successful reply
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Failed reply
    pub fn err(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SetupPassphraseParams {
    pub user_id: String,
    pub passphrase: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SetupPasskeyPrfParams {
    pub user_id: String,
    pub credential_id: Vec<u8>,
    pub rp_id: String,
    pub app_salt: Vec<u8>,
    pub prf_output: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SetupPasskeyGateParams {
    pub user_id: String,
    pub credential_id: Vec<u8>,
    pub rp_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct AddEnrollmentParams {
    pub existing_creds: AuthCredentials,
    pub new_creds: NewEnrollment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RemoveEnrollmentParams {
    pub enrollment_id: String,
    pub creds: AuthCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct UserScopeParams {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct CredsParams {
    pub creds: AuthCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct KidParams {
    pub kid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct UserIdParams {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SignJwtParams {
    pub kid: String,
    pub payload: Value,
    pub creds: AuthCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct CreateLeaseParams {
    /// Redundant with `creds`; cross-checked when present
    #[serde(default)]
    pub user_id: Option<String>,
    pub ttl_hours: u32,
    #[serde(default)]
    pub auto_extend: bool,
    pub creds: AuthCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ExtendLeasesParams {
    pub leases: Vec<ExtendLeaseRequest>,
    #[serde(default)]
    pub creds: Option<AuthCredentials>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct IssueJwtParams {
    pub lease_id: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub exp: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct IssueJwtBatchParams {
    pub lease_id: String,
    pub count: u32,
    #[serde(default)]
    pub kid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct VerifyLeaseParams {
    pub lease_id: String,
    #[serde(default)]
    pub delete_if_invalid: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SetSubscriptionParams {
    pub kid: String,
    pub subscription: PushSubscription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct AuditLogParams {
    #[serde(default)]
    pub from: u64,
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    500
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct VerifyChainParams {
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SetLockedParams {
    pub locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_rejected() {
        let result: Result<SetupPassphraseParams, _> = serde_json::from_value(json!({
            "userId": "u1",
            "passphrase": "hunter22!",
            "extra": true,
        }));
        assert!(result.is_err());
    }

    #[test]
    fn creds_union_parses_by_tag() {
        let params: SignJwtParams = serde_json::from_value(json!({
            "kid": "k",
            "payload": {"aud": "https://x"},
            "creds": {"method": "passphrase", "userId": "u1", "passphrase": "hunter22!"},
        }))
        .unwrap();
        assert_eq!(params.creds.user_id(), "u1");
    }
}
