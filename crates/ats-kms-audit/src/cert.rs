//! Delegation certificates
//!
//! A small PKI rooted in the UAK: lease audit keys and the instance audit
//! key are authorized by UAK-signed certificates carrying a scope list and
//! a validity window. The signature covers the canonical JSON of the
//! certificate with its `sig` field removed.

use ats_kms_core::canonical::to_canonical_json;
use ats_kms_core::config::AttestationInfo;
use ats_kms_core::constants::KMS_VERSION;
use ats_kms_core::records::{AuditSignerKind, DelegationCert};
use ats_kms_core::{b64url, ed25519, KmsError, Result};

/// Wire value of the certificate `type` field
pub const CERT_TYPE: &str = "audit-delegation";

/// Certificate format version
pub const CERT_VERSION: u32 = 1;

/// Scope entry matching any operation
pub const SCOPE_ANY: &str = "*";

fn signing_input(cert: &DelegationCert) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(cert)
        .map_err(|e| KmsError::internal(format!("cert serialization: {e}")))?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| KmsError::internal("cert did not serialize to an object"))?;
    fields.remove("sig");
    Ok(to_canonical_json(&value)?.into_bytes())
}

/// Parameters for a new delegation certificate
pub struct DelegationParams<'a> {
    /// LAK or KIAK
    pub signer_kind: AuditSignerKind,
    /// Lease the delegate is scoped to (LAK)
    pub lease_id: Option<String>,
    /// Instance the delegate is scoped to (KIAK)
    pub instance_id: Option<String>,
    /// Raw Ed25519 public key of the delegate
    pub delegate_public_key: &'a [u8],
    /// Operations the delegate may sign
    pub scope: Vec<String>,
    /// Validity start, unix ms
    pub not_before: u64,
    /// Validity end, unix ms; open-ended when `None`
    pub not_after: Option<u64>,
    /// Bundle hashes in force at issuance
    pub attestation: &'a AttestationInfo,
}

/// Build and UAK-sign a delegation certificate
pub fn issue(uak_seed: &[u8], params: DelegationParams<'_>) -> Result<DelegationCert> {
    if params.signer_kind == AuditSignerKind::Uak {
        return Err(KmsError::internal("the UAK is the root; it is never delegated"));
    }
    let mut cert = DelegationCert {
        cert_type: CERT_TYPE.to_string(),
        version: CERT_VERSION,
        signer_kind: params.signer_kind,
        lease_id: params.lease_id,
        instance_id: params.instance_id,
        delegate_pub: b64url::encode(params.delegate_public_key),
        scope: params.scope,
        not_before: params.not_before,
        not_after: params.not_after,
        code_hash: params.attestation.code_hash.clone(),
        manifest_hash: params.attestation.manifest_hash.clone(),
        kms_version: KMS_VERSION,
        sig: String::new(),
    };
    let signature = ed25519::sign(uak_seed, &signing_input(&cert)?)?;
    cert.sig = b64url::encode(signature);
    Ok(cert)
}

/// Why a certificate was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertRejection {
    /// Certificate signature did not verify under the UAK
    #[error("cert signature invalid")]
    BadSignature,
    /// Entry timestamp falls outside the validity window
    #[error("cert not valid at {at}")]
    Stale {
        /// The out-of-window timestamp
        at: u64,
    },
    /// Operation is not covered by the scope list
    #[error("op {op:?} outside cert scope")]
    OutOfScope {
        /// The refused operation
        op: String,
    },
    /// Structural problem with the certificate
    #[error("malformed cert: {0}")]
    Malformed(String),
}

/// Validate a certificate against the UAK public key, a timestamp, and an op
///
/// All three checks must pass before the entry signature is even looked at;
/// a delegate signature on an out-of-scope operation is worthless.
pub fn validate(
    cert: &DelegationCert,
    uak_public_key: &[u8],
    at: u64,
    op: &str,
) -> std::result::Result<Vec<u8>, CertRejection> {
    if cert.cert_type != CERT_TYPE || cert.version != CERT_VERSION {
        return Err(CertRejection::Malformed(format!(
            "type {:?} version {}",
            cert.cert_type, cert.version
        )));
    }
    let input = signing_input(cert).map_err(|e| CertRejection::Malformed(e.to_string()))?;
    let signature = b64url::decode(&cert.sig)
        .map_err(|_| CertRejection::Malformed("sig not base64url".into()))?;
    match ed25519::verify(uak_public_key, &input, &signature) {
        Ok(true) => {}
        _ => return Err(CertRejection::BadSignature),
    }
    if at < cert.not_before || cert.not_after.is_some_and(|end| at > end) {
        return Err(CertRejection::Stale { at });
    }
    let in_scope = cert
        .scope
        .iter()
        .any(|s| s == SCOPE_ANY || s == op);
    if !in_scope {
        return Err(CertRejection::OutOfScope { op: op.to_string() });
    }
    b64url::decode(&cert.delegate_pub)
        .map_err(|_| CertRejection::Malformed("delegatePub not base64url".into()))
}
