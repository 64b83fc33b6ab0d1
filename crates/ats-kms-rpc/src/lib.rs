//! RPC dispatch for the ATS KMS
//!
//! Wire shape: `{id, method, params, origin?}` in, `{id, result? |
//! error:{code,message}}` out. Parameters are validated before dispatch;
//! violations surface as `INVALID_PARAMS` and unknown methods as
//! `INVALID_REQUEST`.
//!
//! Fail-secure: when the host flags an integrity failure the lock flag
//! short-circuits every data-plane method to `KMS_LOCKED`; verification
//! and read-only audit methods stay available. Handlers run under a
//! deadline, but on a spawned task, so an in-flight audit append always
//! completes even when the caller has already seen the timeout.

pub mod params;

pub use params::{RpcError, RpcRequest, RpcResponse};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use ats_kms_audit::{AuditEventDraft, AuditLog};
use ats_kms_core::constants::ops;
use ats_kms_core::{b64url, KmsConfig, KmsEffects, KmsError, Result};
use ats_kms_credential::CredentialManager;
use ats_kms_engine::{IssueOptions, KeyEngine};
use ats_kms_store::{meta_keys, retention, MemoryStore, Store};

use params::*;

/// The assembled KMS service
pub struct Kms<S: Store> {
    store: Arc<S>,
    credentials: Arc<CredentialManager<S>>,
    engine: Arc<KeyEngine<S>>,
    audit: Arc<AuditLog<S>>,
    effects: Arc<dyn KmsEffects>,
    config: KmsConfig,
    locked: AtomicBool,
    requests_seen: AtomicU64,
}

/// Dispatches between retention sweeps
const RETENTION_INTERVAL: u64 = 256;

impl Kms<MemoryStore> {
    /// Assemble a KMS over a fresh in-memory store
    pub async fn in_memory(effects: Arc<dyn KmsEffects>, config: KmsConfig) -> Result<Arc<Self>> {
        Self::new(Arc::new(MemoryStore::new()), effects, config).await
    }
}

impl<S: Store + 'static> Kms<S> {
    /// Assemble a KMS over an existing store
    ///
    /// Initializes instance identity, records `kms.init`, applies audit
    /// retention, and restores the fail-secure flag.
    pub async fn new(
        store: Arc<S>,
        effects: Arc<dyn KmsEffects>,
        config: KmsConfig,
    ) -> Result<Arc<Self>> {
        let audit = Arc::new(AuditLog::new(
            Arc::clone(&store),
            Arc::clone(&effects),
            config.attestation.clone(),
        ));
        audit.init().await?;

        let dropped =
            retention::prune_audit(store.as_ref(), &config.retention, effects.now_ms()).await?;
        if dropped > 0 {
            audit
                .append_system(
                    AuditEventDraft::new(ops::AUDIT_PRUNE, "init")
                        .details(json!({ "dropped": dropped })),
                )
                .await?;
        }

        let credentials = Arc::new(CredentialManager::new(
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&effects),
            config.clone(),
        ));
        let engine = Arc::new(KeyEngine::new(
            Arc::clone(&store),
            Arc::clone(&credentials),
            Arc::clone(&audit),
            Arc::clone(&effects),
            config.clone(),
        ));

        let locked = store.get_meta(meta_keys::LOCKED).await?.is_some();
        Ok(Arc::new(Self {
            store,
            credentials,
            engine,
            audit,
            effects,
            config,
            locked: AtomicBool::new(locked),
            requests_seen: AtomicU64::new(0),
        }))
    }

    /// The credential manager component
    pub fn credentials(&self) -> &Arc<CredentialManager<S>> {
        &self.credentials
    }

    /// The key and lease engine component
    pub fn engine(&self) -> &Arc<KeyEngine<S>> {
        &self.engine
    }

    /// The audit log component
    pub fn audit(&self) -> &Arc<AuditLog<S>> {
        &self.audit
    }

    /// Whether fail-secure mode is engaged
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Engage or release fail-secure mode
    pub async fn set_locked(&self, locked: bool, request_id: &str) -> Result<()> {
        if locked {
            self.store.put_meta(meta_keys::LOCKED, vec![1]).await?;
        } else {
            self.store.delete_meta(meta_keys::LOCKED).await?;
        }
        self.locked.store(locked, Ordering::SeqCst);
        self.audit
            .append_system(
                AuditEventDraft::new(ops::KMS_LOCK, request_id)
                    .details(json!({ "locked": locked })),
            )
            .await?;
        Ok(())
    }

    /// Apply the audit retention policy, recording a system event if it ran
    pub async fn run_retention(&self) -> Result<u64> {
        let dropped = retention::prune_audit(
            self.store.as_ref(),
            &self.config.retention,
            self.effects.now_ms(),
        )
        .await?;
        if dropped > 0 {
            self.audit
                .append_system(
                    AuditEventDraft::new(ops::AUDIT_PRUNE, "retention")
                        .details(json!({ "dropped": dropped })),
                )
                .await?;
        }
        Ok(dropped)
    }

    /// Handle one request end to end
    pub async fn dispatch(self: &Arc<Self>, request: RpcRequest) -> RpcResponse {
        if request.id.is_empty() || request.method.is_empty() {
            return RpcResponse::err(
                request.id,
                "INVALID_REQUEST",
                "id and method are required",
            );
        }
        if self.is_locked() && !is_lock_exempt(&request.method) {
            return RpcResponse::err(
                request.id,
                "KMS_LOCKED",
                "KMS is locked pending integrity verification",
            );
        }

        // Retention runs at init and periodically as traffic flows.
        if self.requests_seen.fetch_add(1, Ordering::Relaxed) % RETENTION_INTERVAL
            == RETENTION_INTERVAL - 1
        {
            if let Err(err) = self.run_retention().await {
                tracing::warn!(error = %err, "periodic audit retention failed");
            }
        }

        let this = Arc::clone(self);
        let id = request.id.clone();
        let timeout_ms = self.config.request_timeout_ms;
        // The handler runs on its own task: a caller-side timeout must not
        // cancel an audit append that is already in flight.
        let task = tokio::spawn(async move {
            this.handle(&request.method, request.params, &request.id, request.origin)
                .await
        });
        match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(Ok(Ok(result))) => RpcResponse::ok(id, result),
            Ok(Ok(Err(err))) => RpcResponse::err(id, err.code(), err.to_string()),
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "request handler task failed");
                RpcResponse::err(id, "INTERNAL_ERROR", "request handler task failed")
            }
            Err(_) => {
                let err = KmsError::Timeout { timeout_ms };
                RpcResponse::err(id, err.code(), err.to_string())
            }
        }
    }

    async fn handle(
        &self,
        method: &str,
        params: Value,
        request_id: &str,
        _origin: Option<String>,
    ) -> Result<Value> {
        // An omitted params object deserializes as null; treat it as `{}`.
        let params = if params.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            params
        };
        match method {
            // Credential methods
            "setupPassphrase" => {
                let p: SetupPassphraseParams = parse(params)?;
                self.credentials
                    .setup_passphrase(&p.user_id, &p.passphrase, request_id)
                    .await?;
                Ok(json!({ "success": true }))
            }
            "setupPasskeyPRF" => {
                let p: SetupPasskeyPrfParams = parse(params)?;
                self.credentials
                    .setup_passkey_prf(
                        &p.user_id,
                        &p.credential_id,
                        &p.rp_id,
                        &p.app_salt,
                        &p.prf_output,
                        request_id,
                    )
                    .await?;
                Ok(json!({ "success": true }))
            }
            "setupPasskeyGate" => {
                let p: SetupPasskeyGateParams = parse(params)?;
                self.credentials
                    .setup_passkey_gate(&p.user_id, &p.credential_id, &p.rp_id, request_id)
                    .await?;
                Ok(json!({ "success": true }))
            }
            "addEnrollment" => {
                let p: AddEnrollmentParams = parse(params)?;
                let info = self
                    .credentials
                    .add_enrollment(&p.existing_creds, p.new_creds, request_id)
                    .await?;
                to_value(info)
            }
            "removeEnrollment" => {
                let p: RemoveEnrollmentParams = parse(params)?;
                self.credentials
                    .remove_enrollment(&p.enrollment_id, &p.creds, request_id)
                    .await?;
                Ok(json!({ "success": true }))
            }
            "getEnrollments" => {
                let p: UserScopeParams = parse(params)?;
                to_value(self.credentials.get_enrollments(p.user_id.as_deref()).await?)
            }
            "isSetup" => {
                let p: UserScopeParams = parse(params)?;
                Ok(json!(self.credentials.is_setup(p.user_id.as_deref()).await?))
            }
            "resetKMS" => {
                let _ = params;
                self.credentials.reset(request_id).await?;
                Ok(json!({ "success": true }))
            }

            // Key methods
            "generateVAPID" => {
                let p: CredsParams = parse(params)?;
                to_value(self.engine.generate_vapid(&p.creds, request_id).await?)
            }
            "regenerateVAPID" => {
                let p: CredsParams = parse(params)?;
                to_value(self.engine.regenerate_vapid(&p.creds, request_id).await?)
            }
            "getPublicKey" => {
                let p: KidParams = parse(params)?;
                to_value(self.engine.get_public_key(&p.kid).await?)
            }
            "getVAPIDKid" => {
                let p: UserIdParams = parse(params)?;
                Ok(json!({ "kid": self.engine.get_vapid_kid(&p.user_id).await? }))
            }
            "signJWT" => {
                let p: SignJwtParams = parse(params)?;
                let jwt = self
                    .engine
                    .sign_jwt(&p.kid, p.payload, &p.creds, request_id)
                    .await?;
                Ok(json!({ "jwt": jwt }))
            }

            // Lease methods
            "createLease" => {
                let p: CreateLeaseParams = parse(params)?;
                if p.user_id.as_deref().is_some_and(|u| u != p.creds.user_id()) {
                    return Err(KmsError::invalid_params(
                        "userId does not match the credentials",
                    ));
                }
                to_value(
                    self.engine
                        .create_lease(&p.creds, p.ttl_hours, p.auto_extend, request_id)
                        .await?,
                )
            }
            "extendLeases" => {
                let p: ExtendLeasesParams = parse(params)?;
                let outcomes = self
                    .engine
                    .extend_leases(p.leases, p.creds.as_ref(), request_id)
                    .await?;
                Ok(json!({ "results": outcomes }))
            }
            "issueVAPIDJWT" => {
                let p: IssueJwtParams = parse(params)?;
                let jwt = self
                    .engine
                    .issue_vapid_jwt(
                        &p.lease_id,
                        IssueOptions {
                            kid: p.kid,
                            jti: p.jti,
                            exp: p.exp,
                        },
                        request_id,
                    )
                    .await?;
                Ok(json!({ "jwt": jwt }))
            }
            "issueVAPIDJWTs" => {
                let p: IssueJwtBatchParams = parse(params)?;
                let jwts = self
                    .engine
                    .issue_vapid_jwts(&p.lease_id, p.count, p.kid, request_id)
                    .await?;
                Ok(json!({ "jwts": jwts }))
            }
            "getUserLeases" => {
                let p: UserIdParams = parse(params)?;
                to_value(self.engine.get_user_leases(&p.user_id).await?)
            }
            "verifyLease" => {
                let p: VerifyLeaseParams = parse(params)?;
                to_value(
                    self.engine
                        .verify_lease(&p.lease_id, p.delete_if_invalid, request_id)
                        .await?,
                )
            }

            // Push subscription methods
            "setPushSubscription" => {
                let p: SetSubscriptionParams = parse(params)?;
                self.engine
                    .set_push_subscription(&p.kid, p.subscription, request_id)
                    .await?;
                Ok(json!({ "success": true }))
            }
            "removePushSubscription" => {
                let p: KidParams = parse(params)?;
                self.engine
                    .remove_push_subscription(&p.kid, request_id)
                    .await?;
                Ok(json!({ "success": true }))
            }
            "getPushSubscription" => {
                let p: KidParams = parse(params)?;
                to_value(self.engine.get_push_subscription(&p.kid).await?)
            }

            // Audit methods
            "getAuditLog" => {
                let p: AuditLogParams = parse(params)?;
                let entries = self.audit.get_log(p.from, p.limit.min(1_000)).await?;
                Ok(json!({ "entries": entries }))
            }
            "verifyAuditChain" => {
                let p: VerifyChainParams = parse(params)?;
                let verification = self.audit.verify_chain(p.strict).await?;
                Ok(json!({
                    "valid": verification.valid,
                    "verified": verification.verified,
                    "errors": verification.errors,
                }))
            }
            "getAuditPublicKey" => {
                let p: UserIdParams = parse(params)?;
                let uak = self
                    .audit
                    .uak_public_key(&p.user_id)
                    .await?
                    .map(b64url::encode);
                let kiak = b64url::encode(self.audit.kiak_public_key().await?);
                Ok(json!({
                    "uak": uak,
                    "kiak": kiak,
                    "instanceId": self.audit.instance_id().await?,
                }))
            }

            // Host control
            "setLocked" => {
                let p: SetLockedParams = parse(params)?;
                self.set_locked(p.locked, request_id).await?;
                Ok(json!({ "success": true }))
            }
            "getStatus" => {
                let _ = params;
                Ok(json!({
                    "locked": self.is_locked(),
                    "auditEntries": self.store.audit_len().await?,
                    "setUp": self.credentials.is_setup(None).await?,
                }))
            }

            other => Err(KmsError::invalid_request(format!("unknown method {other:?}"))),
        }
    }
}

/// Methods that stay available while fail-secure mode is engaged
fn is_lock_exempt(method: &str) -> bool {
    matches!(
        method,
        "getAuditLog" | "verifyAuditChain" | "getAuditPublicKey" | "isSetup" | "getStatus"
            | "setLocked"
    )
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| KmsError::invalid_params(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| KmsError::internal(e.to_string()))
}
