//! VAPID key operations, JWT signing, and the lease engine
//!
//! Application keys are ES256 keypairs whose private halves exist outside
//! an unlock scope only as PKCS#8 ciphertext under the user's MKEK. The
//! `kid` is the RFC 7638 thumbprint of the public key, so identifiers are
//! content-derived. Signing enforces RFC 8292 policy before any key
//! material is touched, and every operation lands in the audit chain.

pub mod jwt;
pub mod lease;
pub mod quota;
pub mod sign_limit;
pub mod subscription;

pub use lease::{
    ExtendLeaseRequest, ExtendOutcome, ExtendStatus, IssueOptions, LeaseGrant, LeaseInfo,
    VerifyLeaseResult,
};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ats_kms_audit::{AuditEventDraft, AuditLog};
use ats_kms_core::aead::{self, SealedBox};
use ats_kms_core::constants::{self, ops};
use ats_kms_core::es256::Es256KeyPair;
use ats_kms_core::records::{
    wrapped_key_aad, KeyPurpose, PushSubscription, WrappedKeyRecord,
};
use ats_kms_core::{b64url, jwk, KmsConfig, KmsEffects, KmsError, Result, SecretBytes};
use ats_kms_credential::{AuthCredentials, CredentialManager};
use ats_kms_store::Store;

use sign_limit::SignRateLimiter;

/// Public identity of a VAPID key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VapidKey {
    /// RFC 7638 thumbprint
    pub kid: String,
    /// 65-byte uncompressed public point, base64url
    pub public_key: String,
}

/// Key, JWT, and lease operations over a [`Store`]
pub struct KeyEngine<S: Store> {
    store: Arc<S>,
    credentials: Arc<CredentialManager<S>>,
    audit: Arc<AuditLog<S>>,
    effects: Arc<dyn KmsEffects>,
    config: KmsConfig,
    session_keks: async_lock::Mutex<HashMap<String, SecretBytes>>,
    sign_limiter: async_lock::Mutex<SignRateLimiter>,
}

impl<S: Store> KeyEngine<S> {
    /// Create an engine over the given collaborators
    pub fn new(
        store: Arc<S>,
        credentials: Arc<CredentialManager<S>>,
        audit: Arc<AuditLog<S>>,
        effects: Arc<dyn KmsEffects>,
        config: KmsConfig,
    ) -> Self {
        let sign_limiter = SignRateLimiter::new(config.sign_limit.clone());
        Self {
            store,
            credentials,
            audit,
            effects,
            config,
            session_keks: async_lock::Mutex::new(HashMap::new()),
            sign_limiter: async_lock::Mutex::new(sign_limiter),
        }
    }

    /// Generate the user's VAPID keypair
    pub async fn generate_vapid(
        &self,
        creds: &AuthCredentials,
        request_id: &str,
    ) -> Result<VapidKey> {
        let user_id = creds.user_id().to_string();
        self.credentials
            .with_unlock(creds, request_id, |ctx| async move {
                if self.current_vapid_record(&user_id).await?.is_some() {
                    return Err(KmsError::invalid_params(
                        "a VAPID key already exists; use regenerateVAPID",
                    ));
                }
                let key = self.wrap_new_vapid_key(&ctx).await?;
                let draft = AuditEventDraft::new(ops::VAPID_GENERATE, "")
                    .user(ctx.user_id())
                    .kid(key.kid.clone());
                Ok((key, draft))
            })
            .await
    }

    /// Replace the user's VAPID keypair
    ///
    /// Deletes the old wrapped key (and with it the push subscription)
    /// and invalidates every lease referencing it. Lease records stay
    /// discoverable so `verifyLease` can report `wrong-key` instead of
    /// leaving callers with a dangling id.
    pub async fn regenerate_vapid(
        &self,
        creds: &AuthCredentials,
        request_id: &str,
    ) -> Result<VapidKey> {
        let user_id = creds.user_id().to_string();
        let (key, stale_leases) = self
            .credentials
            .with_unlock(creds, request_id, |ctx| async move {
                let previous = self.current_vapid_record(&user_id).await?;
                let mut stale = Vec::new();
                if let Some(previous) = &previous {
                    self.store.delete_wrapped_key(&previous.kid).await?;
                    for lease in self.store.scan_leases(Some(&user_id)).await? {
                        stale.push(lease.lease_id);
                    }
                }
                let key = self.wrap_new_vapid_key(&ctx).await?;
                let draft = AuditEventDraft::new(ops::VAPID_REGENERATE, "")
                    .user(ctx.user_id())
                    .kid(key.kid.clone())
                    .details(json!({
                        "previousKid": previous.as_ref().map(|p| p.kid.clone()),
                        "invalidatedLeases": stale.len(),
                    }));
                Ok(((key, stale), draft))
            })
            .await?;
        // Stale leases can never issue again; drop their cached KEKs now.
        let mut cache = self.session_keks.lock().await;
        for lease_id in stale_leases {
            cache.remove(&lease_id);
        }
        Ok(key)
    }

    /// Public half of a wrapped key; no unlock required
    pub async fn get_public_key(&self, kid: &str) -> Result<VapidKey> {
        let record = self
            .store
            .get_wrapped_key(kid)
            .await?
            .ok_or_else(|| KmsError::KeyNotFound {
                kid: kid.to_string(),
            })?;
        Ok(VapidKey {
            kid: record.kid,
            public_key: b64url::encode(record.public_key_raw),
        })
    }

    /// kid of the user's current VAPID key; no unlock required
    pub async fn get_vapid_kid(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self
            .current_vapid_record(user_id)
            .await?
            .map(|record| record.kid))
    }

    /// Sign a caller-supplied JWT payload under user authentication
    ///
    /// RFC 8292 policy runs before any unlock: a violating payload is
    /// audited and rejected without touching key material.
    pub async fn sign_jwt(
        &self,
        kid: &str,
        payload: Value,
        creds: &AuthCredentials,
        request_id: &str,
    ) -> Result<String> {
        if let Err(reason) = jwt::check_policy(
            &payload,
            self.effects.now_ms(),
            self.config.jwt.max_exp_secs,
        ) {
            self.audit
                .append_system(
                    AuditEventDraft::new(ops::POLICY_VIOLATION, request_id)
                        .user(creds.user_id())
                        .kid(kid)
                        .details(json!({ "policy_violation": reason })),
                )
                .await?;
            return Err(jwt::policy_error(reason));
        }
        self.sign_limiter
            .lock()
            .await
            .charge(kid, self.effects.now_ms())?;

        let kid = kid.to_string();
        self.credentials
            .with_unlock(creds, request_id, |ctx| async move {
                let mut record = self
                    .store
                    .get_wrapped_key(&kid)
                    .await?
                    .filter(|record| record.purpose == KeyPurpose::Vapid)
                    .ok_or_else(|| KmsError::KeyNotFound { kid: kid.clone() })?;
                check_record_version(record.kms_version)?;

                let mkek = ctx.derive_mkek()?;
                let pkcs8 = SecretBytes::new(aead::open(
                    mkek.as_slice(),
                    &SealedBox {
                        iv: record.iv.clone(),
                        ciphertext: record.wrapped_key.clone(),
                    },
                    wrapped_key_aad(
                        &record.kid,
                        &record.alg,
                        record.purpose,
                        record.created_at,
                    )?
                    .as_bytes(),
                )?);
                let pair = Es256KeyPair::from_pkcs8_der(pkcs8.as_slice())?;
                drop(pkcs8);

                let token = jwt::encode(&kid, &payload, &pair)?;
                record.last_used_at = Some(self.effects.now_ms());
                self.store.put_wrapped_key(record).await?;

                let jti = payload.get("jti").and_then(Value::as_str).map(String::from);
                let draft = AuditEventDraft::new(ops::SIGN, "")
                    .user(ctx.user_id())
                    .kid(kid)
                    .details(json!({ "jti": jti }));
                Ok((token, draft))
            })
            .await
    }

    /// Attach a push subscription to a VAPID key; at most one per key
    pub async fn set_push_subscription(
        &self,
        kid: &str,
        push_subscription: PushSubscription,
        request_id: &str,
    ) -> Result<()> {
        subscription::validate(&push_subscription)?;
        let mut record = self
            .store
            .get_wrapped_key(kid)
            .await?
            .filter(|record| record.purpose == KeyPurpose::Vapid)
            .ok_or_else(|| KmsError::KeyNotFound {
                kid: kid.to_string(),
            })?;
        let eid = push_subscription.eid.clone();
        record.subscription = Some(push_subscription);
        self.store.put_wrapped_key(record).await?;
        self.audit
            .append_system(
                AuditEventDraft::new(ops::SUBSCRIPTION_SET, request_id)
                    .kid(kid)
                    .details(json!({ "eid": eid })),
            )
            .await?;
        Ok(())
    }

    /// Remove the push subscription from a VAPID key
    pub async fn remove_push_subscription(&self, kid: &str, request_id: &str) -> Result<()> {
        let mut record = self
            .store
            .get_wrapped_key(kid)
            .await?
            .ok_or_else(|| KmsError::KeyNotFound {
                kid: kid.to_string(),
            })?;
        record.subscription = None;
        self.store.put_wrapped_key(record).await?;
        self.audit
            .append_system(AuditEventDraft::new(ops::SUBSCRIPTION_REMOVE, request_id).kid(kid))
            .await?;
        Ok(())
    }

    /// The push subscription attached to a key, if any
    pub async fn get_push_subscription(&self, kid: &str) -> Result<Option<PushSubscription>> {
        Ok(self
            .store
            .get_wrapped_key(kid)
            .await?
            .and_then(|record| record.subscription))
    }

    /// The user's current VAPID wrapped-key record
    pub(crate) async fn current_vapid_record(
        &self,
        user_id: &str,
    ) -> Result<Option<WrappedKeyRecord>> {
        let mut keys: Vec<WrappedKeyRecord> = self
            .store
            .scan_wrapped_keys(Some(user_id))
            .await?
            .into_iter()
            .filter(|record| record.purpose == KeyPurpose::Vapid)
            .collect();
        keys.sort_by_key(|record| record.created_at);
        Ok(keys.pop())
    }

    /// Generate, thumbprint, and MKEK-wrap a fresh ES256 keypair
    async fn wrap_new_vapid_key(
        &self,
        ctx: &ats_kms_credential::UnlockContext,
    ) -> Result<VapidKey> {
        let pair = Es256KeyPair::generate(self.effects.as_random());
        let public_key_raw = pair.public_key_uncompressed();
        let kid = jwk::thumbprint(&public_key_raw)?;
        let now = self.effects.now_ms();

        let mkek = ctx.derive_mkek()?;
        let pkcs8 = pair.to_pkcs8_der()?;
        let aad = wrapped_key_aad(&kid, "ES256", KeyPurpose::Vapid, now)?;
        let sealed = aead::seal(
            mkek.as_slice(),
            pkcs8.as_slice(),
            aad.as_bytes(),
            self.effects.as_random(),
        )?;

        self.store
            .put_wrapped_key(WrappedKeyRecord {
                kid: kid.clone(),
                kms_version: constants::KMS_VERSION,
                user_id: ctx.user_id().to_string(),
                wrapped_key: sealed.ciphertext,
                iv: sealed.iv,
                aad,
                public_key_raw: public_key_raw.to_vec(),
                alg: "ES256".to_string(),
                purpose: KeyPurpose::Vapid,
                created_at: now,
                last_used_at: None,
                subscription: None,
            })
            .await?;

        Ok(VapidKey {
            kid,
            public_key: b64url::encode(public_key_raw),
        })
    }
}

/// Refuse records written by a newer format than this build supports
pub(crate) fn check_record_version(kms_version: u32) -> Result<()> {
    if kms_version > constants::MAX_SUPPORTED_KMS_VERSION {
        return Err(KmsError::crypto(format!(
            "record kmsVersion {kms_version} exceeds supported {}",
            constants::MAX_SUPPORTED_KMS_VERSION
        )));
    }
    Ok(())
}
