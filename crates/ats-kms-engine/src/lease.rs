//! Lease lifecycle: creation, background issuance, extension, verification
//!
//! A lease is a time-bounded capability to mint VAPID JWTs without user
//! authentication. At creation (inside an unlock scope) the VAPID private
//! key is re-wrapped under a lease-specific SessionKEK derived from the MS,
//! and a fresh LAK is authorized by a UAK-signed delegation certificate.
//! From then on issuance needs only the lease record: load, check expiry
//! and key identity, charge quotas, decrypt the key copy, sign, zeroize.

use serde::{Deserialize, Serialize};
use serde_json::json;

use ats_kms_audit::cert::{self, DelegationParams};
use ats_kms_audit::AuditEventDraft;
use ats_kms_core::aead::{self, SealedBox};
use ats_kms_core::constants::{ops, LEASE_SALT_LEN};
use ats_kms_core::es256::Es256KeyPair;
use ats_kms_core::records::{
    lease_key_aad, AuditSignerKind, LeaseQuotas, LeaseRecord, QuotaState,
};
use ats_kms_core::{KmsError, Result, SecretBytes};
use ats_kms_credential::AuthCredentials;
use ats_kms_store::Store;

use crate::{jwt, quota, subscription, KeyEngine};

const HOUR_MS: u64 = 3_600_000;

/// Result of `createLease`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseGrant {
    /// The new lease id
    pub lease_id: String,
    /// Unix ms expiry
    pub exp: u64,
    /// kid the lease is bound to
    pub kid: String,
}

/// Non-secret lease metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    /// Lease id
    pub lease_id: String,
    /// kid the lease is bound to
    pub kid: String,
    /// Unix ms of creation
    pub created_at: u64,
    /// Unix ms expiry
    pub exp: u64,
    /// Whether the lease extends without user authentication
    pub auto_extend: bool,
    /// Issuance limits
    pub quotas: LeaseQuotas,
}

/// Options for one background issuance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueOptions {
    /// Expected kid; mismatch against the lease fails `LEASE_WRONG_KEY`
    pub kid: Option<String>,
    /// Token id; defaults to a fresh UUID
    pub jti: Option<String>,
    /// `exp` claim in unix seconds; defaults to now + 15 minutes
    pub exp: Option<u64>,
}

/// One item of an `extendLeases` batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendLeaseRequest {
    /// Lease to extend
    pub lease_id: String,
    /// Hours to extend by; defaults to the lease's original TTL
    pub add_hours: Option<u32>,
}

/// Per-item outcome of an `extendLeases` batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendOutcome {
    /// The lease the outcome is for
    pub lease_id: String,
    /// `extended` or `skipped`
    pub status: ExtendStatus,
    /// Why the item was skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// New expiry when extended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// Batch item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtendStatus {
    /// The lease expiry moved forward
    Extended,
    /// The item was left untouched
    Skipped,
}

/// Result of `verifyLease`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyLeaseResult {
    /// The lease that was checked
    pub lease_id: String,
    /// Whether it is usable for issuance
    pub valid: bool,
    /// `expired`, `wrong-key`, or `not-found`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// kid the lease references, when the record exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl<S: Store> KeyEngine<S> {
    /// Create a lease for the user's current VAPID key
    pub async fn create_lease(
        &self,
        creds: &AuthCredentials,
        ttl_hours: u32,
        auto_extend: bool,
        request_id: &str,
    ) -> Result<LeaseGrant> {
        if ttl_hours == 0 || ttl_hours > self.config.lease.max_ttl_hours {
            return Err(KmsError::invalid_params(format!(
                "ttlHours must be between 1 and {}",
                self.config.lease.max_ttl_hours
            )));
        }
        let user_id = creds.user_id().to_string();

        let grant = self
            .credentials
            .with_unlock(creds, request_id, |ctx| async move {
                let key = self
                    .current_vapid_record(&user_id)
                    .await?
                    .ok_or_else(|| KmsError::KeyNotFound {
                        kid: "<no VAPID key>".into(),
                    })?;
                crate::check_record_version(key.kms_version)?;

                // Unwrap the application key with the MKEK, then re-seal a
                // copy under a lease-specific SessionKEK.
                let mkek = ctx.derive_mkek()?;
                let pkcs8 = SecretBytes::new(aead::open(
                    mkek.as_slice(),
                    &SealedBox {
                        iv: key.iv.clone(),
                        ciphertext: key.wrapped_key.clone(),
                    },
                    ats_kms_core::records::wrapped_key_aad(
                        &key.kid,
                        &key.alg,
                        key.purpose,
                        key.created_at,
                    )?
                    .as_bytes(),
                )?);

                let now = self.effects.now_ms();
                let lease_id = self.effects.gen_uuid().to_string();
                let exp = now + u64::from(ttl_hours) * HOUR_MS;

                let mut lease_salt = vec![0u8; LEASE_SALT_LEN];
                self.effects.fill(&mut lease_salt);
                let session_kek = ctx.derive_session_kek(&lease_salt)?;
                let sealed = aead::seal(
                    session_kek.as_slice(),
                    pkcs8.as_slice(),
                    lease_key_aad(&lease_id, &key.kid)?.as_bytes(),
                    self.effects.as_random(),
                )?;
                drop(pkcs8);

                // Fresh LAK, delegated by the UAK. Auto-extending leases get
                // an open-ended cert; the lease record itself bounds them.
                let mut lak_seed = vec![0u8; 32];
                self.effects.fill(&mut lak_seed);
                let lak_public = ats_kms_core::ed25519::public_key(&lak_seed)?;
                let uak_seed = ctx.derive_uak_seed()?;
                let lak_delegation_cert = cert::issue(
                    uak_seed.as_slice(),
                    DelegationParams {
                        signer_kind: AuditSignerKind::Lak,
                        lease_id: Some(lease_id.clone()),
                        instance_id: None,
                        delegate_public_key: &lak_public,
                        scope: vec![ops::LEASE_ISSUE.into(), ops::LEASE_EXPIRE.into()],
                        not_before: now,
                        not_after: if auto_extend { None } else { Some(exp) },
                        attestation: self.audit.attestation(),
                    },
                )?;

                let quotas = LeaseQuotas {
                    tokens_per_hour: self.config.lease.tokens_per_hour,
                    sends_per_minute: self.config.lease.sends_per_minute,
                    burst_sends: self.config.lease.burst_sends,
                    sends_per_minute_per_eid: self.config.lease.sends_per_minute_per_eid,
                };
                let record = LeaseRecord {
                    lease_id: lease_id.clone(),
                    user_id: user_id.clone(),
                    ttl_hours,
                    created_at: now,
                    exp,
                    auto_extend,
                    quotas,
                    quota_state: QuotaState::default(),
                    wrapped_lease_key: sealed.ciphertext,
                    wrapped_lease_key_iv: sealed.iv,
                    lease_salt,
                    kid: key.kid.clone(),
                    lak_delegation_cert,
                    lak_seed,
                    session_kek: session_kek.as_slice().to_vec(),
                };
                self.store.put_lease(record).await?;
                self.session_keks
                    .lock()
                    .await
                    .insert(lease_id.clone(), session_kek);

                let grant = LeaseGrant {
                    lease_id: lease_id.clone(),
                    exp,
                    kid: key.kid.clone(),
                };
                let draft = AuditEventDraft::new(ops::LEASE_CREATE, "")
                    .user(ctx.user_id())
                    .kid(key.kid)
                    .lease(lease_id)
                    .details(json!({ "ttlHours": ttl_hours, "autoExtend": auto_extend }));
                Ok((grant, draft))
            })
            .await?;
        Ok(grant)
    }

    /// Issue one VAPID JWT under a lease; no user authentication
    pub async fn issue_vapid_jwt(
        &self,
        lease_id: &str,
        options: IssueOptions,
        request_id: &str,
    ) -> Result<String> {
        let mut lease = self
            .store
            .get_lease(lease_id)
            .await?
            .ok_or_else(|| KmsError::LeaseNotFound {
                lease_id: lease_id.to_string(),
            })?;

        let now = self.effects.now_ms();
        if now > lease.exp {
            self.audit_lease_event(
                &lease,
                AuditEventDraft::new(ops::LEASE_EXPIRE, request_id)
                    .user(lease.user_id.clone())
                    .lease(lease.lease_id.clone())
                    .details(json!({ "observedAt": now })),
            )
            .await?;
            return Err(KmsError::LeaseExpired {
                lease_id: lease_id.to_string(),
            });
        }

        // The lease references a kid but does not own the key: regeneration
        // leaves it discoverable-but-invalid.
        let key = self
            .current_vapid_record(&lease.user_id)
            .await?
            .filter(|key| key.kid == lease.kid)
            .ok_or_else(|| KmsError::LeaseWrongKey {
                lease_id: lease_id.to_string(),
            })?;
        if options.kid.as_deref().is_some_and(|kid| kid != lease.kid) {
            return Err(KmsError::LeaseWrongKey {
                lease_id: lease_id.to_string(),
            });
        }

        let eid = key
            .subscription
            .as_ref()
            .and_then(|subscription| subscription.eid.as_deref());
        if let Err(err) = quota::charge(&mut lease.quota_state, &lease.quotas, now, eid) {
            self.store.put_lease(lease.clone()).await?;
            // Quota rejections are outside the LAK cert's scope, so they
            // land as instance-signed system entries.
            self.audit
                .append_system(
                    AuditEventDraft::new(ops::LEASE_QUOTA_EXCEEDED, request_id)
                        .user(lease.user_id.clone())
                        .kid(lease.kid.clone())
                        .lease(lease.lease_id.clone())
                        .details(json!({ "reason": err.to_string() })),
                )
                .await?;
            return Err(err);
        }

        // Build the payload; aud/sub derive from the key's subscription.
        let exp_s = match options.exp {
            Some(exp) => {
                if exp > now / 1_000 + self.config.jwt.max_exp_secs {
                    let draft = AuditEventDraft::new(ops::POLICY_VIOLATION, request_id)
                        .user(lease.user_id.clone())
                        .kid(lease.kid.clone())
                        .details(json!({
                            "policy_violation": jwt::reasons::EXP_TOO_LONG,
                            "leaseId": lease.lease_id,
                        }));
                    self.audit.append_system(draft).await?;
                    return Err(jwt::policy_error(jwt::reasons::EXP_TOO_LONG));
                }
                exp
            }
            None => now / 1_000 + self.config.jwt.default_ttl_secs,
        };
        let aud = key
            .subscription
            .as_ref()
            .and_then(|subscription| subscription::endpoint_origin(&subscription.endpoint))
            .unwrap_or_else(|| self.config.jwt.default_audience.clone());
        let jti = options
            .jti
            .unwrap_or_else(|| self.effects.gen_uuid().to_string());
        let payload = json!({
            "aud": aud,
            "sub": self.config.jwt.default_subject,
            "exp": exp_s,
            "jti": jti.clone(),
        });

        // Decrypt the lease's key copy with the SessionKEK, sign, zeroize.
        let session_kek = self.session_kek(&lease).await?;
        let pkcs8 = SecretBytes::new(
            aead::open(
                session_kek.as_slice(),
                &SealedBox {
                    iv: lease.wrapped_lease_key_iv.clone(),
                    ciphertext: lease.wrapped_lease_key.clone(),
                },
                lease_key_aad(&lease.lease_id, &lease.kid)?.as_bytes(),
            )
            .map_err(|_| KmsError::crypto("lease key copy failed to unwrap"))?,
        );
        let pair = Es256KeyPair::from_pkcs8_der(pkcs8.as_slice())?;
        drop(pkcs8);
        let token = jwt::encode(&lease.kid, &payload, &pair)?;

        self.store.put_lease(lease.clone()).await?;
        self.audit
            .append_lak(
                AuditEventDraft::new(ops::LEASE_ISSUE, request_id)
                    .user(lease.user_id.clone())
                    .kid(lease.kid.clone())
                    .lease(lease.lease_id.clone())
                    .details(json!({ "jti": jti })),
                &lease.lak_seed,
                lease.lak_delegation_cert.clone(),
            )
            .await?;
        Ok(token)
    }

    /// Issue a batch of JWTs; quotas are charged once per token
    pub async fn issue_vapid_jwts(
        &self,
        lease_id: &str,
        count: u32,
        kid: Option<String>,
        request_id: &str,
    ) -> Result<Vec<String>> {
        if count == 0 || count > 1_000 {
            return Err(KmsError::invalid_params("count must be between 1 and 1000"));
        }
        let mut tokens = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let options = IssueOptions {
                kid: kid.clone(),
                ..IssueOptions::default()
            };
            tokens.push(self.issue_vapid_jwt(lease_id, options, request_id).await?);
        }
        Ok(tokens)
    }

    /// Extend a batch of leases
    ///
    /// Auto-extending leases move forward without credentials. Others
    /// require user authentication, under which their delegation certs are
    /// re-signed with the new expiry.
    pub async fn extend_leases(
        &self,
        requests: Vec<ExtendLeaseRequest>,
        creds: Option<&AuthCredentials>,
        request_id: &str,
    ) -> Result<Vec<ExtendOutcome>> {
        let now = self.effects.now_ms();
        let max_exp = now + u64::from(self.config.lease.max_ttl_hours) * HOUR_MS;
        let mut outcomes = Vec::with_capacity(requests.len());
        let mut needs_auth = Vec::new();

        for request in requests {
            let lease = match self.store.get_lease(&request.lease_id).await? {
                Some(lease) => lease,
                None => {
                    outcomes.push(ExtendOutcome {
                        lease_id: request.lease_id,
                        status: ExtendStatus::Skipped,
                        reason: Some("not-found".into()),
                        exp: None,
                    });
                    continue;
                }
            };
            if now > lease.exp {
                outcomes.push(ExtendOutcome {
                    lease_id: request.lease_id,
                    status: ExtendStatus::Skipped,
                    reason: Some("expired".into()),
                    exp: None,
                });
                continue;
            }
            if !lease.auto_extend {
                if creds.is_none() {
                    outcomes.push(ExtendOutcome {
                        lease_id: request.lease_id,
                        status: ExtendStatus::Skipped,
                        reason: Some("auth-required".into()),
                        exp: None,
                    });
                } else {
                    needs_auth.push(request);
                }
                continue;
            }

            let mut lease = lease;
            let add = u64::from(request.add_hours.unwrap_or(lease.ttl_hours)) * HOUR_MS;
            lease.exp = (lease.exp + add).min(max_exp);
            self.store.put_lease(lease.clone()).await?;
            self.audit
                .append_system(
                    AuditEventDraft::new(ops::LEASE_EXTEND, request_id)
                        .user(lease.user_id.clone())
                        .lease(lease.lease_id.clone())
                        .details(json!({ "newExp": lease.exp, "autoExtend": true })),
                )
                .await?;
            outcomes.push(ExtendOutcome {
                lease_id: lease.lease_id,
                status: ExtendStatus::Extended,
                reason: None,
                exp: Some(lease.exp),
            });
        }

        if !needs_auth.is_empty() {
            // One unlock covers the whole authenticated remainder.
            let creds = creds.ok_or_else(|| KmsError::internal("auth batch without creds"))?;
            let authed = self
                .credentials
                .with_unlock(creds, request_id, |ctx| async move {
                    let uak_seed = ctx.derive_uak_seed()?;
                    let mut extended = Vec::new();
                    for request in needs_auth {
                        let mut lease = match self.store.get_lease(&request.lease_id).await? {
                            Some(lease) => lease,
                            None => continue,
                        };
                        let add =
                            u64::from(request.add_hours.unwrap_or(lease.ttl_hours)) * HOUR_MS;
                        lease.exp = (lease.exp + add).min(max_exp);
                        let lak_public =
                            ats_kms_core::ed25519::public_key(&lease.lak_seed)?;
                        lease.lak_delegation_cert = cert::issue(
                            uak_seed.as_slice(),
                            DelegationParams {
                                signer_kind: AuditSignerKind::Lak,
                                lease_id: Some(lease.lease_id.clone()),
                                instance_id: None,
                                delegate_public_key: &lak_public,
                                scope: vec![
                                    ops::LEASE_ISSUE.into(),
                                    ops::LEASE_EXPIRE.into(),
                                ],
                                not_before: lease.lak_delegation_cert.not_before,
                                not_after: Some(lease.exp),
                                attestation: self.audit.attestation(),
                            },
                        )?;
                        self.store.put_lease(lease.clone()).await?;
                        extended.push(ExtendOutcome {
                            lease_id: lease.lease_id,
                            status: ExtendStatus::Extended,
                            reason: None,
                            exp: Some(lease.exp),
                        });
                    }
                    let draft = AuditEventDraft::new(ops::LEASE_EXTEND, "")
                        .user(ctx.user_id())
                        .details(json!({
                            "leases": extended.iter().map(|o| o.lease_id.clone()).collect::<Vec<_>>(),
                        }));
                    Ok((extended, draft))
                })
                .await?;
            outcomes.extend(authed);
        }

        Ok(outcomes)
    }

    /// Check a lease's validity; optionally delete it when invalid
    pub async fn verify_lease(
        &self,
        lease_id: &str,
        delete_if_invalid: bool,
        request_id: &str,
    ) -> Result<VerifyLeaseResult> {
        let lease = match self.store.get_lease(lease_id).await? {
            Some(lease) => lease,
            None => {
                return Ok(VerifyLeaseResult {
                    lease_id: lease_id.to_string(),
                    valid: false,
                    reason: Some("not-found".into()),
                    kid: None,
                })
            }
        };

        let now = self.effects.now_ms();
        if now > lease.exp {
            if delete_if_invalid {
                self.delete_lease(&lease).await?;
            }
            self.audit_lease_event(
                &lease,
                AuditEventDraft::new(ops::LEASE_EXPIRE, request_id)
                    .user(lease.user_id.clone())
                    .lease(lease.lease_id.clone())
                    .details(json!({ "deleted": delete_if_invalid })),
            )
            .await?;
            return Ok(VerifyLeaseResult {
                lease_id: lease_id.to_string(),
                valid: false,
                reason: Some("expired".into()),
                kid: Some(lease.kid),
            });
        }

        let current = self.current_vapid_record(&lease.user_id).await?;
        if current.map(|key| key.kid) != Some(lease.kid.clone()) {
            if delete_if_invalid {
                self.delete_lease(&lease).await?;
            }
            return Ok(VerifyLeaseResult {
                lease_id: lease_id.to_string(),
                valid: false,
                reason: Some("wrong-key".into()),
                kid: Some(lease.kid),
            });
        }

        Ok(VerifyLeaseResult {
            lease_id: lease_id.to_string(),
            valid: true,
            reason: None,
            kid: Some(lease.kid),
        })
    }

    /// Metadata of the user's non-expired leases
    pub async fn get_user_leases(&self, user_id: &str) -> Result<Vec<LeaseInfo>> {
        let now = self.effects.now_ms();
        Ok(self
            .store
            .scan_leases(Some(user_id))
            .await?
            .into_iter()
            .filter(|lease| now <= lease.exp)
            .map(|lease| LeaseInfo {
                lease_id: lease.lease_id,
                kid: lease.kid,
                created_at: lease.created_at,
                exp: lease.exp,
                auto_extend: lease.auto_extend,
                quotas: lease.quotas,
            })
            .collect())
    }

    pub(crate) async fn delete_lease(&self, lease: &LeaseRecord) -> Result<()> {
        self.store.delete_lease(&lease.lease_id).await?;
        self.session_keks.lock().await.remove(&lease.lease_id);
        Ok(())
    }

    /// LAK-sign lease events while the cert is fresh, else fall back to KIAK
    async fn audit_lease_event(
        &self,
        lease: &LeaseRecord,
        draft: AuditEventDraft,
    ) -> Result<()> {
        let now = self.effects.now_ms();
        let cert_fresh = lease
            .lak_delegation_cert
            .not_after
            .map_or(true, |end| now <= end);
        if cert_fresh {
            self.audit
                .append_lak(draft, &lease.lak_seed, lease.lak_delegation_cert.clone())
                .await?;
        } else {
            self.audit.append_system(draft).await?;
        }
        Ok(())
    }

    async fn session_kek(&self, lease: &LeaseRecord) -> Result<SecretBytes> {
        let mut cache = self.session_keks.lock().await;
        if let Some(kek) = cache.get(&lease.lease_id) {
            return Ok(kek.clone());
        }
        let kek = SecretBytes::from_slice(&lease.session_kek);
        cache.insert(lease.lease_id.clone(), kek.clone());
        Ok(kek)
    }
}
