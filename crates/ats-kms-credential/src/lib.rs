//! Enrollment and Master Secret lifecycle
//!
//! A user's 256-bit Master Secret (MS) is sealed independently under every
//! enrolled authentication method; all enrollments of one user decrypt to
//! the identical MS. The MS exists in plaintext only inside
//! [`CredentialManager::with_unlock`], which decrypts it, runs the
//! operation against an [`UnlockContext`], zeroizes the buffer, and emits
//! a UAK-signed audit entry for the operation.
//!
//! Wrong passphrases are rejected by the key confirmation value before any
//! AES-GCM work; passkey methods rely on the GCM tag. Failed attempts are
//! throttled per user and every failure is audited.

pub mod credentials;
pub mod rate_limit;
pub mod unlock;

pub use credentials::{AuthCredentials, EnrollmentInfo, NewEnrollment};
pub use unlock::UnlockContext;

use std::future::Future;
use std::sync::Arc;

use serde_json::json;

use ats_kms_audit::{AuditEventDraft, AuditLog};
use ats_kms_core::aead::{self, SealedBox};
use ats_kms_core::canonical::to_canonical_json;
use ats_kms_core::constants::{
    self, ops, INFO_GATE_WRAP, INFO_PEPPER, MAX_SUPPORTED_KMS_VERSION, MKEK_SALT_LEN, MS_LEN,
    PBKDF2_SALT_LEN,
};
use ats_kms_core::kdf::{self, PassphraseKey};
use ats_kms_core::records::{EnrollmentConfig, EnrollmentMethod, EnrollmentRecord};
use ats_kms_core::{b64url, ed25519, KmsConfig, KmsEffects, KmsError, Result, SecretBytes};
use ats_kms_store::{meta_keys, Store};

use rate_limit::UnlockRateLimiter;

/// Minimum accepted passphrase length, in characters
pub const MIN_PASSPHRASE_LEN: usize = 8;

/// Enrollment, unlock, and MS lifecycle management
pub struct CredentialManager<S: Store> {
    store: Arc<S>,
    audit: Arc<AuditLog<S>>,
    effects: Arc<dyn KmsEffects>,
    config: KmsConfig,
    limiter: async_lock::Mutex<UnlockRateLimiter>,
}

impl<S: Store> CredentialManager<S> {
    /// Create a manager over the given store and audit log
    pub fn new(
        store: Arc<S>,
        audit: Arc<AuditLog<S>>,
        effects: Arc<dyn KmsEffects>,
        config: KmsConfig,
    ) -> Self {
        let limiter = UnlockRateLimiter::new(config.unlock_limit.clone());
        Self {
            store,
            audit,
            effects,
            config,
            limiter: async_lock::Mutex::new(limiter),
        }
    }

    /// Whether any enrollment exists (for one user, or at all)
    pub async fn is_setup(&self, user_id: Option<&str>) -> Result<bool> {
        Ok(!self.store.scan_enrollments(user_id).await?.is_empty())
    }

    /// Enrollment metadata; never exposes key material
    pub async fn get_enrollments(&self, user_id: Option<&str>) -> Result<Vec<EnrollmentInfo>> {
        let records = self.store.scan_enrollments(user_id).await?;
        Ok(records
            .into_iter()
            .map(|record| EnrollmentInfo {
                id: record.id,
                user_id: record.user_id,
                method: record.config.method().as_str().to_string(),
                credential_id: record.config.credential_id().map(b64url::encode),
                created_at: record.created_at,
            })
            .collect())
    }

    /// First-time setup with a passphrase
    pub async fn setup_passphrase(
        &self,
        user_id: &str,
        passphrase: &str,
        request_id: &str,
    ) -> Result<()> {
        if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
            return Err(KmsError::PassphraseTooShort {
                min: MIN_PASSPHRASE_LEN,
            });
        }
        if self.is_setup(Some(user_id)).await? {
            return Err(KmsError::AlreadySetup);
        }
        let ms = self.random_ms();
        self.enroll_passphrase(user_id, passphrase, &ms).await?;
        self.publish_uak_and_audit(
            user_id,
            &ms,
            ops::SETUP,
            request_id,
            json!({ "method": "passphrase" }),
        )
        .await
    }

    /// First-time setup with a PRF-capable passkey
    pub async fn setup_passkey_prf(
        &self,
        user_id: &str,
        credential_id: &[u8],
        rp_id: &str,
        app_salt: &[u8],
        prf_output: &[u8],
        request_id: &str,
    ) -> Result<()> {
        if self.is_setup(Some(user_id)).await? {
            return Err(KmsError::AlreadySetup);
        }
        let ms = self.random_ms();
        self.enroll_passkey_prf(user_id, credential_id, rp_id, app_salt, prf_output, &ms)
            .await?;
        self.publish_uak_and_audit(
            user_id,
            &ms,
            ops::SETUP,
            request_id,
            json!({ "method": "passkey-prf" }),
        )
        .await
    }

    /// First-time setup with a gate passkey (no PRF support)
    pub async fn setup_passkey_gate(
        &self,
        user_id: &str,
        credential_id: &[u8],
        rp_id: &str,
        request_id: &str,
    ) -> Result<()> {
        if self.is_setup(Some(user_id)).await? {
            return Err(KmsError::AlreadySetup);
        }
        let ms = self.random_ms();
        self.enroll_passkey_gate(user_id, credential_id, rp_id, &ms)
            .await?;
        self.publish_uak_and_audit(
            user_id,
            &ms,
            ops::SETUP,
            request_id,
            json!({ "method": "passkey-gate" }),
        )
        .await
    }

    /// Enroll an additional method after authenticating with an existing one
    ///
    /// The recovered MS is re-sealed under the new method, so every
    /// enrollment of the user decrypts to bytewise-identical bytes.
    pub async fn add_enrollment(
        &self,
        existing: &AuthCredentials,
        addition: NewEnrollment,
        request_id: &str,
    ) -> Result<EnrollmentInfo> {
        let user_id = existing.user_id().to_string();
        self.with_unlock(existing, request_id, |ctx| async move {
            let ms = ctx.master_secret().clone();
            let id = match &addition {
                NewEnrollment::Passphrase { passphrase } => {
                    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
                        return Err(KmsError::PassphraseTooShort {
                            min: MIN_PASSPHRASE_LEN,
                        });
                    }
                    self.enroll_passphrase(&user_id, passphrase, &ms).await?
                }
                NewEnrollment::PasskeyPrf {
                    credential_id,
                    rp_id,
                    app_salt,
                    prf_output,
                } => {
                    self.enroll_passkey_prf(
                        &user_id,
                        credential_id,
                        rp_id,
                        app_salt,
                        prf_output,
                        &ms,
                    )
                    .await?
                }
                NewEnrollment::PasskeyGate {
                    credential_id,
                    rp_id,
                } => {
                    self.enroll_passkey_gate(&user_id, credential_id, rp_id, &ms)
                        .await?
                }
            };
            let record = self
                .store
                .get_enrollment(&id)
                .await?
                .ok_or_else(|| KmsError::internal("enrollment vanished after write"))?;
            let info = EnrollmentInfo {
                id: record.id,
                user_id: record.user_id,
                method: record.config.method().as_str().to_string(),
                credential_id: record.config.credential_id().map(b64url::encode),
                created_at: record.created_at,
            };
            let draft = AuditEventDraft::new(ops::ENROLLMENT_ADD, "")
                .user(ctx.user_id())
                .details(json!({ "method": info.method, "enrollmentId": info.id }));
            Ok((info, draft))
        })
        .await
    }

    /// Remove an enrollment; refuses to remove the last one
    pub async fn remove_enrollment(
        &self,
        enrollment_id: &str,
        creds: &AuthCredentials,
        request_id: &str,
    ) -> Result<()> {
        let user_id = creds.user_id().to_string();
        self.with_unlock(creds, request_id, |ctx| async move {
            let record = self
                .store
                .get_enrollment(enrollment_id)
                .await?
                .ok_or_else(|| {
                    KmsError::invalid_params(format!("no enrollment {enrollment_id}"))
                })?;
            if record.user_id != user_id {
                return Err(KmsError::invalid_params(
                    "enrollment belongs to a different user",
                ));
            }
            if self.store.scan_enrollments(Some(&user_id)).await?.len() <= 1 {
                return Err(KmsError::invalid_params("cannot remove the last enrollment"));
            }
            self.store.delete_enrollment(enrollment_id).await?;
            let draft = AuditEventDraft::new(ops::ENROLLMENT_REMOVE, "")
                .user(ctx.user_id())
                .details(json!({ "enrollmentId": enrollment_id }));
            Ok(((), draft))
        })
        .await
    }

    /// Wipe every collection and re-initialize the instance identity
    pub async fn reset(&self, request_id: &str) -> Result<()> {
        self.store.clear_all().await?;
        self.audit.init().await?;
        self.audit
            .append_system(AuditEventDraft::new(ops::KMS_RESET, request_id))
            .await?;
        Ok(())
    }

    /// Decrypt the MS, run `op`, zeroize, audit
    ///
    /// The closure takes ownership of the [`UnlockContext`] and returns the
    /// operation's value plus the audit draft describing it; the context's
    /// buffers zeroize wherever the closure drops them, including on error
    /// and cancellation paths. The entry is appended UAK-signed after the
    /// scope closes, stamped with the unlock window.
    pub async fn with_unlock<T, F, Fut>(
        &self,
        creds: &AuthCredentials,
        request_id: &str,
        op: F,
    ) -> Result<T>
    where
        T: Send,
        F: FnOnce(UnlockContext) -> Fut,
        Fut: Future<Output = Result<(T, AuditEventDraft)>> + Send,
    {
        let user_id = creds.user_id().to_string();

        {
            let mut limiter = self.limiter.lock().await;
            if let Err(err) = limiter.check(&user_id, self.effects.now_ms()) {
                drop(limiter);
                self.audit_unlock_failure(creds, request_id, &err).await;
                return Err(err);
            }
        }

        let ctx = match self.unlock(creds).await {
            Ok(ctx) => ctx,
            Err(err) => {
                if is_authentication_failure(&err) {
                    self.limiter
                        .lock()
                        .await
                        .record_failure(&user_id, self.effects.now_ms());
                }
                self.audit_unlock_failure(creds, request_id, &err).await;
                return Err(err);
            }
        };

        // The UAK seed outlives the context so the audit entry can be
        // signed after the MS is wiped; it is itself zeroized on drop.
        let uak_seed = ctx.derive_uak_seed()?;
        let uak_public = ed25519::public_key(uak_seed.as_slice())?;
        self.audit.cache_uak_public_key(&user_id, &uak_public).await?;
        self.audit.ensure_kiak_cert(&uak_seed, &user_id).await?;

        let unlock_time = ctx.unlocked_at();
        let result = op(ctx).await;
        let lock_time = self.effects.now_ms();

        let (value, draft) = result?;
        let mut draft = draft.unlock_window(unlock_time, lock_time);
        if draft.user_id.is_none() {
            draft.user_id = Some(user_id);
        }
        draft.request_id = request_id.to_string();
        self.audit.append_uak(draft, &uak_seed).await?;
        Ok(value)
    }

    async fn unlock(&self, creds: &AuthCredentials) -> Result<UnlockContext> {
        let user_id = creds.user_id();
        let id = EnrollmentRecord::storage_id(user_id, creds.method(), creds.credential_id());
        let record = self.store.get_enrollment(&id).await?.ok_or_else(|| match creds {
            AuthCredentials::Passphrase { .. } => KmsError::NotSetup,
            _ => KmsError::PasskeyNotAvailable {
                message: "no enrollment for this credential".into(),
            },
        })?;
        if record.kms_version > MAX_SUPPORTED_KMS_VERSION {
            return Err(KmsError::crypto(format!(
                "record kmsVersion {} exceeds supported {}",
                record.kms_version, MAX_SUPPORTED_KMS_VERSION
            )));
        }

        let aad = ats_kms_core::records::ms_aad(
            record.config.method(),
            record.config.credential_id(),
        )?;
        let sealed = SealedBox {
            iv: record.ms_iv.clone(),
            ciphertext: record.encrypted_ms.clone(),
        };

        let ms = match (&record.config, creds) {
            (
                EnrollmentConfig::Passphrase {
                    iterations,
                    salt,
                    kcv,
                    ..
                },
                AuthCredentials::Passphrase { passphrase, .. },
            ) => {
                let derived = self
                    .derive_passphrase_key(passphrase, salt.clone(), *iterations)
                    .await?;
                if !kdf::kcv_matches(&derived.kcv, kcv) {
                    return Err(KmsError::IncorrectPassphrase);
                }
                aead::open(derived.key.as_slice(), &sealed, aad.as_bytes())?
            }
            (
                EnrollmentConfig::PasskeyPrf {
                    hkdf_salt, info, ..
                },
                AuthCredentials::PasskeyPrf { prf_output, .. },
            ) => {
                if prf_output.is_empty() {
                    return Err(KmsError::PasskeyPrfNotSupported);
                }
                if prf_output.len() != 32 {
                    return Err(KmsError::invalid_params("prfOutput must be 32 bytes"));
                }
                let key = kdf::hkdf_sha256(prf_output, hkdf_salt, info.as_bytes(), 32)?;
                aead::open(key.as_slice(), &sealed, aad.as_bytes()).map_err(|_| {
                    KmsError::PasskeyAuthenticationFailed {
                        message: "PRF output did not recover the master secret".into(),
                    }
                })?
            }
            (
                EnrollmentConfig::PasskeyGate {
                    credential_id,
                    pepper_wrapped,
                    pepper_salt,
                    ..
                },
                AuthCredentials::PasskeyGate { .. },
            ) => {
                let pepper_key =
                    kdf::hkdf_sha256(credential_id, pepper_salt, INFO_PEPPER, 32)?;
                let pepper_aad = pepper_aad(credential_id)?;
                let pepper = aead::open(
                    pepper_key.as_slice(),
                    pepper_wrapped,
                    pepper_aad.as_bytes(),
                )
                .map_err(|_| KmsError::PasskeyAuthenticationFailed {
                    message: "stored pepper failed to unwrap".into(),
                })?;
                let pepper = SecretBytes::new(pepper);
                let key =
                    kdf::hkdf_sha256(pepper.as_slice(), pepper_salt, INFO_GATE_WRAP, 32)?;
                aead::open(key.as_slice(), &sealed, aad.as_bytes()).map_err(|_| {
                    KmsError::PasskeyAuthenticationFailed {
                        message: "pepper-derived key did not recover the master secret".into(),
                    }
                })?
            }
            _ => {
                return Err(KmsError::internal(
                    "credential method does not match the stored enrollment",
                ))
            }
        };

        let ms = SecretBytes::new(ms);
        if ms.len() != MS_LEN {
            return Err(KmsError::crypto("master secret has unexpected length"));
        }
        let mkek_salt = self.mkek_salt(user_id).await?;
        Ok(UnlockContext::new(
            user_id.to_string(),
            ms,
            mkek_salt,
            self.effects.now_ms(),
        ))
    }

    async fn enroll_passphrase(
        &self,
        user_id: &str,
        passphrase: &str,
        ms: &SecretBytes,
    ) -> Result<String> {
        let id = EnrollmentRecord::storage_id(user_id, EnrollmentMethod::Passphrase, None);
        if self.store.get_enrollment(&id).await?.is_some() {
            return Err(KmsError::AlreadySetup);
        }

        let pbkdf2_config = self.config.pbkdf2.clone();
        let calibration = tokio::task::spawn_blocking(move || {
            kdf::calibrate_pbkdf2(&pbkdf2_config)
        })
        .await
        .map_err(|e| KmsError::internal(format!("calibration task: {e}")))?;

        let mut salt = vec![0u8; PBKDF2_SALT_LEN];
        self.effects.fill(&mut salt);
        let derived = self
            .derive_passphrase_key(passphrase, salt.clone(), calibration.iterations)
            .await?;

        let now = self.effects.now_ms();
        let aad = ats_kms_core::records::ms_aad(EnrollmentMethod::Passphrase, None)?;
        let sealed = aead::seal(
            derived.key.as_slice(),
            ms.as_slice(),
            aad.as_bytes(),
            self.effects.as_random(),
        )?;

        self.ensure_mkek_salt(user_id).await?;
        self.store
            .put_enrollment(EnrollmentRecord {
                id: id.clone(),
                user_id: user_id.to_string(),
                kms_version: constants::KMS_VERSION,
                alg_version: constants::ALG_VERSION,
                config: EnrollmentConfig::Passphrase {
                    iterations: calibration.iterations,
                    salt,
                    last_calibrated_at: now,
                    platform_hash: kdf::platform_fingerprint(),
                    kcv: derived.kcv.to_vec(),
                },
                encrypted_ms: sealed.ciphertext,
                ms_iv: sealed.iv,
                ms_aad: aad,
                ms_version: 1,
                created_at: now,
            })
            .await?;
        Ok(id)
    }

    async fn enroll_passkey_prf(
        &self,
        user_id: &str,
        credential_id: &[u8],
        rp_id: &str,
        app_salt: &[u8],
        prf_output: &[u8],
        ms: &SecretBytes,
    ) -> Result<String> {
        if prf_output.len() != 32 {
            return Err(KmsError::invalid_params("prfOutput must be 32 bytes"));
        }
        let id = EnrollmentRecord::storage_id(
            user_id,
            EnrollmentMethod::PasskeyPrf,
            Some(credential_id),
        );
        if self.store.get_enrollment(&id).await?.is_some() {
            return Err(KmsError::AlreadySetup);
        }

        let mut hkdf_salt = vec![0u8; 32];
        self.effects.fill(&mut hkdf_salt);
        let info = String::from_utf8_lossy(constants::INFO_PRF_WRAP).into_owned();
        let key = kdf::hkdf_sha256(prf_output, &hkdf_salt, info.as_bytes(), 32)?;

        let aad =
            ats_kms_core::records::ms_aad(EnrollmentMethod::PasskeyPrf, Some(credential_id))?;
        let sealed = aead::seal(
            key.as_slice(),
            ms.as_slice(),
            aad.as_bytes(),
            self.effects.as_random(),
        )?;

        self.ensure_mkek_salt(user_id).await?;
        self.store
            .put_enrollment(EnrollmentRecord {
                id: id.clone(),
                user_id: user_id.to_string(),
                kms_version: constants::KMS_VERSION,
                alg_version: constants::ALG_VERSION,
                config: EnrollmentConfig::PasskeyPrf {
                    credential_id: credential_id.to_vec(),
                    rp_id: rp_id.to_string(),
                    app_salt: app_salt.to_vec(),
                    hkdf_salt,
                    info,
                },
                encrypted_ms: sealed.ciphertext,
                ms_iv: sealed.iv,
                ms_aad: aad,
                ms_version: 1,
                created_at: self.effects.now_ms(),
            })
            .await?;
        Ok(id)
    }

    async fn enroll_passkey_gate(
        &self,
        user_id: &str,
        credential_id: &[u8],
        rp_id: &str,
        ms: &SecretBytes,
    ) -> Result<String> {
        let id = EnrollmentRecord::storage_id(
            user_id,
            EnrollmentMethod::PasskeyGate,
            Some(credential_id),
        );
        if self.store.get_enrollment(&id).await?.is_some() {
            return Err(KmsError::AlreadySetup);
        }

        // The pepper plays the part of a second factor the gate method
        // otherwise lacks; it is sealed under a key derived from the
        // credential id and recoverable only through this enrollment.
        let mut pepper = SecretBytes::zeroed(32);
        self.effects.fill(pepper.as_mut_slice());
        let mut pepper_salt = vec![0u8; 16];
        self.effects.fill(&mut pepper_salt);

        let pepper_key = kdf::hkdf_sha256(credential_id, &pepper_salt, INFO_PEPPER, 32)?;
        let pepper_aad = pepper_aad(credential_id)?;
        let pepper_wrapped = aead::seal(
            pepper_key.as_slice(),
            pepper.as_slice(),
            pepper_aad.as_bytes(),
            self.effects.as_random(),
        )?;

        let key = kdf::hkdf_sha256(pepper.as_slice(), &pepper_salt, INFO_GATE_WRAP, 32)?;
        let aad =
            ats_kms_core::records::ms_aad(EnrollmentMethod::PasskeyGate, Some(credential_id))?;
        let sealed = aead::seal(
            key.as_slice(),
            ms.as_slice(),
            aad.as_bytes(),
            self.effects.as_random(),
        )?;

        self.ensure_mkek_salt(user_id).await?;
        self.store
            .put_enrollment(EnrollmentRecord {
                id: id.clone(),
                user_id: user_id.to_string(),
                kms_version: constants::KMS_VERSION,
                alg_version: constants::ALG_VERSION,
                config: EnrollmentConfig::PasskeyGate {
                    credential_id: credential_id.to_vec(),
                    rp_id: rp_id.to_string(),
                    pepper_wrapped,
                    pepper_salt,
                },
                encrypted_ms: sealed.ciphertext,
                ms_iv: sealed.iv,
                ms_aad: aad,
                ms_version: 1,
                created_at: self.effects.now_ms(),
            })
            .await?;
        Ok(id)
    }

    async fn derive_passphrase_key(
        &self,
        passphrase: &str,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<PassphraseKey> {
        let passphrase = SecretBytes::from_slice(passphrase.as_bytes());
        tokio::task::spawn_blocking(move || {
            kdf::pbkdf2_sha256(passphrase.as_slice(), &salt, iterations)
        })
        .await
        .map_err(|e| KmsError::internal(format!("pbkdf2 task: {e}")))?
    }

    /// Random 32-byte Master Secret
    fn random_ms(&self) -> SecretBytes {
        let mut ms = SecretBytes::zeroed(MS_LEN);
        self.effects.fill(ms.as_mut_slice());
        ms
    }

    /// One random MKEK salt per user, persisted at first enrollment
    async fn ensure_mkek_salt(&self, user_id: &str) -> Result<Vec<u8>> {
        let key = meta_keys::mkek_salt(user_id);
        if let Some(salt) = self.store.get_meta(&key).await? {
            return Ok(salt);
        }
        let mut salt = vec![0u8; MKEK_SALT_LEN];
        self.effects.fill(&mut salt);
        self.store.put_meta(&key, salt.clone()).await?;
        Ok(salt)
    }

    async fn mkek_salt(&self, user_id: &str) -> Result<Vec<u8>> {
        self.store
            .get_meta(&meta_keys::mkek_salt(user_id))
            .await?
            .ok_or_else(|| KmsError::internal("MKEK salt missing for enrolled user"))
    }

    async fn publish_uak_and_audit(
        &self,
        user_id: &str,
        ms: &SecretBytes,
        op: &str,
        request_id: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let uak_seed = kdf::hkdf_sha256(ms.as_slice(), &[], constants::INFO_UAK, 32)?;
        let uak_public = ed25519::public_key(uak_seed.as_slice())?;
        self.audit.cache_uak_public_key(user_id, &uak_public).await?;
        self.audit.ensure_kiak_cert(&uak_seed, user_id).await?;
        self.audit
            .append_uak(
                AuditEventDraft::new(op, request_id)
                    .user(user_id)
                    .details(details),
                &uak_seed,
            )
            .await?;
        Ok(())
    }

    async fn audit_unlock_failure(
        &self,
        creds: &AuthCredentials,
        request_id: &str,
        err: &KmsError,
    ) {
        let draft = AuditEventDraft::new(ops::UNLOCK_FAILED, request_id)
            .user(creds.user_id())
            .details(json!({
                "method": creds.method().as_str(),
                "code": err.code(),
            }));
        if let Err(audit_err) = self.audit.append_system(draft).await {
            tracing::warn!(error = %audit_err, "failed to audit unlock failure");
        }
    }
}

/// Whether an unlock error counts against the failure window
fn is_authentication_failure(err: &KmsError) -> bool {
    matches!(
        err,
        KmsError::IncorrectPassphrase
            | KmsError::PasskeyAuthenticationFailed { .. }
            | KmsError::PasskeyNotAvailable { .. }
            | KmsError::PasskeyPrfNotSupported
    )
}

/// AAD for the wrapped pepper of a gate enrollment
fn pepper_aad(credential_id: &[u8]) -> Result<String> {
    to_canonical_json(&json!({
        "kmsVersion": constants::KMS_VERSION,
        "purpose": "pepper-wrap",
        "credentialId": b64url::encode(credential_id),
    }))
}
