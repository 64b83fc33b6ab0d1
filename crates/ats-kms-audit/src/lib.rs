//! Tamper-evident audit chain
//!
//! Every KMS operation appends one hash-chained, Ed25519-signed entry.
//! Three signer kinds form a chain of trust rooted in the UAK:
//!
//! - **UAK**: derived from the Master Secret, obtainable only inside an
//!   unlock scope; signs user-authenticated operations and delegation
//!   certificates.
//! - **LAK**: random per-lease key, authorized by a UAK-signed cert with a
//!   lease id, scope list, and validity window; signs background issuance.
//! - **KIAK**: random per-install key for system events; its cert is
//!   signed at the first unlocked operation.
//!
//! Appends are serialized behind one mutex so `seqNum` and `previousHash`
//! stay correct under concurrent request arrival.

pub mod cert;
pub mod chain;
pub mod signer;
pub mod verify;

pub use chain::AuditEventDraft;
pub use signer::{signer_id_for, AuditSigner};
pub use verify::ChainVerification;

use std::sync::Arc;

use async_lock::Mutex;

use ats_kms_core::config::AttestationInfo;
use ats_kms_core::constants::ops;
use ats_kms_core::records::{AuditEntry, AuditSignerKind, DelegationCert};
use ats_kms_core::{b64url, KmsEffects, KmsError, Result, SecretBytes};
use ats_kms_store::{meta_keys, Store};

/// Append-only audit log over a [`Store`]
pub struct AuditLog<S: Store> {
    store: Arc<S>,
    effects: Arc<dyn KmsEffects>,
    attestation: AttestationInfo,
    append_lock: Mutex<()>,
}

impl<S: Store> AuditLog<S> {
    /// Create a log over the given store
    pub fn new(store: Arc<S>, effects: Arc<dyn KmsEffects>, attestation: AttestationInfo) -> Self {
        Self {
            store,
            effects,
            attestation,
            append_lock: Mutex::new(()),
        }
    }

    /// Ensure instance identity exists and record the init system event
    ///
    /// Generates the instance id and KIAK seed on first run; every
    /// subsequent init appends another `kms.init` entry under the same
    /// identity.
    pub async fn init(&self) -> Result<String> {
        let instance_id = match self.store.get_meta(meta_keys::INSTANCE_ID).await? {
            Some(raw) => String::from_utf8(raw)
                .map_err(|_| KmsError::storage("instance id is not utf-8"))?,
            None => {
                let instance_id = self.effects.gen_uuid().to_string();
                let mut seed = vec![0u8; 32];
                self.effects.fill(&mut seed);
                self.store
                    .put_meta(meta_keys::INSTANCE_ID, instance_id.clone().into_bytes())
                    .await?;
                self.store.put_meta(meta_keys::KIAK_SEED, seed).await?;
                instance_id
            }
        };
        let draft = AuditEventDraft::new(ops::KMS_INIT, self.effects.gen_uuid().to_string())
            .details(serde_json::json!({ "instanceId": instance_id }));
        self.append_system(draft).await?;
        Ok(instance_id)
    }

    /// Instance id, if the log has been initialized
    pub async fn instance_id(&self) -> Result<Option<String>> {
        match self.store.get_meta(meta_keys::INSTANCE_ID).await? {
            Some(raw) => Ok(Some(String::from_utf8(raw).map_err(|_| {
                KmsError::storage("instance id is not utf-8")
            })?)),
            None => Ok(None),
        }
    }

    /// Append an entry signed by the UAK
    pub async fn append_uak(
        &self,
        draft: AuditEventDraft,
        uak_seed: &SecretBytes,
    ) -> Result<AuditEntry> {
        self.append(draft, AuditSigner::Uak {
            seed: uak_seed.as_slice(),
        })
        .await
    }

    /// Append an entry signed by a lease's LAK, cert attached
    pub async fn append_lak(
        &self,
        draft: AuditEventDraft,
        lak_seed: &[u8],
        cert: DelegationCert,
    ) -> Result<AuditEntry> {
        self.append(draft, AuditSigner::Lak {
            seed: lak_seed,
            cert,
        })
        .await
    }

    /// Append a system entry signed by the KIAK
    pub async fn append_system(&self, draft: AuditEventDraft) -> Result<AuditEntry> {
        let seed = self.kiak_seed().await?;
        let cert = self.kiak_cert().await?;
        self.append(draft, AuditSigner::Kiak {
            seed: seed.as_slice(),
            cert,
        })
        .await
    }

    /// Append an entry with an explicit signer
    pub async fn append(
        &self,
        draft: AuditEventDraft,
        signer: AuditSigner<'_>,
    ) -> Result<AuditEntry> {
        let _guard = self.append_lock.lock().await;

        let last = self.store.last_audit().await?;
        let (seq_num, previous_hash) = chain::previous_hash_after(last.as_ref());
        let signer_id = signer.signer_id()?;
        let public_key = signer.public_key()?;

        let mut entry = draft.into_entry(
            seq_num,
            self.effects.now_ms(),
            previous_hash,
            signer.kind(),
            signer_id.clone(),
            signer.cert(),
        );
        entry.chain_hash = chain::compute_chain_hash(&entry)?;
        let digest = chain::chain_hash_digest(&entry.chain_hash)?;
        entry.sig = b64url::encode(signer.sign(&digest)?);

        // Cache the raw public key so verification never needs an unlock.
        self.store
            .put_meta(&meta_keys::audit_pub(&signer_id), public_key.to_vec())
            .await?;
        self.store.append_audit(entry.clone()).await?;

        tracing::debug!(op = %entry.op, seq = entry.seq_num, signer = ?entry.signer, "audit appended");
        Ok(entry)
    }

    /// Cache a user's UAK public key for credential-free verification
    pub async fn cache_uak_public_key(&self, user_id: &str, public_key: &[u8]) -> Result<()> {
        self.store
            .put_meta(&meta_keys::uak_pub(user_id), public_key.to_vec())
            .await?;
        self.store
            .put_meta(&meta_keys::audit_pub(&signer_id_for(public_key)), public_key.to_vec())
            .await
    }

    /// The cached UAK public key for a user
    pub async fn uak_public_key(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        self.store.get_meta(&meta_keys::uak_pub(user_id)).await
    }

    /// The KIAK public key for this instance
    pub async fn kiak_public_key(&self) -> Result<[u8; 32]> {
        let seed = self.kiak_seed().await?;
        ats_kms_core::ed25519::public_key(seed.as_slice())
    }

    /// Sign the KIAK delegation cert if none exists yet
    ///
    /// Called at the first unlocked operation, when a UAK is finally in
    /// scope. System entries appended before this carry no cert.
    pub async fn ensure_kiak_cert(&self, uak_seed: &SecretBytes, user_id: &str) -> Result<()> {
        if self.store.get_meta(meta_keys::KIAK_CERT).await?.is_some() {
            return Ok(());
        }
        let instance_id = self
            .instance_id()
            .await?
            .ok_or_else(|| KmsError::internal("audit log not initialized"))?;
        let kiak_pub = self.kiak_public_key().await?;
        let cert = cert::issue(
            uak_seed.as_slice(),
            cert::DelegationParams {
                signer_kind: AuditSignerKind::Kiak,
                lease_id: None,
                instance_id: Some(instance_id),
                delegate_public_key: &kiak_pub,
                scope: vec![cert::SCOPE_ANY.to_string()],
                not_before: self.effects.now_ms(),
                not_after: None,
                attestation: &self.attestation,
            },
        )?;
        let raw = serde_json::to_vec(&cert)
            .map_err(|e| KmsError::internal(format!("cert serialization: {e}")))?;
        self.store.put_meta(meta_keys::KIAK_CERT, raw).await?;
        self.store
            .put_meta(meta_keys::KIAK_CERT_ISSUER, user_id.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    /// Attestation hashes in force, for delegation cert issuance
    pub fn attestation(&self) -> &AttestationInfo {
        &self.attestation
    }

    /// Read a page of the audit log
    pub async fn get_log(&self, from: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        self.store.scan_audit(from, limit).await
    }

    /// Verify the full retained chain
    pub async fn verify_chain(&self, strict: bool) -> Result<ChainVerification> {
        verify::verify_chain(self.store.as_ref(), strict).await
    }

    async fn kiak_seed(&self) -> Result<SecretBytes> {
        let raw = self
            .store
            .get_meta(meta_keys::KIAK_SEED)
            .await?
            .ok_or_else(|| KmsError::internal("audit log not initialized"))?;
        Ok(SecretBytes::new(raw))
    }

    async fn kiak_cert(&self) -> Result<Option<DelegationCert>> {
        match self.store.get_meta(meta_keys::KIAK_CERT).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| KmsError::storage(format!("stored KIAK cert unreadable: {e}"))),
            None => Ok(None),
        }
    }
}
