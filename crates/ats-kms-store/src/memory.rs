//! In-memory reference store
//!
//! All collections live behind one async mutex, which gives single-record
//! atomicity and total append order for free. Suitable for tests and for
//! hosts that persist snapshots externally.

use std::collections::BTreeMap;

use async_lock::Mutex;
use async_trait::async_trait;

use ats_kms_core::records::{AuditEntry, EnrollmentRecord, LeaseRecord, WrappedKeyRecord};
use ats_kms_core::{KmsError, Result};

use crate::Store;

#[derive(Default)]
struct Collections {
    enrollments: BTreeMap<String, EnrollmentRecord>,
    wrapped_keys: BTreeMap<String, WrappedKeyRecord>,
    leases: BTreeMap<String, LeaseRecord>,
    audit: BTreeMap<u64, AuditEntry>,
    meta: BTreeMap<String, Vec<u8>>,
}

/// In-memory [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_enrollment(&self, record: EnrollmentRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enrollments.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_enrollment(&self, id: &str) -> Result<Option<EnrollmentRecord>> {
        Ok(self.inner.lock().await.enrollments.get(id).cloned())
    }

    async fn delete_enrollment(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().await.enrollments.remove(id).is_some())
    }

    async fn scan_enrollments(&self, user_id: Option<&str>) -> Result<Vec<EnrollmentRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .enrollments
            .values()
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .cloned()
            .collect())
    }

    async fn put_wrapped_key(&self, record: WrappedKeyRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.wrapped_keys.insert(record.kid.clone(), record);
        Ok(())
    }

    async fn get_wrapped_key(&self, kid: &str) -> Result<Option<WrappedKeyRecord>> {
        Ok(self.inner.lock().await.wrapped_keys.get(kid).cloned())
    }

    async fn delete_wrapped_key(&self, kid: &str) -> Result<bool> {
        Ok(self.inner.lock().await.wrapped_keys.remove(kid).is_some())
    }

    async fn scan_wrapped_keys(&self, user_id: Option<&str>) -> Result<Vec<WrappedKeyRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .wrapped_keys
            .values()
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .cloned()
            .collect())
    }

    async fn put_lease(&self, record: LeaseRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.leases.insert(record.lease_id.clone(), record);
        Ok(())
    }

    async fn get_lease(&self, lease_id: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.inner.lock().await.leases.get(lease_id).cloned())
    }

    async fn delete_lease(&self, lease_id: &str) -> Result<bool> {
        Ok(self.inner.lock().await.leases.remove(lease_id).is_some())
    }

    async fn scan_leases(&self, user_id: Option<&str>) -> Result<Vec<LeaseRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .leases
            .values()
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let expected = match inner.audit.last_key_value() {
            Some((last, _)) => last + 1,
            None => 0,
        };
        if entry.seq_num != expected {
            return Err(KmsError::storage(format!(
                "audit append out of order: expected seq {expected}, got {}",
                entry.seq_num
            )));
        }
        inner.audit.insert(entry.seq_num, entry);
        Ok(())
    }

    async fn get_audit(&self, seq_num: u64) -> Result<Option<AuditEntry>> {
        Ok(self.inner.lock().await.audit.get(&seq_num).cloned())
    }

    async fn scan_audit(&self, from: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.audit.range(from..).take(limit).map(|(_, e)| e.clone()).collect())
    }

    async fn last_audit(&self) -> Result<Option<AuditEntry>> {
        Ok(self
            .inner
            .lock()
            .await
            .audit
            .last_key_value()
            .map(|(_, e)| e.clone()))
    }

    async fn audit_len(&self) -> Result<u64> {
        Ok(self.inner.lock().await.audit.len() as u64)
    }

    async fn prune_audit(&self, keep_from: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let keep = inner.audit.split_off(&keep_from);
        let dropped = inner.audit.len() as u64;
        inner.audit = keep;
        Ok(dropped)
    }

    async fn put_meta(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.meta.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.meta.get(key).cloned())
    }

    async fn delete_meta(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().await.meta.remove(key).is_some())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        *inner = Collections::default();
        Ok(())
    }
}
