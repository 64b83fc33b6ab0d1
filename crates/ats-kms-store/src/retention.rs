//! Audit retention policy
//!
//! Keep at least `min_entries` entries or everything younger than
//! `min_age_days`, whichever retains more, and never drop below `floor`
//! entries. Runs at init and opportunistically after appends.

use ats_kms_core::config::RetentionConfig;
use ats_kms_core::Result;

use crate::Store;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Apply the retention policy; returns how many entries were dropped
pub async fn prune_audit(store: &dyn Store, config: &RetentionConfig, now_ms: u64) -> Result<u64> {
    let total = store.audit_len().await?;
    let must_retain = config.min_entries.max(config.floor);
    let mut budget = total.saturating_sub(must_retain);
    if budget == 0 {
        return Ok(0);
    }

    let age_cutoff = now_ms.saturating_sub(config.min_age_days * DAY_MS);

    let oldest = match store.scan_audit(0, 1).await? {
        batch if batch.is_empty() => return Ok(0),
        batch => batch[0].seq_num,
    };

    // Walk forward from the oldest entry; stop at the first entry that is
    // still inside the age window or once the count budget runs out.
    let mut keep_from = oldest;
    'scan: loop {
        let batch = store.scan_audit(keep_from, 256).await?;
        if batch.is_empty() {
            break;
        }
        for entry in &batch {
            if budget == 0 || entry.timestamp >= age_cutoff {
                break 'scan;
            }
            keep_from = entry.seq_num + 1;
            budget -= 1;
        }
    }

    if keep_from == oldest {
        return Ok(0);
    }
    let dropped = store.prune_audit(keep_from).await?;
    if dropped > 0 {
        tracing::debug!(dropped, keep_from, "audit retention pruned entries");
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use ats_kms_core::constants::GENESIS_PREVIOUS_HASH;
    use ats_kms_core::records::{AuditEntry, AuditSignerKind};

    fn entry(seq_num: u64, timestamp: u64) -> AuditEntry {
        AuditEntry {
            kms_version: 2,
            seq_num,
            timestamp,
            op: "sign".into(),
            kid: None,
            request_id: format!("r{seq_num}"),
            user_id: Some("u1".into()),
            origin: None,
            lease_id: None,
            unlock_time: None,
            lock_time: None,
            duration: None,
            details: None,
            previous_hash: GENESIS_PREVIOUS_HASH.into(),
            chain_hash: format!("{seq_num:064}"),
            signer: AuditSignerKind::Uak,
            signer_id: "s".into(),
            cert: None,
            sig: "sig".into(),
            sig_new: None,
        }
    }

    #[tokio::test]
    async fn keeps_everything_under_min_entries() {
        let store = MemoryStore::new();
        for seq in 0..100 {
            store.append_audit(entry(seq, 0)).await.unwrap();
        }
        // All entries are ancient, but 100 < min_entries.
        let dropped = prune_audit(&store, &RetentionConfig::default(), u64::MAX / 2)
            .await
            .unwrap();
        assert_eq!(dropped, 0);
    }

    #[tokio::test]
    async fn drops_old_entries_beyond_both_windows() {
        let store = MemoryStore::new();
        let config = RetentionConfig {
            min_entries: 10,
            min_age_days: 1,
            floor: 5,
        };
        let now = 10 * DAY_MS;
        // 50 entries, all older than a day.
        for seq in 0..50 {
            store.append_audit(entry(seq, seq * 1_000)).await.unwrap();
        }
        let dropped = prune_audit(&store, &config, now).await.unwrap();
        assert_eq!(dropped, 40);
        let remaining = store.scan_audit(0, 100).await.unwrap();
        assert_eq!(remaining.first().unwrap().seq_num, 10);
    }

    #[tokio::test]
    async fn age_window_outranks_entry_count() {
        let store = MemoryStore::new();
        let config = RetentionConfig {
            min_entries: 10,
            min_age_days: 1,
            floor: 5,
        };
        let now = 10 * DAY_MS;
        // 50 entries, all recent: nothing prunable.
        for seq in 0..50 {
            store
                .append_audit(entry(seq, now - 1_000 + seq))
                .await
                .unwrap();
        }
        let dropped = prune_audit(&store, &config, now).await.unwrap();
        assert_eq!(dropped, 0);
    }

    #[tokio::test]
    async fn floor_applies_when_min_entries_is_tiny() {
        let store = MemoryStore::new();
        let config = RetentionConfig {
            min_entries: 1,
            min_age_days: 0,
            floor: 50,
        };
        for seq in 0..60 {
            store.append_audit(entry(seq, 0)).await.unwrap();
        }
        let dropped = prune_audit(&store, &config, u64::MAX / 2).await.unwrap();
        assert_eq!(dropped, 10);
        assert_eq!(store.audit_len().await.unwrap(), 50);
    }
}
