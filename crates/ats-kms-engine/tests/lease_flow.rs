//! Lease lifecycle against a live credential manager and audit log

use std::sync::Arc;

use assert_matches::assert_matches;

use ats_kms_audit::AuditLog;
use ats_kms_core::config::{KmsConfig, Pbkdf2Config};
use ats_kms_core::constants::ops;
use ats_kms_core::records::AuditSignerKind;
use ats_kms_core::{FixedEffects, KmsError, TimeEffects};
use ats_kms_credential::{AuthCredentials, CredentialManager};
use ats_kms_engine::{ExtendLeaseRequest, ExtendStatus, IssueOptions, KeyEngine};
use ats_kms_store::{MemoryStore, Store};

const HOUR_MS: u64 = 3_600_000;

fn fast_config() -> KmsConfig {
    KmsConfig {
        pbkdf2: Pbkdf2Config {
            default_iterations: 10_000,
            min_iterations: 1_000,
            target_min_ms: 1,
            target_max_ms: 2,
        },
        ..KmsConfig::default()
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    effects: Arc<FixedEffects>,
    credentials: Arc<CredentialManager<MemoryStore>>,
    engine: KeyEngine<MemoryStore>,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let effects = Arc::new(FixedEffects::new(17, 1_700_000_000_000));
    let dyn_effects: Arc<dyn ats_kms_core::KmsEffects> = effects.clone();
    let audit = Arc::new(AuditLog::new(
        Arc::clone(&store),
        Arc::clone(&dyn_effects),
        ats_kms_core::config::AttestationInfo::default(),
    ));
    audit.init().await.unwrap();
    let credentials = Arc::new(CredentialManager::new(
        Arc::clone(&store),
        Arc::clone(&audit),
        Arc::clone(&dyn_effects),
        fast_config(),
    ));
    let engine = KeyEngine::new(
        store.clone(),
        Arc::clone(&credentials),
        audit,
        dyn_effects,
        fast_config(),
    );
    Fixture {
        store,
        effects,
        credentials,
        engine,
    }
}

fn creds() -> AuthCredentials {
    AuthCredentials::Passphrase {
        user_id: "u1".into(),
        passphrase: "hunter22!".into(),
    }
}

async fn setup_with_key(fx: &Fixture) -> String {
    fx.credentials
        .setup_passphrase("u1", "hunter22!", "r0")
        .await
        .unwrap();
    fx.engine.generate_vapid(&creds(), "r1").await.unwrap().kid
}

#[tokio::test]
async fn lease_issues_without_credentials() {
    let fx = fixture().await;
    let kid = setup_with_key(&fx).await;

    let grant = fx.engine.create_lease(&creds(), 12, false, "r2").await.unwrap();
    assert_eq!(grant.kid, kid);
    assert_eq!(grant.exp, fx.effects.now_ms() + 12 * HOUR_MS);

    let jwt = fx
        .engine
        .issue_vapid_jwt(&grant.lease_id, IssueOptions::default(), "r3")
        .await
        .unwrap();
    assert_eq!(jwt.split('.').count(), 3);

    let issue = fx
        .store
        .scan_audit(0, 100)
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.op == ops::LEASE_ISSUE)
        .unwrap();
    assert_eq!(issue.signer, AuditSignerKind::Lak);
    assert!(issue.cert.is_some());
    assert_eq!(issue.lease_id.as_deref(), Some(grant.lease_id.as_str()));
}

#[tokio::test]
async fn expired_lease_is_refused() {
    let fx = fixture().await;
    setup_with_key(&fx).await;
    let grant = fx.engine.create_lease(&creds(), 1, false, "r2").await.unwrap();

    fx.effects.advance_ms(2 * HOUR_MS);
    let err = fx
        .engine
        .issue_vapid_jwt(&grant.lease_id, IssueOptions::default(), "r3")
        .await
        .unwrap_err();
    assert_matches!(err, KmsError::LeaseExpired { .. });

    let result = fx.engine.verify_lease(&grant.lease_id, true, "r4").await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.reason.as_deref(), Some("expired"));
    assert!(fx.store.get_lease(&grant.lease_id).await.unwrap().is_none());
}

#[tokio::test]
async fn regeneration_leaves_leases_discoverable_but_invalid() {
    let fx = fixture().await;
    setup_with_key(&fx).await;
    let grant = fx.engine.create_lease(&creds(), 12, false, "r2").await.unwrap();

    fx.engine.regenerate_vapid(&creds(), "r3").await.unwrap();

    let result = fx.engine.verify_lease(&grant.lease_id, false, "r4").await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.reason.as_deref(), Some("wrong-key"));
    assert_eq!(result.kid.as_deref(), Some(grant.kid.as_str()));

    let err = fx
        .engine
        .issue_vapid_jwt(&grant.lease_id, IssueOptions::default(), "r5")
        .await
        .unwrap_err();
    assert_matches!(err, KmsError::LeaseWrongKey { .. });

    // Opting in to cleanup removes the stale record.
    fx.engine.verify_lease(&grant.lease_id, true, "r6").await.unwrap();
    let result = fx.engine.verify_lease(&grant.lease_id, false, "r7").await.unwrap();
    assert_eq!(result.reason.as_deref(), Some("not-found"));
}

#[tokio::test]
async fn regeneration_drops_the_push_subscription() {
    let fx = fixture().await;
    let kid = setup_with_key(&fx).await;
    fx.engine
        .set_push_subscription(
            &kid,
            ats_kms_core::records::PushSubscription {
                endpoint: "https://fcm.googleapis.com/fcm/send/abc".into(),
                expiration_time: None,
                p256dh: ats_kms_core::b64url::encode([4u8; 65]),
                auth: ats_kms_core::b64url::encode([1u8; 16]),
                eid: Some("primary".into()),
            },
            "r2",
        )
        .await
        .unwrap();

    let new_key = fx.engine.regenerate_vapid(&creds(), "r3").await.unwrap();
    assert_ne!(new_key.kid, kid);
    assert!(fx
        .engine
        .get_push_subscription(&new_key.kid)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn quota_rejection_is_audited() {
    let fx = fixture().await;
    setup_with_key(&fx).await;
    let grant = fx.engine.create_lease(&creds(), 12, false, "r2").await.unwrap();

    for _ in 0..100 {
        fx.engine
            .issue_vapid_jwt(&grant.lease_id, IssueOptions::default(), "r")
            .await
            .unwrap();
    }
    let err = fx
        .engine
        .issue_vapid_jwt(&grant.lease_id, IssueOptions::default(), "r")
        .await
        .unwrap_err();
    assert_matches!(err, KmsError::QuotaExceeded { .. });

    let entries = fx.store.scan_audit(0, 1_000).await.unwrap();
    assert_eq!(
        entries.iter().filter(|e| e.op == ops::LEASE_ISSUE).count(),
        100
    );
    assert!(entries.iter().any(|e| e.op == ops::LEASE_QUOTA_EXCEEDED));
}

#[tokio::test]
async fn batch_issuance_charges_per_token() {
    let fx = fixture().await;
    setup_with_key(&fx).await;
    let grant = fx.engine.create_lease(&creds(), 12, false, "r2").await.unwrap();

    let jwts = fx
        .engine
        .issue_vapid_jwts(&grant.lease_id, 5, None, "r3")
        .await
        .unwrap();
    assert_eq!(jwts.len(), 5);
    let lease = fx.store.get_lease(&grant.lease_id).await.unwrap().unwrap();
    assert_eq!(lease.quota_state.hour_window.len(), 5);
}

#[tokio::test]
async fn auto_extend_moves_expiry_without_credentials() {
    let fx = fixture().await;
    setup_with_key(&fx).await;
    let grant = fx.engine.create_lease(&creds(), 2, true, "r2").await.unwrap();

    let outcomes = fx
        .engine
        .extend_leases(
            vec![ExtendLeaseRequest {
                lease_id: grant.lease_id.clone(),
                add_hours: Some(3),
            }],
            None,
            "r3",
        )
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, ExtendStatus::Extended);
    assert_eq!(outcomes[0].exp, Some(grant.exp + 3 * HOUR_MS));
}

#[tokio::test]
async fn manual_lease_requires_credentials_to_extend() {
    let fx = fixture().await;
    setup_with_key(&fx).await;
    let grant = fx.engine.create_lease(&creds(), 2, false, "r2").await.unwrap();

    let refused = fx
        .engine
        .extend_leases(
            vec![ExtendLeaseRequest {
                lease_id: grant.lease_id.clone(),
                add_hours: Some(3),
            }],
            None,
            "r3",
        )
        .await
        .unwrap();
    assert_eq!(refused[0].status, ExtendStatus::Skipped);
    assert_eq!(refused[0].reason.as_deref(), Some("auth-required"));

    let extended = fx
        .engine
        .extend_leases(
            vec![ExtendLeaseRequest {
                lease_id: grant.lease_id.clone(),
                add_hours: Some(3),
            }],
            Some(&creds()),
            "r4",
        )
        .await
        .unwrap();
    assert_eq!(extended[0].status, ExtendStatus::Extended);
    // The delegation cert follows the new expiry.
    let lease = fx.store.get_lease(&grant.lease_id).await.unwrap().unwrap();
    assert_eq!(lease.lak_delegation_cert.not_after, Some(lease.exp));
}

#[tokio::test]
async fn ttl_bounds_enforced() {
    let fx = fixture().await;
    setup_with_key(&fx).await;
    assert_matches!(
        fx.engine.create_lease(&creds(), 0, false, "r").await,
        Err(KmsError::InvalidParams { .. })
    );
    assert_matches!(
        fx.engine.create_lease(&creds(), 721, false, "r").await,
        Err(KmsError::InvalidParams { .. })
    );
}
