//! End-to-end scenarios over the RPC surface

use std::sync::Arc;

use serde_json::{json, Value};

use ats_kms_core::config::{KmsConfig, Pbkdf2Config};
use ats_kms_core::{b64url, es256, FixedEffects, KmsEffects};
use ats_kms_rpc::{Kms, RpcRequest, RpcResponse};
use ats_kms_store::MemoryStore;

const NOW_MS: u64 = 1_700_000_000_000;

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

struct Harness {
    kms: Arc<Kms<MemoryStore>>,
    effects: Arc<FixedEffects>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Harness {
    async fn new() -> Self {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init()
            .ok();
        let effects = Arc::new(FixedEffects::new(23, NOW_MS));
        let kms = Kms::in_memory(effects.clone() as Arc<dyn KmsEffects>, fast_config())
            .await
            .unwrap();
        Self {
            kms,
            effects,
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> RpcResponse {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.kms
            .dispatch(RpcRequest {
                id: format!("req-{id}"),
                method: method.to_string(),
                params,
                origin: Some("https://app.example.com".into()),
            })
            .await
    }

    async fn ok(&self, method: &str, params: Value) -> Value {
        let response = self.call(method, params).await;
        assert!(
            response.error.is_none(),
            "{method} failed: {:?}",
            response.error
        );
        response.result.unwrap()
    }

    async fn err_code(&self, method: &str, params: Value) -> String {
        let response = self.call(method, params).await;
        response.error.expect("expected an error").code
    }

    fn creds(&self) -> Value {
        json!({ "method": "passphrase", "userId": "u1", "passphrase": "hunter22!" })
    }

    async fn setup_and_generate(&self) -> (String, Vec<u8>) {
        let setup = self
            .ok("setupPassphrase", json!({ "userId": "u1", "passphrase": "hunter22!" }))
            .await;
        assert_eq!(setup["success"], true);
        let generated = self.ok("generateVAPID", json!({ "creds": self.creds() })).await;
        let kid = generated["kid"].as_str().unwrap().to_string();
        let public_key = b64url::decode(generated["publicKey"].as_str().unwrap()).unwrap();
        (kid, public_key)
    }
}

fn verify_jwt(jwt: &str, public_key: &[u8]) {
    let parts: Vec<&str> = jwt.split('.').collect();
    assert_eq!(parts.len(), 3);
    let header: Value =
        serde_json::from_slice(&b64url::decode(parts[0]).unwrap()).unwrap();
    assert_eq!(header["alg"], "ES256");
    let signature = b64url::decode(parts[2]).unwrap();
    assert_eq!(signature.len(), 64);
    let signing_input = format!("{}.{}", parts[0], parts[1]);
    assert!(es256::verify_p1363(public_key, signing_input.as_bytes(), &signature).unwrap());
}

#[tokio::test]
async fn setup_generate_sign() {
    let h = Harness::new().await;
    let (kid, public_key) = h.setup_and_generate().await;

    assert_eq!(public_key.len(), 65);
    assert_eq!(public_key[0], 0x04);

    let signed = h
        .ok(
            "signJWT",
            json!({
                "kid": kid,
                "payload": {
                    "aud": "https://fcm.googleapis.com",
                    "sub": "mailto:a@b",
                    "exp": NOW_MS / 1_000 + 3_600,
                    "jti": "j1",
                },
                "creds": h.creds(),
            }),
        )
        .await;
    verify_jwt(signed["jwt"].as_str().unwrap(), &public_key);
}

#[tokio::test]
async fn wrong_passphrase_is_rejected_and_audited() {
    let h = Harness::new().await;
    h.setup_and_generate().await;

    let code = h
        .err_code(
            "generateVAPID",
            json!({ "creds": { "method": "passphrase", "userId": "u1", "passphrase": "hunter22" } }),
        )
        .await;
    assert_eq!(code, "INCORRECT_PASSPHRASE");

    let log = h.ok("getAuditLog", json!({})).await;
    let ops: Vec<&str> = log["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["op"].as_str().unwrap())
        .collect();
    assert!(ops.contains(&"unlock_failed"));
}

#[tokio::test]
async fn lease_issuance_without_credentials_up_to_quota() {
    let h = Harness::new().await;
    let (_kid, public_key) = h.setup_and_generate().await;

    let lease = h
        .ok(
            "createLease",
            json!({ "ttlHours": 12, "creds": h.creds() }),
        )
        .await;
    let lease_id = lease["leaseId"].as_str().unwrap().to_string();
    assert!(lease["exp"].as_u64().unwrap() > NOW_MS);

    let mut jwts = Vec::new();
    for _ in 0..100 {
        let issued = h
            .ok("issueVAPIDJWT", json!({ "leaseId": lease_id }))
            .await;
        jwts.push(issued["jwt"].as_str().unwrap().to_string());
    }
    for jwt in &jwts {
        verify_jwt(jwt, &public_key);
    }
    let distinct: std::collections::HashSet<&String> = jwts.iter().collect();
    assert_eq!(distinct.len(), 100);

    let code = h
        .err_code("issueVAPIDJWT", json!({ "leaseId": lease_id }))
        .await;
    assert_eq!(code, "QUOTA_EXCEEDED");

    // 100 LAK-signed lease.issue entries, chain fully verifiable.
    let log = h.ok("getAuditLog", json!({ "limit": 1000 })).await;
    let entries = log["entries"].as_array().unwrap();
    let issues: Vec<&Value> = entries
        .iter()
        .filter(|entry| entry["op"] == "lease.issue")
        .collect();
    assert_eq!(issues.len(), 100);
    for entry in &issues {
        assert_eq!(entry["signer"], "LAK");
        assert!(entry["cert"].is_object());
    }

    let verification = h.ok("verifyAuditChain", json!({})).await;
    assert_eq!(verification["valid"], true);
    assert_eq!(
        verification["verified"].as_u64().unwrap(),
        entries.len() as u64
    );
}

#[tokio::test]
async fn regeneration_invalidates_existing_lease() {
    let h = Harness::new().await;
    h.setup_and_generate().await;
    let lease = h
        .ok("createLease", json!({ "ttlHours": 12, "creds": h.creds() }))
        .await;
    let lease_id = lease["leaseId"].as_str().unwrap();

    h.ok("regenerateVAPID", json!({ "creds": h.creds() })).await;

    let verdict = h.ok("verifyLease", json!({ "leaseId": lease_id })).await;
    assert_eq!(verdict["valid"], false);
    assert_eq!(verdict["reason"], "wrong-key");
}

#[tokio::test]
async fn jwt_exp_beyond_24h_is_a_policy_violation() {
    let h = Harness::new().await;
    let (kid, _) = h.setup_and_generate().await;

    let code = h
        .err_code(
            "signJWT",
            json!({
                "kid": kid,
                "payload": {
                    "aud": "https://fcm.googleapis.com",
                    "sub": "mailto:a@b",
                    "exp": NOW_MS / 1_000 + 48 * 3_600,
                    "jti": "j2",
                },
                "creds": h.creds(),
            }),
        )
        .await;
    assert_eq!(code, "POLICY_VIOLATION");

    let log = h.ok("getAuditLog", json!({})).await;
    let violation = log["entries"]
        .as_array()
        .unwrap()
        .iter()
        .find(|entry| entry["op"] == "policy_violation")
        .expect("policy violation audited");
    assert_eq!(violation["details"]["policy_violation"], "exp_too_long");
}

#[tokio::test]
async fn subscription_endpoints_are_allow_listed() {
    let h = Harness::new().await;
    let (kid, _) = h.setup_and_generate().await;

    let code = h
        .err_code(
            "setPushSubscription",
            json!({
                "kid": kid,
                "subscription": {
                    "endpoint": "https://evil.example.com/push",
                    "p256dh": b64url::encode([4u8; 65]),
                    "auth": b64url::encode([1u8; 16]),
                },
            }),
        )
        .await;
    assert_eq!(code, "INVALID_PARAMS");

    h.ok(
        "setPushSubscription",
        json!({
            "kid": kid,
            "subscription": {
                "endpoint": "https://fcm.googleapis.com/fcm/send/abc123",
                "p256dh": b64url::encode([4u8; 65]),
                "auth": b64url::encode([1u8; 16]),
                "eid": "primary",
            },
        }),
    )
    .await;

    let stored = h.ok("getPushSubscription", json!({ "kid": kid })).await;
    assert_eq!(stored["eid"], "primary");
    assert_eq!(stored["endpoint"], "https://fcm.googleapis.com/fcm/send/abc123");

    // JWT aud now derives from the subscription's endpoint origin.
    let lease = h
        .ok("createLease", json!({ "ttlHours": 2, "creds": h.creds() }))
        .await;
    let issued = h
        .ok(
            "issueVAPIDJWT",
            json!({ "leaseId": lease["leaseId"].as_str().unwrap() }),
        )
        .await;
    let payload_b64 = issued["jwt"].as_str().unwrap().split('.').nth(1).unwrap();
    let payload: Value = serde_json::from_slice(&b64url::decode(payload_b64).unwrap()).unwrap();
    assert_eq!(payload["aud"], "https://fcm.googleapis.com");
}

#[tokio::test]
async fn lock_gate_blocks_data_plane_but_not_verification() {
    let h = Harness::new().await;
    h.setup_and_generate().await;

    h.ok("setLocked", json!({ "locked": true })).await;
    let code = h
        .err_code("generateVAPID", json!({ "creds": h.creds() }))
        .await;
    assert_eq!(code, "KMS_LOCKED");

    let verification = h.ok("verifyAuditChain", json!({})).await;
    assert_eq!(verification["valid"], true);
    let status = h.ok("getStatus", json!({})).await;
    assert_eq!(status["locked"], true);

    h.ok("setLocked", json!({ "locked": false })).await;
    h.ok("regenerateVAPID", json!({ "creds": h.creds() })).await;
}

#[tokio::test]
async fn invalid_params_and_unknown_methods() {
    let h = Harness::new().await;

    assert_eq!(
        h.err_code("setupPassphrase", json!({ "userId": "u1" })).await,
        "INVALID_PARAMS"
    );
    assert_eq!(
        h.err_code("createLease", json!({ "ttlHours": 721, "creds": h.creds() }))
            .await,
        "INVALID_PARAMS"
    );
    assert_eq!(h.err_code("frobnicate", json!({})).await, "INVALID_REQUEST");
    assert_eq!(
        h.err_code("signJWT", json!({ "kid": "k" })).await,
        "INVALID_PARAMS"
    );
}

#[tokio::test]
async fn audit_public_key_available_without_credentials() {
    let h = Harness::new().await;
    h.setup_and_generate().await;

    let keys = h.ok("getAuditPublicKey", json!({ "userId": "u1" })).await;
    let uak = b64url::decode(keys["uak"].as_str().unwrap()).unwrap();
    assert_eq!(uak.len(), 32);
    let kiak = b64url::decode(keys["kiak"].as_str().unwrap()).unwrap();
    assert_eq!(kiak.len(), 32);
    assert!(keys["instanceId"].is_string());
}

#[tokio::test]
async fn reset_wipes_state_and_restarts_the_chain() {
    let h = Harness::new().await;
    h.setup_and_generate().await;
    assert_eq!(h.ok("isSetup", json!({})).await, json!(true));

    h.ok("resetKMS", json!({})).await;
    assert_eq!(h.ok("isSetup", json!({})).await, json!(false));

    let log = h.ok("getAuditLog", json!({})).await;
    let entries = log["entries"].as_array().unwrap();
    assert_eq!(entries[0]["seqNum"], 0);
    assert_eq!(entries[0]["op"], "kms.init");
    assert!(entries.iter().any(|entry| entry["op"] == "kms.reset"));
}

#[tokio::test]
async fn expired_lease_surfaces_after_clock_advance() {
    let h = Harness::new().await;
    h.setup_and_generate().await;
    let lease = h
        .ok("createLease", json!({ "ttlHours": 1, "creds": h.creds() }))
        .await;
    let lease_id = lease["leaseId"].as_str().unwrap().to_string();

    h.effects.advance_ms(2 * 3_600_000);
    assert_eq!(
        h.err_code("issueVAPIDJWT", json!({ "leaseId": lease_id })).await,
        "LEASE_EXPIRED"
    );
    let verdict = h
        .ok(
            "verifyLease",
            json!({ "leaseId": lease_id, "deleteIfInvalid": true }),
        )
        .await;
    assert_eq!(verdict["reason"], "expired");
    assert_eq!(
        h.err_code("issueVAPIDJWT", json!({ "leaseId": lease_id })).await,
        "LEASE_NOT_FOUND"
    );
}
