//! RFC 7519 compact JWT encoding and RFC 8292 policy
//!
//! The policy gate runs before any key material is touched: a payload that
//! violates it never reaches the signer, and the violation is audited with
//! a machine-readable reason.

use serde_json::{json, Value};

use ats_kms_core::es256::Es256KeyPair;
use ats_kms_core::{b64url, KmsError, Result};

/// Machine-readable policy rejection reasons
pub mod reasons {
    /// `exp` claim missing or not a number
    pub const EXP_MISSING: &str = "exp_missing";
    /// `exp` further out than the 24 hour horizon
    pub const EXP_TOO_LONG: &str = "exp_too_long";
    /// `aud` missing or not an `https://` URL
    pub const AUD_NOT_HTTPS: &str = "aud_not_https";
    /// `sub` missing or neither `mailto:` nor `https://`
    pub const SUB_INVALID: &str = "sub_invalid";
}

/// Check a VAPID JWT payload against RFC 8292 policy
///
/// Returns the violation reason; the caller audits it and maps it to a
/// `POLICY_VIOLATION` error.
pub fn check_policy(
    payload: &Value,
    now_ms: u64,
    max_exp_secs: u64,
) -> std::result::Result<(), &'static str> {
    let exp = match payload.get("exp").and_then(Value::as_u64) {
        Some(exp) => exp,
        None => return Err(reasons::EXP_MISSING),
    };
    if exp > now_ms / 1_000 + max_exp_secs {
        return Err(reasons::EXP_TOO_LONG);
    }
    match payload.get("aud").and_then(Value::as_str) {
        Some(aud) if aud.starts_with("https://") => {}
        _ => return Err(reasons::AUD_NOT_HTTPS),
    }
    match payload.get("sub").and_then(Value::as_str) {
        Some(sub) if sub.starts_with("mailto:") || sub.starts_with("https://") => {}
        _ => return Err(reasons::SUB_INVALID),
    }
    Ok(())
}

/// Map a policy reason to the surfaced error
pub fn policy_error(reason: &str) -> KmsError {
    KmsError::policy(reason)
}

/// Encode and sign a compact JWT: `base64url(h).base64url(p).base64url(sig)`
pub fn encode(kid: &str, payload: &Value, key: &Es256KeyPair) -> Result<String> {
    let header = json!({
        "typ": "JWT",
        "alg": "ES256",
        "kid": kid,
    });
    let header_json = serde_json::to_vec(&header)
        .map_err(|e| KmsError::internal(format!("header serialization: {e}")))?;
    let payload_json = serde_json::to_vec(payload)
        .map_err(|e| KmsError::internal(format!("payload serialization: {e}")))?;
    let signing_input = format!(
        "{}.{}",
        b64url::encode(header_json),
        b64url::encode(payload_json)
    );
    let signature = key.sign_p1363(signing_input.as_bytes());
    Ok(format!("{signing_input}.{}", b64url::encode(signature)))
}

/// Split a compact JWT and return `(signing_input, signature)`
pub fn split(jwt: &str) -> Result<(String, Vec<u8>)> {
    let mut parts = jwt.rsplitn(2, '.');
    let signature = parts
        .next()
        .ok_or_else(|| KmsError::invalid_params("JWT has no signature part"))?;
    let signing_input = parts
        .next()
        .ok_or_else(|| KmsError::invalid_params("JWT has no payload part"))?;
    Ok((signing_input.to_string(), b64url::decode(signature)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ats_kms_core::effects::FixedEffects;
    use ats_kms_core::es256;

    const HOUR_S: u64 = 3_600;
    const NOW_MS: u64 = 1_700_000_000_000;

    fn payload(exp: u64) -> Value {
        json!({
            "aud": "https://fcm.googleapis.com",
            "sub": "mailto:a@b",
            "exp": exp,
            "jti": "j1",
        })
    }

    #[test]
    fn compliant_payload_passes() {
        assert_eq!(
            check_policy(&payload(NOW_MS / 1_000 + HOUR_S), NOW_MS, 86_400),
            Ok(())
        );
    }

    #[test]
    fn exp_beyond_24h_rejected() {
        assert_eq!(
            check_policy(&payload(NOW_MS / 1_000 + 48 * HOUR_S), NOW_MS, 86_400),
            Err(reasons::EXP_TOO_LONG)
        );
    }

    #[test]
    fn missing_exp_rejected() {
        let mut p = payload(0);
        p.as_object_mut().unwrap().remove("exp");
        assert_eq!(check_policy(&p, NOW_MS, 86_400), Err(reasons::EXP_MISSING));
    }

    #[test]
    fn http_aud_rejected() {
        let mut p = payload(NOW_MS / 1_000 + HOUR_S);
        p["aud"] = json!("http://fcm.googleapis.com");
        assert_eq!(check_policy(&p, NOW_MS, 86_400), Err(reasons::AUD_NOT_HTTPS));
    }

    #[test]
    fn bare_email_sub_rejected() {
        let mut p = payload(NOW_MS / 1_000 + HOUR_S);
        p["sub"] = json!("a@b");
        assert_eq!(check_policy(&p, NOW_MS, 86_400), Err(reasons::SUB_INVALID));
    }

    #[test]
    fn encoded_jwt_verifies_and_has_64_byte_signature() {
        let fx = FixedEffects::new(2, 0);
        let key = ats_kms_core::es256::Es256KeyPair::generate(&fx);
        let jwt = encode("kid-1", &payload(NOW_MS / 1_000 + HOUR_S), &key).unwrap();
        assert_eq!(jwt.split('.').count(), 3);

        let (signing_input, signature) = split(&jwt).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(es256::verify_p1363(
            &key.public_key_uncompressed(),
            signing_input.as_bytes(),
            &signature
        )
        .unwrap());

        let header: Value = serde_json::from_slice(
            &b64url::decode(jwt.split('.').next().unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["typ"], "JWT");
        assert_eq!(header["kid"], "kid-1");
    }
}
