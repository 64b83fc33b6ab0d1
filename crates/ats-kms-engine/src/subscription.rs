//! Push subscription validation
//!
//! Endpoints must be HTTPS and host-match one of the known push services
//! (or a subdomain of one). At most one subscription per VAPID key.

use ats_kms_core::constants::PUSH_ENDPOINT_ALLOWED_HOSTS;
use ats_kms_core::records::PushSubscription;
use ats_kms_core::{b64url, KmsError, Result};

/// Validate a subscription before it is attached to a key
pub fn validate(subscription: &PushSubscription) -> Result<()> {
    validate_endpoint(&subscription.endpoint)?;
    if b64url::decode(&subscription.p256dh).map(|raw| raw.len()) != Ok(65) {
        return Err(KmsError::invalid_params(
            "p256dh must be a base64url 65-byte uncompressed point",
        ));
    }
    if b64url::decode(&subscription.auth).map(|raw| raw.len()) != Ok(16) {
        return Err(KmsError::invalid_params(
            "auth must be a base64url 16-byte secret",
        ));
    }
    Ok(())
}

/// Check the endpoint URL scheme and host allow-list
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let rest = endpoint
        .strip_prefix("https://")
        .ok_or_else(|| KmsError::invalid_params("push endpoint must be HTTPS"))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = authority.split('@').last().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    if host.is_empty() {
        return Err(KmsError::invalid_params("push endpoint has no host"));
    }
    let allowed = PUSH_ENDPOINT_ALLOWED_HOSTS.iter().any(|&allowed| {
        host == allowed || host.ends_with(&format!(".{allowed}"))
    });
    if !allowed {
        return Err(KmsError::invalid_params(format!(
            "push endpoint host {host} is not an allowed push service"
        )));
    }
    Ok(())
}

/// The origin (`https://host`) of a subscription endpoint, for JWT `aud`
pub fn endpoint_origin(endpoint: &str) -> Option<String> {
    let rest = endpoint.strip_prefix("https://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.split('@').last()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("https://{host}"))
}
