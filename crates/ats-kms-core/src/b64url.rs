//! Unpadded base64url transport encoding

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::{KmsError, Result};

/// Encode bytes as unpadded base64url
pub fn encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode unpadded base64url into bytes
pub fn decode(data: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| KmsError::invalid_params(format!("invalid base64url: {e}")))
}
