//! Key derivation: HKDF-SHA-256 and PBKDF2-HMAC-SHA-256
//!
//! HKDF callers pass one of the versioned `info` strings from
//! [`crate::constants`]; domain separation is mandatory and derived bytes
//! are never re-used across purposes.
//!
//! PBKDF2 output is 64 bytes split as `key(32) ‖ verification(32)`. The key
//! confirmation value (KCV) is `SHA-256(verification)`, so a wrong
//! passphrase is detected by a cheap hash compare before any AES-GCM
//! attempt touches the Master Secret ciphertext.

use hkdf::Hkdf;
use hmac::Hmac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::Pbkdf2Config;
use crate::error::{KmsError, Result};
use crate::hashing::sha256;
use crate::secret::SecretBytes;

/// Derive `out_len` bytes with HKDF-SHA-256 (extract-then-expand)
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<SecretBytes> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = SecretBytes::zeroed(out_len);
    hk.expand(info, okm.as_mut_slice())
        .map_err(|e| KmsError::crypto(format!("hkdf expand: {e}")))?;
    Ok(okm)
}

/// PBKDF2 derivation split into wrap key and verification half
pub struct PassphraseKey {
    /// AES-256-GCM key encrypting the Master Secret
    pub key: SecretBytes,
    /// Key confirmation value: SHA-256 of the verification half
    pub kcv: [u8; 32],
}

/// Derive the passphrase wrap key and its KCV
///
/// Long blocking compute; callers on a cooperative executor run this under
/// `spawn_blocking`.
pub fn pbkdf2_sha256(passphrase: &[u8], salt: &[u8], iterations: u32) -> Result<PassphraseKey> {
    let mut okm = SecretBytes::zeroed(64);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase, salt, iterations, okm.as_mut_slice())
        .map_err(|e| KmsError::crypto(format!("pbkdf2: {e}")))?;
    let key = SecretBytes::from_slice(&okm.as_slice()[..32]);
    let kcv = sha256(&okm.as_slice()[32..]);
    Ok(PassphraseKey { key, kcv })
}

/// Compare a derived KCV against the stored one in constant time
pub fn kcv_matches(derived: &[u8; 32], stored: &[u8]) -> bool {
    stored.len() == 32 && derived.ct_eq(stored).into()
}

/// Outcome of a PBKDF2 calibration run
#[derive(Debug, Clone)]
pub struct Calibration {
    /// Iteration count placing one derivation inside the target window
    pub iterations: u32,
    /// Measured probe duration, in milliseconds
    pub probe_ms: u64,
}

/// Choose an iteration count so one derivation lands in the target window
///
/// Measures a probe derivation and scales to the middle of
/// `[target_min_ms, target_max_ms]`, clamped to the configured floor. The
/// stored count is then reused verbatim at every unlock so unlock latency
/// stays stable even when the platform speeds up.
pub fn calibrate_pbkdf2(config: &Pbkdf2Config) -> Calibration {
    const PROBE_ITERATIONS: u32 = 50_000;

    let started = std::time::Instant::now();
    let probe = pbkdf2_sha256(b"calibration-probe", &[0u8; 16], PROBE_ITERATIONS);
    let probe_ms = started.elapsed().as_millis() as u64;

    if probe.is_err() || probe_ms == 0 {
        return Calibration {
            iterations: config.default_iterations,
            probe_ms,
        };
    }

    let target_ms = (config.target_min_ms + config.target_max_ms) / 2;
    let scaled = (PROBE_ITERATIONS as u64).saturating_mul(target_ms) / probe_ms;
    let iterations = scaled.clamp(config.min_iterations as u64, u32::MAX as u64) as u32;

    Calibration {
        iterations,
        probe_ms,
    }
}

/// Stable fingerprint of the platform a calibration was measured on
pub fn platform_fingerprint() -> String {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let material = format!("{}/{}/{}", std::env::consts::OS, std::env::consts::ARCH, cores);
    crate::hashing::sha256_hex(material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants;

    #[test]
    fn pbkdf2_split_is_stable() {
        let a = pbkdf2_sha256(b"hunter22!", &[1u8; 16], 1_000).unwrap();
        let b = pbkdf2_sha256(b"hunter22!", &[1u8; 16], 1_000).unwrap();
        assert_eq!(a.key.as_slice(), b.key.as_slice());
        assert_eq!(a.kcv, b.kcv);
    }

    #[test]
    fn wrong_passphrase_fails_kcv_compare() {
        let good = pbkdf2_sha256(b"hunter22!", &[1u8; 16], 1_000).unwrap();
        let bad = pbkdf2_sha256(b"hunter22", &[1u8; 16], 1_000).unwrap();
        assert!(kcv_matches(&good.kcv, &good.kcv));
        assert!(!kcv_matches(&bad.kcv, &good.kcv));
    }

    #[test]
    fn hkdf_purposes_are_separated() {
        let ms = [7u8; 32];
        let salt = [9u8; 16];
        let mkek = hkdf_sha256(&ms, &salt, constants::INFO_MKEK, 32).unwrap();
        let uak = hkdf_sha256(&ms, &salt, constants::INFO_UAK, 32).unwrap();
        assert_ne!(mkek.as_slice(), uak.as_slice());
    }

    #[test]
    fn calibration_respects_floor() {
        let config = Pbkdf2Config {
            min_iterations: 100_000,
            ..Pbkdf2Config::default()
        };
        let calibration = calibrate_pbkdf2(&config);
        assert!(calibration.iterations >= 100_000);
    }
}
