//! Time and randomness effects
//!
//! All nondeterminism in the KMS flows through these two traits so that
//! quota windows, lease expiry, and key generation are reproducible under
//! test. Production uses the OS RNG and the system clock; tests use
//! [`FixedEffects`] with a seeded RNG and a manually advanced clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use uuid::Uuid;

/// Wall-clock time source
pub trait TimeEffects: Send + Sync {
    /// Current unix time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Cryptographically secure randomness source
pub trait RandomEffects: Send + Sync {
    /// Fill the buffer with random bytes
    fn fill(&self, buf: &mut [u8]);

    /// Generate a random v4 UUID
    fn gen_uuid(&self) -> Uuid;
}

/// Combined effects bound used across the workspace
pub trait KmsEffects: TimeEffects + RandomEffects {
    /// View as a randomness source (for APIs that need nothing else)
    fn as_random(&self) -> &dyn RandomEffects;

    /// View as a time source
    fn as_time(&self) -> &dyn TimeEffects;
}

impl<T: TimeEffects + RandomEffects> KmsEffects for T {
    fn as_random(&self) -> &dyn RandomEffects {
        self
    }

    fn as_time(&self) -> &dyn TimeEffects {
        self
    }
}

/// Extension helpers over any [`RandomEffects`]
pub trait RandomEffectsExt {
    /// Generate a fixed-size random array
    fn random_array<const N: usize>(&self) -> [u8; N];
}

impl<T: ?Sized + RandomEffects> RandomEffectsExt for T {
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.fill(&mut bytes);
        bytes
    }
}

/// Production effects: OS entropy and the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionEffects;

impl TimeEffects for ProductionEffects {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl RandomEffects for ProductionEffects {
    fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn gen_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic effects for tests: seeded RNG, manually advanced clock
#[derive(Debug)]
pub struct FixedEffects {
    now_ms: AtomicU64,
    rng: Mutex<StdRng>,
}

impl FixedEffects {
    /// Create effects at the given timestamp with a seeded RNG
    pub fn new(seed: u64, now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Move the clock forward
    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp
    pub fn set_now_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeEffects for FixedEffects {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

impl RandomEffects for FixedEffects {
    fn fill(&self, buf: &mut [u8]) {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.fill_bytes(buf);
    }

    fn gen_uuid(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.fill(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_effects_are_deterministic() {
        let a = FixedEffects::new(7, 1_000);
        let b = FixedEffects::new(7, 1_000);
        assert_eq!(a.random_array::<32>(), b.random_array::<32>());
        assert_eq!(a.gen_uuid(), b.gen_uuid());
    }

    #[test]
    fn clock_advances() {
        let fx = FixedEffects::new(1, 500);
        fx.advance_ms(250);
        assert_eq!(fx.now_ms(), 750);
    }

    #[test]
    fn production_uuid_is_v4() {
        assert_eq!(ProductionEffects.gen_uuid().get_version_num(), 4);
    }
}
