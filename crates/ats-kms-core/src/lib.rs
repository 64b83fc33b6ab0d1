//! Shared domain types and cryptographic primitives for the ATS KMS
//!
//! This crate is the foundation layer: the unified error type, persisted
//! record shapes, protocol constants, time/randomness effects, and the
//! cryptographic primitives every other crate builds on. Nothing here
//! touches the store or holds long-lived state.
//!
//! Key material discipline: secrets are byte buffers ([`SecretBytes`]),
//! derived with explicit domain separation, sealed with AAD-bound AES-GCM,
//! and zeroized on drop. There are no extractable key handles to manage.

pub mod aead;
pub mod b64url;
pub mod canonical;
pub mod config;
pub mod constants;
pub mod ed25519;
pub mod effects;
pub mod error;
pub mod es256;
pub mod hashing;
pub mod jwk;
pub mod kdf;
pub mod records;
pub mod secret;

pub use config::KmsConfig;
pub use effects::{
    FixedEffects, KmsEffects, ProductionEffects, RandomEffects, RandomEffectsExt, TimeEffects,
};
pub use error::{KmsError, Result};
pub use secret::SecretBytes;
