#![forbid(unsafe_code)]

//! Box cryptography engine: the PSK AEAD suite used by the UDP transport,
//! the sliding replay window, and the on-disk node identity.
//!
//! The AEAD mode is deliberately a pre-shared-key bring-up path ("Noise-lite");
//! the configuration surface reserves room for a full Noise NK/IK state
//! machine but none is implemented here.

pub mod aead;
pub mod identity;
pub mod replay;

pub use aead::{AeadCipher, AeadKey, NONCE_LEN, TAG_LEN};
pub use identity::Identity;
pub use replay::{ReplayError, ReplayWindow};

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// AEAD seal/open failure. Carries no detail; the tag either verified or
    /// it did not.
    #[error("aead failure")]
    Aead,
    #[error("key material: {0}")]
    KeyMaterial(String),
}
