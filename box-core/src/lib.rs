#![forbid(unsafe_code)]

//! Box core: shared identifiers, configuration and the runtime error domain.
//!
//! Everything in this crate is I/O-free except [`config::BoxConfig::from_file`]
//! and the directory helpers in [`paths`].

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{BoxConfig, Origin, Sourced};
pub use error::{Error, Result};
pub use types::{NodeId, TimestampMs, UserId};
