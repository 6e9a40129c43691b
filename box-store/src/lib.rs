#![forbid(unsafe_code)]

//! Box queue store.
//!
//! Each queue is a directory under `<home>/.box/queues/`, named by its
//! normalized path with `/` replaced by `%2F`. Each object is one JSON file
//! named by the SHA-256 of its payload. Writes are atomic
//! (temp sibling + fsync + rename); a concurrent PUT of the same digest is
//! idempotent.

pub mod name;
pub mod store;

pub use name::QueueName;
pub use store::{QueueObject, QueueStore, StoreMetrics};

use thiserror::Error;

pub type Result<T, E = StoreError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The queue path failed normalization.
    #[error("bad queue name")]
    BadQueueName,
    /// Queue missing or empty.
    #[error("not found")]
    NotFound,
    /// Payload exceeds the configured maximum.
    #[error("object too large ({size} > {max})")]
    TooLarge { size: usize, max: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt object: {0}")]
    Corrupt(String),
}
