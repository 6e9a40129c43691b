use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Runtime-level error domain shared across the daemon and CLI.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("config: {0}")]
    ConfigInvalid(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("forbidden: {0}")]
    ForbiddenOperation(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::ForbiddenOperation(msg.into())
    }
}

// Map TOML deserialization errors into the config error domain without adding a new variant
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::ConfigInvalid(e.to_string())
    }
}
