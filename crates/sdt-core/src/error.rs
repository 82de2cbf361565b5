use std::path::PathBuf;
use thiserror::Error;

pub type SdtResult<T> = Result<T, SdtError>;

#[derive(Debug, Error)]
pub enum SdtError {
    /// Invalid input or a failed policy check; the message tells the user what to fix.
    #[error("{0}")]
    User(String),

    #[error(
        "not enough space on disk at {}: required {required} bytes, available {available} bytes \
         (use --force to proceed anyway)",
        path.display()
    )]
    OutOfSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("checksum mismatch for '{}': expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Key server, portal or transfer endpoint failure.
    #[error("{message}: {source}")]
    Service {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SdtError {
    pub fn user(msg: impl Into<String>) -> Self {
        SdtError::User(msg.into())
    }

    pub fn service(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        SdtError::Service {
            message: message.into(),
            source: source.into(),
        }
    }
}
