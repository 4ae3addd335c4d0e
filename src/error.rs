//! Error types for detour

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for detour
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("No route attempted for {0}")]
    NoRoute(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    #[error("Statistics I/O error on {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed statistics file {path:?}: {source}")]
    MalformedStats {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// True if this error is an operation deadline expiry
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for detour
pub type Result<T> = std::result::Result<T, Error>;
