//! Error taxonomy for the setup phase and the cycle loop.

use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing configuration, type mismatch, unresolved path.
    Parameters,
    /// Allocation failure or an internal invariant violated at setup time.
    Fatal,
    /// A worker did not terminate in time.
    Timeout,
}

/// Errors reported by the data-flow core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("parameters error: {0}")]
    Parameters(String),
    #[error("fatal error: {0}")]
    Fatal(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("configuration parse error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn parameters(msg: impl Into<String>) -> Self {
        Error::Parameters(msg.into())
    }

    pub(crate) fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Classify the error. Configuration and I/O problems count as parameter errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parameters(_) | Error::Config(_) | Error::Io(_) => ErrorKind::Parameters,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
