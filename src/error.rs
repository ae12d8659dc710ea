//! Crate-level error type.
//!
//! Wraps the driver's error families so callers mixing configuration,
//! login and requests can use a single `?`.

use thiserror::Error;

use crate::tds::{ConfigError, ConnectionError, RequestError, ValidationError};

#[derive(Error, Debug)]
pub enum TdsError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Parameter error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TdsError {
    /// Machine-readable code, when the underlying error carries one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            TdsError::Connection(e) => Some(e.code()),
            TdsError::Request(e) => Some(e.code),
            _ => None,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TdsError::Connection(e) if e.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, TdsError>;
