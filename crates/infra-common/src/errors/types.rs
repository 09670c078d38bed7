use thiserror::Error;

/// Errors raised by the shared infrastructure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging subsystem could not be installed
    #[error("Logging error: {0}")]
    Logging(String),

    /// Unexpected internal condition
    #[error("Internal error: {0}")]
    Internal(String),

    /// Free-form error carrying its own context
    #[error("{0}")]
    Custom(String),
}

/// Result alias for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;
