//! Error types for the b2bua-core library

use thiserror::Error;

use crate::common::types::CallId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum B2buaError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid route: {0}")]
    RouteError(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid state: {state} cannot handle {input}")]
    InvalidState { state: String, input: String },

    #[error("Media policy rejection: {0}")]
    MediaPolicy(String),

    #[error("Media relay error: {0}")]
    MediaRelay(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Infrastructure error: {0}")]
    Infra(#[from] infra_common::Error),
}

impl B2buaError {
    pub fn invalid_state(state: impl ToString, input: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.to_string(),
            input: input.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, B2buaError>;
