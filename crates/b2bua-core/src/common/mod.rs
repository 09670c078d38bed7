//! Shared identifiers, status codes and error types

pub mod errors;
pub mod types;

pub use errors::{B2buaError, Result};
pub use types::*;
