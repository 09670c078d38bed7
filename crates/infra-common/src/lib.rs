//! Common infrastructure for the B2BUA workspace.
//!
//! This crate holds the pieces every other crate in the workspace leans on
//! but which carry no call-control semantics of their own:
//!
//! - [`logging`]: subscriber setup and per-component log contexts that
//!   produce `tracing` spans
//! - [`errors`]: the infrastructure error type and helpers for attaching
//!   component/operation context to it

pub mod errors;
pub mod logging;

pub use errors::{Error, Result};
pub use logging::{LogContext, LoggingConfig};
