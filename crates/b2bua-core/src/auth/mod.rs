//! Authorization collaborator
//!
//! The B2BUA asks an external authorizer (typically a RADIUS client) whether
//! a call may proceed. The answer carries a decision plus a list of
//! attributes: in dynamic routing mode the route list itself, and optionally
//! a credit-time limit and caller-id overrides.

pub mod digest;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

use crate::common::Result;

pub use digest::DigestChallenge;

/// Attribute carrying `Routing:`, `CLI:` and `CNAM:` values
pub const IVR_IN_ATTR: &str = "h323-ivr-in";
/// Attribute carrying the credit-time limit in seconds
pub const CREDIT_TIME_ATTR: &str = "h323-credit-time";

/// What is being authorized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Credential presented by the caller, if any
    pub identity: Option<String>,
    /// Caller id (CLI)
    pub caller: String,
    /// Destination id (CLD) after inbound rewriting
    pub callee: String,
    pub call_id: String,
    pub source: SocketAddr,
    pub caller_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
}

/// Result delivered by an [`Authorizer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub decision: AuthDecision,
    pub attributes: Vec<(String, String)>,
}

impl AuthResult {
    pub fn accept(attributes: Vec<(String, String)>) -> Self {
        Self {
            decision: AuthDecision::Accept,
            attributes,
        }
    }

    pub fn reject() -> Self {
        Self {
            decision: AuthDecision::Reject,
            attributes: Vec::new(),
        }
    }

    pub fn accepted(&self) -> bool {
        self.decision == AuthDecision::Accept
    }

    fn prefixed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attributes
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(IVR_IN_ATTR))
            .filter_map(move |(_, value)| value.strip_prefix(prefix))
    }

    /// Route templates in the order the authorizer listed them
    pub fn routes(&self) -> Vec<String> {
        self.prefixed("Routing:").map(str::to_string).collect()
    }

    /// Credit time granted to the call. `Some(ZERO)` means no credit left.
    pub fn credit_time(&self) -> Option<Duration> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CREDIT_TIME_ATTR))
            .and_then(|(_, value)| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn cli_override(&self) -> Option<String> {
        self.prefixed("CLI:").next().map(str::to_string)
    }

    pub fn caller_name(&self) -> Option<String> {
        self.prefixed("CNAM:").next().map(str::to_string)
    }
}

/// External authorization step
///
/// Implementations may take as long as they need; the call controller runs
/// them on a separate task and cancels the task if the caller hangs up
/// first.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: AuthRequest) -> Result<AuthResult>;
}
