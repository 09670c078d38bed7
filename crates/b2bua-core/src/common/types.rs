//! Common types used throughout the b2bua-core library

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Numeric identifier of a call controller, unique per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one user agent (call leg) instance.
///
/// A fresh id is minted for every UA, including every egress UA created
/// during route failover, so stale timers and responses can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UaId(pub u64);

impl UaId {
    pub fn next() -> Self {
        static NEXT_UA_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_UA_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ua-{}", self.0)
    }
}

/// Opaque handle of a transaction owned by the external transaction layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which of the two legs of a call a UA serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegSide {
    /// Ingress leg: the inbound call this side answers (UAS)
    Answer,
    /// Egress leg: the outbound call this side originates (UAC)
    Originate,
}

impl fmt::Display for LegSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegSide::Answer => f.write_str("answer"),
            LegSide::Originate => f.write_str("originate"),
        }
    }
}

/// Tag naming who generated a call-control event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    Caller,
    Callee,
    /// Generated locally: timeouts, policy decisions, administrative actions
    Switch,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Caller => f.write_str("caller"),
            Origin::Callee => f.write_str("callee"),
            Origin::Switch => f.write_str("switch"),
        }
    }
}

/// Status codes and reason phrases the core generates on its own
pub mod status {
    pub const TRYING: u16 = 100;
    pub const RINGING: u16 = 180;
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const MOVED_TEMPORARILY: u16 = 302;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const PROXY_AUTH_REQUIRED: u16 = 407;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const CALL_DOES_NOT_EXIST: u16 = 481;
    pub const TOO_MANY_HOPS: u16 = 483;
    pub const REQUEST_TERMINATED: u16 = 487;
    pub const NOT_ACCEPTABLE_HERE: u16 = 488;
    pub const INTERNAL_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const BAD_GATEWAY: u16 = 502;

    /// Missing destination id on the inbound call
    pub const REASON_NO_CLD: &str = "Internal Server Error (1)";
    /// No usable route after authorization
    pub const REASON_NO_ROUTE: &str = "Internal Server Error (2)";
    /// A leg state machine returned an error
    pub const REASON_LEG_ERROR: &str = "Internal Server Error (3)";

    pub fn is_provisional(code: u16) -> bool {
        (100..200).contains(&code)
    }

    pub fn is_success(code: u16) -> bool {
        (200..300).contains(&code)
    }

    pub fn is_redirect(code: u16) -> bool {
        (300..400).contains(&code)
    }

    pub fn is_auth_challenge(code: u16) -> bool {
        code == UNAUTHORIZED || code == PROXY_AUTH_REQUIRED
    }
}

/// Callbacks that must run only after the per-call lock is released.
///
/// State transitions collect user-visible notifications here instead of
/// invoking them in place, so a callback that starts new call activity can
/// never re-enter a lock its caller still holds.
#[derive(Default)]
#[must_use = "deferred callbacks do nothing unless run after the call lock is released"]
pub struct Deferred(Vec<Box<dyn FnOnce() + Send + 'static>>);

impl Deferred {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_fn(f: impl FnOnce() + Send + 'static) -> Self {
        let mut deferred = Self::new();
        deferred.push(f);
        deferred
    }

    pub fn push(&mut self, f: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(f));
    }

    pub fn append(&mut self, mut other: Deferred) {
        self.0.append(&mut other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Invoke the callbacks in the order they were queued
    pub fn run(self) {
        for f in self.0 {
            f();
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("callbacks", &self.0.len()).finish()
    }
}
