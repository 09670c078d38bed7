//! Call-control events
//!
//! A [`CCEvent`] is the signal exchanged between the call controller and a
//! user agent. Raw protocol traffic never crosses that boundary; a UA turns
//! responses, requests and timeouts into events for the controller, and
//! turns events from the controller into protocol actions.
//!
//! The set of event kinds is closed: [`EventKind`] has exactly nine variants
//! and every consumer matches on it exhaustively, so adding a kind is a
//! compile-checked change everywhere it matters.
//!
//! Every event gets a process-wide sequence number when it is built. The
//! counter is a single atomic behind [`next_event_seq`], so sequence numbers
//! are unique and increase in construction order across threads.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::common::Origin;
use crate::sip::{MediaBody, SipHeader, SipUri};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Allocate the next global event sequence number
pub fn next_event_seq() -> u64 {
    EVENT_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// Receipt time of an event: wall clock for records, monotonic for math
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl EventTime {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn wall(&self) -> DateTime<Utc> {
        self.wall
    }

    pub fn mono(&self) -> Instant {
        self.mono
    }
}

/// Payload of a Try event: a new call attempt
#[derive(Debug, Clone, PartialEq)]
pub struct TryData {
    pub call_id: String,
    /// Caller id
    pub cli: String,
    /// Destination id
    pub cld: String,
    pub body: Option<MediaBody>,
    /// Authorization credential presented by the caller
    pub auth: Option<String>,
    pub caller_name: Option<String>,
}

/// Payload of Ring, Connect and PreConnect
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub code: u16,
    pub reason: String,
    pub body: Option<MediaBody>,
}

impl Progress {
    pub fn new(code: u16, reason: impl Into<String>, body: Option<MediaBody>) -> Self {
        Self {
            code,
            reason: reason.into(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedirectData {
    pub code: u16,
    pub reason: String,
    pub targets: Vec<SipUri>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailData {
    pub code: u16,
    pub reason: String,
    /// Authentication challenges to hand back to the caller (401/407)
    pub challenges: Vec<SipHeader>,
    pub warning: Option<String>,
    /// Local protocol violation; must not trigger route failover
    pub terminal: bool,
}

impl FailData {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            challenges: Vec::new(),
            warning: None,
            terminal: false,
        }
    }

    pub fn with_challenges(mut self, challenges: Vec<SipHeader>) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectData {
    /// Transfer target (REFER / Also)
    pub redirect: Option<String>,
}

/// The nine kinds of call-control event
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Try(TryData),
    Ring(Progress),
    Connect(Progress),
    PreConnect(Progress),
    Update { body: Option<MediaBody> },
    Info { body: Option<MediaBody> },
    Redirect(RedirectData),
    Fail(FailData),
    Disconnect(DisconnectData),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Try(_) => "Try",
            EventKind::Ring(_) => "Ring",
            EventKind::Connect(_) => "Connect",
            EventKind::PreConnect(_) => "PreConnect",
            EventKind::Update { .. } => "Update",
            EventKind::Info { .. } => "Info",
            EventKind::Redirect(_) => "Redirect",
            EventKind::Fail(_) => "Fail",
            EventKind::Disconnect(_) => "Disconnect",
        }
    }
}

/// An immutable call-control event
///
/// Only the reason annotation and the max-forwards override may be filled
/// in after construction.
#[derive(Debug, Clone)]
pub struct CCEvent {
    seq: u64,
    rtime: EventTime,
    origin: Origin,
    extra_headers: Vec<SipHeader>,
    reason: Option<String>,
    max_forwards: Option<u32>,
    kind: EventKind,
}

impl CCEvent {
    pub fn new(kind: EventKind, origin: Origin) -> Self {
        Self::at(kind, origin, EventTime::now())
    }

    pub fn at(kind: EventKind, origin: Origin, rtime: EventTime) -> Self {
        Self {
            seq: next_event_seq(),
            rtime,
            origin,
            extra_headers: Vec::new(),
            reason: None,
            max_forwards: None,
            kind,
        }
    }

    pub fn with_headers(mut self, headers: Vec<SipHeader>) -> Self {
        self.extra_headers = headers;
        self
    }

    pub fn try_call(data: TryData, origin: Origin) -> Self {
        Self::new(EventKind::Try(data), origin)
    }

    pub fn ring(code: u16, reason: impl Into<String>, body: Option<MediaBody>, origin: Origin) -> Self {
        Self::new(EventKind::Ring(Progress::new(code, reason, body)), origin)
    }

    pub fn connect(code: u16, reason: impl Into<String>, body: Option<MediaBody>, origin: Origin) -> Self {
        Self::new(EventKind::Connect(Progress::new(code, reason, body)), origin)
    }

    pub fn pre_connect(code: u16, reason: impl Into<String>, body: Option<MediaBody>, origin: Origin) -> Self {
        Self::new(EventKind::PreConnect(Progress::new(code, reason, body)), origin)
    }

    pub fn update(body: Option<MediaBody>, origin: Origin) -> Self {
        Self::new(EventKind::Update { body }, origin)
    }

    pub fn info(body: Option<MediaBody>, origin: Origin) -> Self {
        Self::new(EventKind::Info { body }, origin)
    }

    pub fn redirect(code: u16, reason: impl Into<String>, targets: Vec<SipUri>, origin: Origin) -> Self {
        Self::new(
            EventKind::Redirect(RedirectData {
                code,
                reason: reason.into(),
                targets,
            }),
            origin,
        )
    }

    pub fn fail(code: u16, reason: impl Into<String>, origin: Origin) -> Self {
        Self::new(EventKind::Fail(FailData::new(code, reason)), origin)
    }

    pub fn fail_with(data: FailData, origin: Origin) -> Self {
        Self::new(EventKind::Fail(data), origin)
    }

    pub fn disconnect(origin: Origin) -> Self {
        Self::new(EventKind::Disconnect(DisconnectData::default()), origin)
    }

    pub fn disconnect_to(redirect: impl Into<String>, origin: Origin) -> Self {
        Self::new(
            EventKind::Disconnect(DisconnectData {
                redirect: Some(redirect.into()),
            }),
            origin,
        )
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn rtime(&self) -> EventTime {
        self.rtime
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn extra_headers(&self) -> &[SipHeader] {
        &self.extra_headers
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.max_forwards
    }

    pub fn set_max_forwards(&mut self, max_forwards: u32) {
        self.max_forwards = Some(max_forwards);
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Media body, for the kinds that can carry one
    pub fn body(&self) -> Option<&MediaBody> {
        match &self.kind {
            EventKind::Try(data) => data.body.as_ref(),
            EventKind::Ring(p) | EventKind::Connect(p) | EventKind::PreConnect(p) => p.body.as_ref(),
            EventKind::Update { body } | EventKind::Info { body } => body.as_ref(),
            EventKind::Redirect(_) | EventKind::Fail(_) | EventKind::Disconnect(_) => None,
        }
    }

    /// A new event like this one but carrying `body`. Kinds without a body
    /// are copied unchanged; the copy gets its own sequence number.
    pub(crate) fn with_body(self, body: Option<MediaBody>) -> CCEvent {
        let kind = match self.kind {
            EventKind::Try(data) => EventKind::Try(TryData { body, ..data }),
            EventKind::Ring(p) => EventKind::Ring(Progress { body, ..p }),
            EventKind::Connect(p) => EventKind::Connect(Progress { body, ..p }),
            EventKind::PreConnect(p) => EventKind::PreConnect(Progress { body, ..p }),
            EventKind::Update { .. } => EventKind::Update { body },
            EventKind::Info { .. } => EventKind::Info { body },
            other => other,
        };
        CCEvent {
            seq: next_event_seq(),
            kind,
            ..self
        }
    }

    /// Status code carried by Ring/Connect/PreConnect/Redirect/Fail
    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            EventKind::Ring(p) | EventKind::Connect(p) | EventKind::PreConnect(p) => Some(p.code),
            EventKind::Redirect(r) => Some(r.code),
            EventKind::Fail(f) => Some(f.code),
            EventKind::Try(_) | EventKind::Update { .. } | EventKind::Info { .. } | EventKind::Disconnect(_) => None,
        }
    }
}

impl fmt::Display for CCEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.seq)?;
        if let Some(code) = self.status_code() {
            write!(f, "({})", code)?;
        }
        write!(f, " from {}", self.origin)
    }
}
