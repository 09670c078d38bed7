//! SIP boundary types
//!
//! Wire parsing, serialization and transaction retransmission live outside
//! this crate. The types here are the already-parsed view of a message that
//! the transaction layer hands to a call, plus the [`TransactionLayer`]
//! contract through which a call sends requests and responses back out.
//!
//! All [`TransactionLayer`] methods are invoked while the per-call lock is
//! held, so implementations must only queue work and never block or call
//! back into the same call synchronously.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::common::{TransactionId, UaId};

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Refer,
    Info,
    Prack,
    Update,
    Options,
    Other(String),
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Options => "OPTIONS",
            Method::Other(name) => name.as_str(),
        };
        f.write_str(name)
    }
}

/// A single header as name/value text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

impl SipHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for SipHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

fn find_header<'a>(headers: &'a [SipHeader], name: &str) -> Option<&'a str> {
    headers.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
}

/// Minimal SIP URI: `sip:[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipUri {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    pub fn new(user: Option<&str>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            user: user.map(str::to_string),
            host: host.into(),
            port,
        }
    }

    /// URI pointing at a resolved socket address
    pub fn from_addr(user: Option<&str>, addr: SocketAddr) -> Self {
        let host = match addr {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
        };
        Self::new(user, host, Some(addr.port()))
    }

    pub fn user_or_empty(&self) -> &str {
        self.user.as_deref().unwrap_or("")
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// From/To style address with optional display name and tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            tag: None,
        }
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }
}

/// Opaque media description (normally SDP) carried in a message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaBody {
    pub content_type: String,
    pub content: Bytes,
}

impl MediaBody {
    pub fn new(content_type: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            content: content.into(),
        }
    }

    pub fn sdp(text: impl Into<String>) -> Self {
        Self::new("application/sdp", Bytes::from(text.into()))
    }

    pub fn is_sdp(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("application/sdp")
    }

    /// Body as text, if it is valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// An inbound request, already parsed and matched to its transaction
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: Method,
    pub request_uri: SipUri,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: u32,
    pub max_forwards: Option<u32>,
    pub contact: Option<SipUri>,
    pub headers: Vec<SipHeader>,
    pub body: Option<MediaBody>,
    /// Network address the request was received from
    pub source: SocketAddr,
}

impl SipRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn authorization(&self) -> Option<&str> {
        self.header("Authorization")
            .or_else(|| self.header("Proxy-Authorization"))
    }

    pub fn refer_to(&self) -> Option<&str> {
        self.header("Refer-To")
    }
}

/// An inbound response, already matched to a client transaction
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub code: u16,
    pub reason: String,
    pub cseq: u32,
    pub method: Method,
    pub to_tag: Option<String>,
    pub contacts: Vec<SipUri>,
    /// RSeq of a reliable provisional response
    pub rseq: Option<u32>,
    pub headers: Vec<SipHeader>,
    pub body: Option<MediaBody>,
    pub source: Option<SocketAddr>,
}

impl SipResponse {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            cseq: 1,
            method: Method::Invite,
            to_tag: None,
            contacts: Vec::new(),
            rseq: None,
            headers: Vec::new(),
            body: None,
            source: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// `WWW-Authenticate` / `Proxy-Authenticate` challenges
    pub fn challenges(&self) -> Vec<SipHeader> {
        self.headers
            .iter()
            .filter(|h| h.is("WWW-Authenticate") || h.is("Proxy-Authenticate"))
            .cloned()
            .collect()
    }

    pub fn warning(&self) -> Option<&str> {
        self.header("Warning")
    }
}

/// `RAck` header content for a PRACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

/// A request a UA asks the transaction layer to send
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// UA the request belongs to; responses and in-dialog requests for this
    /// dialog must be delivered back to the same UA
    pub ua: UaId,
    pub method: Method,
    pub request_uri: SipUri,
    /// Resolved next hop
    pub target: SocketAddr,
    pub outbound_proxy: Option<SocketAddr>,
    pub call_id: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub cseq: u32,
    pub max_forwards: Option<u32>,
    pub rack: Option<RAck>,
    pub headers: Vec<SipHeader>,
    pub body: Option<MediaBody>,
}

impl OutgoingRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A response a UA asks the transaction layer to send on a server transaction
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub code: u16,
    pub reason: String,
    pub to_tag: Option<String>,
    pub contact: Option<SipUri>,
    pub headers: Vec<SipHeader>,
    pub body: Option<MediaBody>,
}

impl OutgoingResponse {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            to_tag: None,
            contact: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Contract of the external transaction layer
pub trait TransactionLayer: Send + Sync {
    /// Start a client transaction; the returned id tags every response
    fn send_request(&self, request: OutgoingRequest) -> TransactionId;

    /// Answer a server transaction
    fn send_response(&self, tid: &TransactionId, response: OutgoingResponse);

    /// Acknowledge a final 2xx on an INVITE client transaction
    fn send_ack(&self, tid: &TransactionId, body: Option<MediaBody>);

    /// Send CANCEL for a pending INVITE client transaction
    fn cancel(&self, tid: &TransactionId, reason: Option<String>);
}
