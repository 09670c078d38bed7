//! Test doubles for the collaborators of the call core

#![allow(dead_code)]

use async_trait::async_trait;
use b2bua_core::auth::{AuthRequest, AuthResult, Authorizer, IVR_IN_ATTR};
use b2bua_core::media::{MediaRelay, MediaRelaySession};
use b2bua_core::sip::{
    MediaBody, Method, NameAddr, OutgoingRequest, OutgoingResponse, SipHeader, SipRequest, SipResponse, SipUri,
    TransactionLayer,
};
use b2bua_core::{Accounting, B2bua, B2buaConfig, LegReport, Result, TransactionId};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const CALLER_ADDR: &str = "198.51.100.7:5060";

pub fn addr(text: &str) -> SocketAddr {
    text.parse().unwrap()
}

#[derive(Debug, Clone)]
pub enum Sent {
    Request(OutgoingRequest, TransactionId),
    Response(TransactionId, OutgoingResponse),
    Ack(TransactionId, Option<MediaBody>),
    Cancel(TransactionId),
}

/// Transaction layer that records everything the core sends
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    next: AtomicUsize,
}

impl MockTransport {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn requests(&self, method: Method) -> Vec<(OutgoingRequest, TransactionId)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Request(r, tid) if r.method == method => Some((r.clone(), tid.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn invites(&self) -> Vec<(OutgoingRequest, TransactionId)> {
        self.requests(Method::Invite)
    }

    /// Responses sent on a server transaction
    pub fn responses_to(&self, tid: &TransactionId) -> Vec<OutgoingResponse> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Response(t, r) if t == tid => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn final_response(&self, tid: &TransactionId) -> Option<OutgoingResponse> {
        self.responses_to(tid).into_iter().rev().find(|r| r.code >= 200)
    }

    pub fn cancelled(&self, tid: &TransactionId) -> bool {
        self.sent
            .lock()
            .iter()
            .any(|s| matches!(s, Sent::Cancel(t) if t == tid))
    }

    pub fn acks(&self) -> Vec<(TransactionId, Option<MediaBody>)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Ack(tid, body) => Some((tid.clone(), body.clone())),
                _ => None,
            })
            .collect()
    }
}

impl TransactionLayer for MockTransport {
    fn send_request(&self, request: OutgoingRequest) -> TransactionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let tid = TransactionId::new(format!("client-{}", n));
        self.sent.lock().push(Sent::Request(request, tid.clone()));
        tid
    }

    fn send_response(&self, tid: &TransactionId, response: OutgoingResponse) {
        self.sent.lock().push(Sent::Response(tid.clone(), response));
    }

    fn send_ack(&self, tid: &TransactionId, body: Option<MediaBody>) {
        self.sent.lock().push(Sent::Ack(tid.clone(), body));
    }

    fn cancel(&self, tid: &TransactionId, _reason: Option<String>) {
        self.sent.lock().push(Sent::Cancel(tid.clone()));
    }
}

/// Authorizer answering every request with a fixed result, optionally
/// holding the answer until released
pub struct ScriptedAuthorizer {
    result: AuthResult,
    hold: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
    pub abandoned: Arc<AtomicBool>,
    pub last_request: Mutex<Option<AuthRequest>>,
}

struct AbandonGuard {
    done: bool,
    flag: Arc<AtomicBool>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.done {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

impl ScriptedAuthorizer {
    pub fn accept(routes: &[&str]) -> Self {
        Self::with_attributes(
            routes
                .iter()
                .map(|r| (IVR_IN_ATTR.to_string(), format!("Routing:{}", r)))
                .collect(),
        )
    }

    pub fn with_attributes(attributes: Vec<(String, String)>) -> Self {
        Self {
            result: AuthResult::accept(attributes),
            hold: None,
            calls: AtomicUsize::new(0),
            abandoned: Arc::new(AtomicBool::new(false)),
            last_request: Mutex::new(None),
        }
    }

    pub fn reject() -> Self {
        let mut authorizer = Self::with_attributes(Vec::new());
        authorizer.result = AuthResult::reject();
        authorizer
    }

    pub fn held(mut self, gate: Arc<Notify>) -> Self {
        self.hold = Some(gate);
        self
    }
}

#[async_trait]
impl Authorizer for ScriptedAuthorizer {
    async fn authorize(&self, request: AuthRequest) -> Result<AuthResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request);
        let mut guard = AbandonGuard {
            done: false,
            flag: self.abandoned.clone(),
        };
        if let Some(gate) = &self.hold {
            gate.notified().await;
        }
        guard.done = true;
        Ok(self.result.clone())
    }
}

#[derive(Default)]
pub struct RecordingAccounting {
    pub events: Mutex<Vec<(&'static str, LegReport)>>,
}

impl RecordingAccounting {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(kind, _)| *kind).collect()
    }
}

impl Accounting for RecordingAccounting {
    fn connect(&self, report: &LegReport) {
        self.events.lock().push(("connect", report.clone()));
    }

    fn disconnect(&self, report: &LegReport) {
        self.events.lock().push(("disconnect", report.clone()));
    }
}

/// Relay that tags every body it sees with the side it came from
#[derive(Default)]
pub struct RecordingRelay {
    pub sessions: AtomicUsize,
    pub deleted: Arc<AtomicUsize>,
    pub callee_targets: Arc<Mutex<Vec<SocketAddr>>>,
}

struct RecordingSession {
    deleted: Arc<AtomicUsize>,
    callee_targets: Arc<Mutex<Vec<SocketAddr>>>,
}

fn tag_body(body: &MediaBody, tag: &str) -> MediaBody {
    let text = body.as_text().unwrap_or_default();
    MediaBody::sdp(format!("{}a=relayed-{}\r\n", text, tag))
}

impl MediaRelay for RecordingRelay {
    fn new_session(&self, _call_id: &str) -> Result<Arc<dyn MediaRelaySession>> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingSession {
            deleted: self.deleted.clone(),
            callee_targets: self.callee_targets.clone(),
        }))
    }
}

impl MediaRelaySession for RecordingSession {
    fn set_caller_target(&self, _addr: SocketAddr) {}

    fn set_callee_target(&self, addr: SocketAddr) {
        self.callee_targets.lock().push(addr);
    }

    fn caller_media_changed(&self, body: &MediaBody) -> Result<MediaBody> {
        Ok(tag_body(body, "caller"))
    }

    fn callee_media_changed(&self, body: &MediaBody) -> Result<MediaBody> {
        Ok(tag_body(body, "callee"))
    }

    fn delete(&self) {
        self.deleted.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn offer() -> MediaBody {
    MediaBody::sdp("v=0\r\nm=audio 4000 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n")
}

pub fn answer() -> MediaBody {
    MediaBody::sdp("v=0\r\nm=audio 5000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n")
}

pub fn invite(cli: &str, cld: &str, body: Option<MediaBody>) -> SipRequest {
    SipRequest {
        method: Method::Invite,
        request_uri: SipUri::new(Some(cld), "b2b.example.net", None),
        from: NameAddr::new(SipUri::new(Some(cli), "caller.example.net", None)).with_tag(Some("caller-tag".into())),
        to: NameAddr::new(SipUri::new(Some(cld), "b2b.example.net", None)),
        call_id: "abc123@caller".into(),
        cseq: 1,
        max_forwards: Some(70),
        contact: Some(SipUri::new(Some(cli), "198.51.100.7", Some(5060))),
        headers: vec![SipHeader::new("X-Trace", "t-1")],
        body,
        source: addr(CALLER_ADDR),
    }
}

/// A request from the caller inside the established ingress dialog
pub fn caller_request(method: Method) -> SipRequest {
    let mut request = invite("1000", "2000", None);
    request.method = method;
    request.cseq = 2;
    request.to = request.to.with_tag(Some("b2b-tag".into()));
    request
}

pub fn response(code: u16, reason: &str, to_tag: Option<&str>, body: Option<MediaBody>) -> SipResponse {
    let mut response = SipResponse::new(code, reason);
    response.to_tag = to_tag.map(str::to_string);
    response.body = body;
    response
}

pub fn b2bua(
    config: B2buaConfig,
    tl: Arc<MockTransport>,
    authorizer: Option<Arc<ScriptedAuthorizer>>,
    accounting: Option<Arc<RecordingAccounting>>,
    relay: Option<Arc<RecordingRelay>>,
) -> B2bua {
    let mut builder = B2bua::builder(config).transaction_layer(tl);
    if let Some(authorizer) = authorizer {
        builder = builder.authorizer(authorizer);
    }
    if let Some(accounting) = accounting {
        builder = builder.accounting(accounting);
    }
    if let Some(relay) = relay {
        builder = builder.media_relay(relay);
    }
    builder.build().unwrap()
}

/// Let spawned route lookups and timer tasks run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Go-dead linger used in these tests
pub const GO_DEAD: Duration = Duration::from_secs(32);
