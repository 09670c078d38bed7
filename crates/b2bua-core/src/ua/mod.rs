//! Per-leg user agent state machine
//!
//! A [`Ua`] drives one call leg. It turns inbound protocol traffic
//! (responses, requests, CANCEL, transaction timeouts) into [`CCEvent`]s
//! for the call controller, and turns events from the controller into
//! protocol actions through the [`TransactionLayer`].
//!
//! ```text
//! UAC:  Idle(UAC) -> Trying(UAC) -> Ringing(UAC) -> Connected | Failed
//! UAS:  Idle(UAS) -> Trying(UAS) -> Ringing(UAS) | PreConnect(UAS) | Connected | Failed
//!       Connected -> Disconnected -> Dead,  Failed -> Dead  (after the go-dead timer)
//! ```
//!
//! Every entry point runs with the call lock held. Events meant for the
//! controller are queued and collected with [`Ua::take_events`]; observer
//! notifications are returned as a [`Deferred`] for the caller to run once
//! the lock is released.

mod dialog;
mod uac;
mod uas;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

use crate::common::{Deferred, LegSide, Origin, Result, TransactionId, UaId};
use crate::controller::CallController;
use crate::events::CCEvent;
use crate::sip::{
    MediaBody, Method, NameAddr, OutgoingRequest, OutgoingResponse, SipRequest, SipResponse, SipUri,
    TransactionLayer,
};
use crate::timer::Timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaRole {
    Uac,
    Uas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaState {
    UacIdle,
    UacTrying,
    UacRinging,
    UasIdle,
    UasTrying,
    UasRinging,
    UasPreConnect,
    Connected,
    Disconnected,
    Failed,
    Dead,
}

impl UaState {
    /// Call attempt in progress, no final answer yet
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            UaState::UacTrying | UaState::UacRinging | UaState::UasTrying | UaState::UasRinging
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, UaState::Disconnected | UaState::Failed | UaState::Dead)
    }
}

impl fmt::Display for UaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UaState::UacIdle => "Idle(UAC)",
            UaState::UacTrying => "Trying(UAC)",
            UaState::UacRinging => "Ringing(UAC)",
            UaState::UasIdle => "Idle(UAS)",
            UaState::UasTrying => "Trying(UAS)",
            UaState::UasRinging => "Ringing(UAS)",
            UaState::UasPreConnect => "PreConnect(UAS)",
            UaState::Connected => "Connected",
            UaState::Disconnected => "Disconnected",
            UaState::Failed => "Failed",
            UaState::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// Timers a UA may run; at most one of each kind at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaTimer {
    NoReply,
    NoProgress,
    Expire,
    Credit,
    GoDead,
}

impl UaTimer {
    pub const ALL: [UaTimer; 5] = [
        UaTimer::NoReply,
        UaTimer::NoProgress,
        UaTimer::Expire,
        UaTimer::Credit,
        UaTimer::GoDead,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct TimerSlots([Option<Timeout>; 5]);

impl TimerSlots {
    fn set(&mut self, kind: UaTimer, timeout: Option<Timeout>) {
        self.cancel(kind);
        self.0[kind.slot()] = timeout;
    }

    fn cancel(&mut self, kind: UaTimer) {
        if let Some(timeout) = self.0[kind.slot()].take() {
            timeout.cancel();
        }
    }

    /// Release the slot of a timer that has just fired
    fn take(&mut self, kind: UaTimer) -> Option<Timeout> {
        self.0[kind.slot()].take()
    }

    fn is_active(&self, kind: UaTimer) -> bool {
        self.0[kind.slot()].is_some()
    }

    fn cancel_all(&mut self) {
        for kind in UaTimer::ALL {
            self.cancel(kind);
        }
    }
}

/// Snapshot of a leg handed to observers and accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegReport {
    pub ua: UaId,
    pub side: LegSide,
    pub call_id: String,
    pub cli: String,
    pub cld: String,
    /// Who caused the transition being reported
    pub origin: Origin,
    pub time: DateTime<Utc>,
    pub setup_time: DateTime<Utc>,
    pub connect_time: Option<DateTime<Utc>>,
    pub disconnect_time: Option<DateTime<Utc>>,
    /// Final (or last seen) status code
    pub code: Option<u16>,
    pub remote: Option<SocketAddr>,
}

impl LegReport {
    /// Connected duration, for legs that connected and ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.connect_time, self.disconnect_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Receives leg lifecycle notifications, always outside the call lock
pub trait LegObserver: Send + Sync {
    fn on_connect(&self, _report: &LegReport) {}
    fn on_disconnect(&self, _report: &LegReport) {}
    fn on_fail(&self, _report: &LegReport) {}
    fn on_dead(&self, _report: &LegReport) {}
}

/// Everything an originating UA needs before it sees its Try
#[derive(Debug, Clone)]
pub struct UacParams {
    pub call_id: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub request_uri: SipUri,
    pub target: SocketAddr,
    pub outbound_proxy: Option<SocketAddr>,
    /// Answer 401/407 from the callee once with these
    pub credentials: Option<(String, String)>,
    pub no_reply_time: Option<Duration>,
    pub no_progress_time: Option<Duration>,
    pub expire_time: Option<Duration>,
    pub credit_time: Option<Duration>,
    pub go_dead_timeout: Duration,
    /// Relay authentication challenges upward instead of failing plainly
    pub pass_auth: bool,
}

pub struct Ua {
    id: UaId,
    side: LegSide,
    role: UaRole,
    state: UaState,

    call_id: String,
    local_tag: String,
    remote_tag: Option<String>,
    local: NameAddr,
    remote: NameAddr,
    remote_target: SipUri,
    target: Option<SocketAddr>,
    outbound_proxy: Option<SocketAddr>,
    cli: String,
    cld: String,
    cseq: u32,

    setup_ts: DateTime<Utc>,
    setup_at: tokio::time::Instant,
    p100_ts: Option<DateTime<Utc>>,
    p1xx_ts: Option<DateTime<Utc>>,
    connect_ts: Option<DateTime<Utc>>,
    disconnect_ts: Option<DateTime<Utc>>,
    last_scode: Option<u16>,
    last_origin: Origin,

    invite_tid: Option<TransactionId>,
    invite_headers: Vec<crate::sip::SipHeader>,
    invite_body: Option<MediaBody>,
    max_forwards: Option<u32>,
    credentials: Option<(String, String)>,
    auth_attempted: bool,
    /// In-dialog INVITE from the peer awaiting our answer
    pending_server: Option<TransactionId>,
    /// Our in-dialog INVITE awaiting the peer's answer
    pending_client: Option<TransactionId>,
    /// 2xx to a bodiless INVITE, ACK held until the answer is known
    pending_ack: Option<TransactionId>,
    last_rseq: Option<u32>,

    timers: TimerSlots,
    no_reply_time: Option<Duration>,
    no_progress_time: Option<Duration>,
    expire_time: Option<Duration>,
    credit_time: Option<Duration>,
    go_dead_timeout: Duration,
    pass_auth: bool,

    local_media: Option<MediaBody>,
    remote_media: Option<MediaBody>,

    observers: Vec<Arc<dyn LegObserver>>,
    equeue: VecDeque<CCEvent>,
    lock: Weak<Mutex<CallController>>,
    tl: Arc<dyn TransactionLayer>,
}

fn new_tag() -> String {
    format!("{:08x}{:08x}", rand::random::<u32>(), rand::random::<u32>())
}

fn below(value: Duration, limit: Option<Duration>) -> bool {
    limit.map_or(true, |limit| value < limit)
}

impl Ua {
    fn base(
        role: UaRole,
        tl: Arc<dyn TransactionLayer>,
        lock: Weak<Mutex<CallController>>,
        go_dead_timeout: Duration,
    ) -> Self {
        let placeholder = NameAddr::new(SipUri::new(None, "invalid", None));
        Self {
            id: UaId::next(),
            side: match role {
                UaRole::Uas => LegSide::Answer,
                UaRole::Uac => LegSide::Originate,
            },
            role,
            state: match role {
                UaRole::Uas => UaState::UasIdle,
                UaRole::Uac => UaState::UacIdle,
            },
            call_id: String::new(),
            local_tag: new_tag(),
            remote_tag: None,
            local: placeholder.clone(),
            remote: placeholder.clone(),
            remote_target: placeholder.uri,
            target: None,
            outbound_proxy: None,
            cli: String::new(),
            cld: String::new(),
            cseq: 1,
            setup_ts: Utc::now(),
            setup_at: tokio::time::Instant::now(),
            p100_ts: None,
            p1xx_ts: None,
            connect_ts: None,
            disconnect_ts: None,
            last_scode: None,
            last_origin: Origin::Switch,
            invite_tid: None,
            invite_headers: Vec::new(),
            invite_body: None,
            max_forwards: None,
            credentials: None,
            auth_attempted: false,
            pending_server: None,
            pending_client: None,
            pending_ack: None,
            last_rseq: None,
            timers: TimerSlots::default(),
            no_reply_time: None,
            no_progress_time: None,
            expire_time: None,
            credit_time: None,
            go_dead_timeout,
            pass_auth: false,
            local_media: None,
            remote_media: None,
            observers: Vec::new(),
            equeue: VecDeque::new(),
            lock,
            tl,
        }
    }

    /// Answering UA; it learns its dialog from the first INVITE
    pub fn new_uas(
        tl: Arc<dyn TransactionLayer>,
        lock: Weak<Mutex<CallController>>,
        go_dead_timeout: Duration,
    ) -> Self {
        Self::base(UaRole::Uas, tl, lock, go_dead_timeout)
    }

    /// Originating UA towards one route
    pub fn new_uac(tl: Arc<dyn TransactionLayer>, lock: Weak<Mutex<CallController>>, params: UacParams) -> Self {
        let mut ua = Self::base(UaRole::Uac, tl, lock, params.go_dead_timeout);
        ua.call_id = params.call_id;
        ua.cli = params.from.uri.user_or_empty().to_string();
        ua.cld = params.to.uri.user_or_empty().to_string();
        ua.local = params.from;
        ua.remote = params.to;
        ua.remote_target = params.request_uri;
        ua.target = Some(params.target);
        ua.outbound_proxy = params.outbound_proxy;
        ua.credentials = params.credentials;
        ua.no_reply_time = params.no_reply_time;
        ua.no_progress_time = params.no_progress_time;
        ua.expire_time = params.expire_time;
        ua.credit_time = params.credit_time;
        ua.pass_auth = params.pass_auth;
        ua
    }

    pub fn id(&self) -> UaId {
        self.id
    }

    pub fn side(&self) -> LegSide {
        self.side
    }

    pub fn role(&self) -> UaRole {
        self.role
    }

    pub fn state(&self) -> UaState {
        self.state
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn last_scode(&self) -> Option<u16> {
        self.last_scode
    }

    pub fn setup_time(&self) -> DateTime<Utc> {
        self.setup_ts
    }

    pub fn first_provisional_time(&self) -> Option<DateTime<Utc>> {
        self.p1xx_ts
    }

    pub fn trying_time(&self) -> Option<DateTime<Utc>> {
        self.p100_ts
    }

    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.connect_ts
    }

    pub fn disconnect_time(&self) -> Option<DateTime<Utc>> {
        self.disconnect_ts
    }

    /// Our side of the dialog as the peer addressed it
    pub fn local_uri(&self) -> &SipUri {
        &self.local.uri
    }

    /// Address the peer of this leg sends from / is reached at
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.target
    }

    pub fn local_media(&self) -> Option<&MediaBody> {
        self.local_media.as_ref()
    }

    pub fn remote_media(&self) -> Option<&MediaBody> {
        self.remote_media.as_ref()
    }

    pub fn has_timer(&self, kind: UaTimer) -> bool {
        self.timers.is_active(kind)
    }

    pub fn add_observer(&mut self, observer: Arc<dyn LegObserver>) {
        self.observers.push(observer);
    }

    /// Drain the events queued for the controller, oldest first
    pub fn take_events(&mut self) -> Vec<CCEvent> {
        self.equeue.drain(..).collect()
    }

    fn emit(&mut self, event: CCEvent) {
        trace!(ua = %self.id, event = %event, "queue event for controller");
        self.equeue.push_back(event);
    }

    /// Origin tag of events this leg's peer causes
    fn peer_origin(&self) -> Origin {
        match self.role {
            UaRole::Uas => Origin::Caller,
            UaRole::Uac => Origin::Callee,
        }
    }

    /// Handle an event from the controller
    pub fn recv_event(&mut self, event: CCEvent) -> Result<Deferred> {
        debug!(ua = %self.id, state = %self.state, event = %event, "recv_event");
        self.last_origin = event.origin();
        match self.role {
            UaRole::Uac => self.uac_recv_event(event),
            UaRole::Uas => self.uas_recv_event(event),
        }
    }

    /// Handle a response on one of this leg's client transactions
    pub fn recv_response(&mut self, tid: TransactionId, response: SipResponse) -> Result<Deferred> {
        debug!(ua = %self.id, state = %self.state, code = response.code, method = %response.method, "recv_response");
        self.last_origin = self.peer_origin();
        match self.state {
            UaState::UacTrying | UaState::UacRinging => self.uac_invite_response(tid, response),
            UaState::Connected => self.dialog_recv_response(tid, response),
            UaState::Disconnected | UaState::Failed if self.role == UaRole::Uac => {
                self.uac_late_response(tid, response)
            }
            _ => Ok(Deferred::new()),
        }
    }

    /// Handle a request from the peer of this leg
    pub fn recv_request(&mut self, request: SipRequest, tid: TransactionId) -> Result<Deferred> {
        debug!(ua = %self.id, state = %self.state, method = %request.method, "recv_request");
        self.last_origin = self.peer_origin();
        match self.state {
            UaState::UasIdle => self.uas_start(request, tid),
            UaState::UasPreConnect => self.uas_preconnect_request(request, tid),
            UaState::Connected => self.dialog_recv_request(request, tid),
            UaState::Disconnected | UaState::Failed | UaState::Dead => {
                if request.method == Method::Bye {
                    self.respond(&tid, OutgoingResponse::new(200, "OK"));
                }
                Ok(Deferred::new())
            }
            _ => {
                debug!(ua = %self.id, state = %self.state, method = %request.method, "request ignored");
                Ok(Deferred::new())
            }
        }
    }

    /// CANCEL of the initial INVITE
    pub fn recv_cancel(&mut self) -> Result<Deferred> {
        self.last_origin = self.peer_origin();
        match self.state {
            UaState::UasTrying | UaState::UasRinging => self.uas_cancelled(),
            _ => Ok(Deferred::new()),
        }
    }

    /// The transaction layer gave up on one of our transactions
    pub fn recv_timeout(&mut self, tid: TransactionId) -> Result<Deferred> {
        debug!(ua = %self.id, state = %self.state, tid = %tid, "transaction timeout");
        self.last_origin = Origin::Switch;
        let is_invite = self.invite_tid.as_ref() == Some(&tid);
        match self.state {
            UaState::UacTrying | UaState::UacRinging if is_invite => {
                self.last_scode = Some(408);
                self.emit(CCEvent::fail(408, "Request Timeout", Origin::Switch));
                Ok(self.change_state(UaState::Failed))
            }
            UaState::UasPreConnect if is_invite => {
                // 2xx never acknowledged
                self.send_in_dialog(Method::Bye, None)?;
                self.emit(CCEvent::disconnect(Origin::Switch));
                Ok(self.change_state(UaState::Disconnected))
            }
            UaState::Connected if self.pending_client.as_ref() == Some(&tid) => {
                self.pending_client = None;
                self.emit(CCEvent::fail(408, "Request Timeout", Origin::Switch));
                Ok(Deferred::new())
            }
            _ => Ok(Deferred::new()),
        }
    }

    /// One of this leg's timers fired
    pub fn on_timer(&mut self, kind: UaTimer) -> Result<Deferred> {
        self.timers.take(kind);
        self.last_origin = Origin::Switch;
        debug!(ua = %self.id, state = %self.state, timer = ?kind, "timer fired");
        match (kind, self.state) {
            (UaTimer::NoReply | UaTimer::NoProgress | UaTimer::Expire, UaState::UacTrying | UaState::UacRinging) => {
                self.last_scode = Some(408);
                if let Some(tid) = &self.invite_tid {
                    self.tl.cancel(tid, None);
                }
                self.emit(CCEvent::fail(408, "Request Timeout", Origin::Switch));
                Ok(self.change_state(UaState::Failed))
            }
            (UaTimer::Credit, UaState::Connected) => self.disconnect(Some("credit time expired")),
            (UaTimer::GoDead, UaState::Disconnected | UaState::Failed) => Ok(self.change_state(UaState::Dead)),
            _ => Ok(Deferred::new()),
        }
    }

    /// Locally initiated teardown: tells the controller and acts on it
    pub fn disconnect(&mut self, reason: Option<&str>) -> Result<Deferred> {
        if self.state.is_finished() {
            return Ok(Deferred::new());
        }
        let mut event = CCEvent::disconnect(Origin::Switch);
        if let Some(reason) = reason {
            event.set_reason(reason);
        }
        self.emit(event.clone());
        self.recv_event(event)
    }

    fn change_state(&mut self, new: UaState) -> Deferred {
        let old = self.state;
        if old == new {
            return Deferred::new();
        }
        debug!(ua = %self.id, side = %self.side, from = %old, to = %new, "UA state change");
        self.state = new;

        match new {
            UaState::Connected => {
                self.timers.cancel(UaTimer::NoReply);
                self.timers.cancel(UaTimer::NoProgress);
                self.timers.cancel(UaTimer::Expire);
                self.connect_ts = Some(Utc::now());
                if let Some(credit) = self.credit_time {
                    self.start_timer(UaTimer::Credit, credit);
                }
                self.notify(|o, r| o.on_connect(r))
            }
            UaState::Failed | UaState::Disconnected => {
                self.timers.cancel_all();
                self.disconnect_ts = Some(Utc::now());
                let mut deferred = if new == UaState::Failed {
                    self.notify(|o, r| o.on_fail(r))
                } else {
                    self.notify(|o, r| o.on_disconnect(r))
                };
                if !self.start_timer(UaTimer::GoDead, self.go_dead_timeout) {
                    deferred.append(self.change_state(UaState::Dead));
                }
                deferred
            }
            UaState::Dead => {
                self.timers.cancel_all();
                self.notify(|o, r| o.on_dead(r))
            }
            _ => Deferred::new(),
        }
    }

    /// Returns false when the duration disables the timer
    fn start_timer(&mut self, kind: UaTimer, after: Duration) -> bool {
        let ua = self.id;
        let timeout = Timeout::start(self.lock.clone(), after, Some(1), move |call: &mut CallController| {
            call.on_ua_timer(ua, kind)
        });
        let started = timeout.is_some();
        self.timers.set(kind, timeout);
        started
    }

    pub fn report(&self) -> LegReport {
        LegReport {
            ua: self.id,
            side: self.side,
            call_id: self.call_id.clone(),
            cli: self.cli.clone(),
            cld: self.cld.clone(),
            origin: self.last_origin,
            time: Utc::now(),
            setup_time: self.setup_ts,
            connect_time: self.connect_ts,
            disconnect_time: self.disconnect_ts,
            code: self.last_scode,
            remote: self.target,
        }
    }

    fn notify(&self, f: fn(&dyn LegObserver, &LegReport)) -> Deferred {
        if self.observers.is_empty() {
            return Deferred::new();
        }
        let observers = self.observers.clone();
        let report = self.report();
        Deferred::from_fn(move || {
            for observer in &observers {
                f(observer.as_ref(), &report);
            }
        })
    }

    fn local_party(&self) -> NameAddr {
        self.local.clone().with_tag(Some(self.local_tag.clone()))
    }

    fn remote_party(&self) -> NameAddr {
        self.remote.clone().with_tag(self.remote_tag.clone())
    }

    fn in_dialog_request(&mut self, method: Method, body: Option<MediaBody>) -> Result<OutgoingRequest> {
        let target = self
            .target
            .ok_or_else(|| crate::common::B2buaError::invalid_state(self.state, format!("{} without peer", method)))?;
        self.cseq += 1;
        Ok(OutgoingRequest {
            ua: self.id,
            method,
            request_uri: self.remote_target.clone(),
            target,
            outbound_proxy: self.outbound_proxy,
            call_id: self.call_id.clone(),
            from: self.local_party(),
            to: self.remote_party(),
            cseq: self.cseq,
            max_forwards: None,
            rack: None,
            headers: Vec::new(),
            body,
        })
    }

    fn send_in_dialog(&mut self, method: Method, body: Option<MediaBody>) -> Result<TransactionId> {
        let request = self.in_dialog_request(method, body)?;
        Ok(self.tl.send_request(request))
    }

    fn respond(&self, tid: &TransactionId, mut response: OutgoingResponse) {
        if response.code > 100 && response.to_tag.is_none() {
            response.to_tag = Some(self.local_tag.clone());
        }
        self.tl.send_response(tid, response);
    }
}

impl Drop for Ua {
    fn drop(&mut self) {
        self.timers.cancel_all();
    }
}

impl fmt::Debug for Ua {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ua")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("state", &self.state)
            .field("call_id", &self.call_id)
            .field("last_scode", &self.last_scode)
            .finish()
    }
}
