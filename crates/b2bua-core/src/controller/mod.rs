//! Call controller: bridges one ingress leg to a sequence of egress attempts
//!
//! ```text
//! Idle -> WaitRoute -> RouteComplete -> Connected -> Disconnecting -> Dead
//! ```
//!
//! The controller owns both legs. Events a leg produces are pumped into the
//! controller, which decides whether to relay them to the other leg, fail
//! over to the next route, or synthesize a failure of its own. All methods
//! run with the call lock held; anything observable from outside is
//! returned as a [`Deferred`].

pub mod handle;

use infra_common::LogContext;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};

use crate::accounting::{Accounting, AccountingObserver};
use crate::auth::{AuthRequest, Authorizer};
use crate::common::{status, B2buaError, CallId, Deferred, LegSide, Origin, Result, TransactionId, UaId};
use crate::config::B2buaConfig;
use crate::events::{CCEvent, EventKind, TryData};
use crate::media::{filter_payload_types, MediaRelay, MediaRelaySession};
use crate::registry::RegistryLink;
use crate::route::{GroupTimeout, Route, RouteDefaults, RouteTemplate};
use crate::sip::{MediaBody, NameAddr, SipHeader, SipRequest, SipResponse, SipUri, TransactionLayer};
use crate::timer::Timeout;
use crate::ua::{LegObserver, Ua, UaState, UaTimer, UacParams};

pub use handle::{CallHandle, CallInfo};

/// Upper bound on relay rounds per entry point; legs answering each other
/// forever would otherwise spin with the lock held
const MAX_PUMP_ROUNDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallState {
    Idle,
    /// Authorization / route lookup in flight
    WaitRoute,
    /// An egress attempt has been placed
    RouteComplete,
    Connected,
    Disconnecting,
    Dead,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "Idle",
            CallState::WaitRoute => "WaitRoute",
            CallState::RouteComplete => "RouteComplete",
            CallState::Connected => "Connected",
            CallState::Disconnecting => "Disconnecting",
            CallState::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// Settings and collaborators shared by every call of one B2BUA
pub(crate) struct CallServices {
    pub config: B2buaConfig,
    pub static_route: Option<RouteTemplate>,
    pub tl: Arc<dyn TransactionLayer>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub accounting: Arc<dyn Accounting>,
    pub media_relay: Option<Arc<dyn MediaRelay>>,
}

/// Outcome of the asynchronous route lookup
enum Routing {
    Rejected,
    Routes {
        /// Resolved routes, ranked 1.. in queue order
        routes: Vec<(u32, Route)>,
        credit_time: Option<Duration>,
        cli: Option<String>,
        caller_name: Option<String>,
    },
}

pub struct CallController {
    id: CallId,
    state: CallState,
    services: Arc<CallServices>,
    lock: Weak<Mutex<CallController>>,
    registry: Option<RegistryLink>,
    removed: bool,
    log: LogContext,
    accounting: Arc<dyn LegObserver>,

    ua_a: Ua,
    ua_o: Option<Ua>,
    /// Egress legs replaced by failover, kept until they are dead so late
    /// responses still reach them
    retired: Vec<Ua>,

    call_id: String,
    cli: String,
    cld: String,
    caller_name: Option<String>,
    auth: Option<String>,
    source: Option<SocketAddr>,
    local_host: String,
    max_forwards: u32,
    pass_headers: Vec<SipHeader>,
    body: Option<MediaBody>,

    routes: VecDeque<Route>,
    /// Route of the current (or last) egress attempt
    attempt: Option<Route>,

    routing_task: Option<JoinHandle<()>>,
    routing_generation: u64,
    group_timer: Option<Timeout>,
    media: Option<Arc<dyn MediaRelaySession>>,
}

impl CallController {
    /// Create a call with an idle ingress leg and return its handle
    pub(crate) fn spawn(id: CallId, services: Arc<CallServices>, registry: Option<RegistryLink>) -> CallHandle {
        let accounting: Arc<dyn LegObserver> = AccountingObserver::new(services.accounting.clone());
        let inner = Arc::new_cyclic(|lock: &Weak<Mutex<CallController>>| {
            let mut ua_a = Ua::new_uas(services.tl.clone(), lock.clone(), services.config.go_dead_timeout);
            ua_a.add_observer(accounting.clone());
            Mutex::new(CallController {
                id,
                state: CallState::Idle,
                lock: lock.clone(),
                registry,
                removed: false,
                log: LogContext::with_operation("b2bua", "call").with_field("call", id.to_string()),
                accounting,
                ua_a,
                ua_o: None,
                retired: Vec::new(),
                call_id: String::new(),
                cli: String::new(),
                cld: String::new(),
                caller_name: None,
                auth: None,
                source: None,
                local_host: String::new(),
                max_forwards: services.config.max_forwards,
                pass_headers: Vec::new(),
                body: None,
                routes: VecDeque::new(),
                attempt: None,
                routing_task: None,
                routing_generation: 0,
                group_timer: None,
                media: None,
                services: services.clone(),
            })
        });
        CallHandle::new(id, inner)
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn ingress(&self) -> &Ua {
        &self.ua_a
    }

    pub fn egress(&self) -> Option<&Ua> {
        self.ua_o.as_ref()
    }

    /// Rank of the current (or last) egress attempt
    pub fn rnum(&self) -> Option<u32> {
        self.attempt.as_ref().map(|route| route.rnum)
    }

    /// Routes still queued for failover
    pub fn routes_left(&self) -> usize {
        self.routes.len()
    }

    pub fn has_media_session(&self) -> bool {
        self.media.is_some()
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            id: self.id,
            state: self.state,
            call_id: self.call_id.clone(),
            cli: self.cli.clone(),
            cld: self.cld.clone(),
            rnum: self.rnum(),
            routes_left: self.routes.len(),
            ingress: self.ua_a.state().to_string(),
            egress: self.ua_o.as_ref().map(|ua| ua.state().to_string()),
            setup_time: self.ua_a.setup_time(),
        }
    }

    /// Run `f` inside this call's log span
    pub(crate) fn traced<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let span = self.log.span(Level::DEBUG);
        let _entered = span.enter();
        f(self)
    }

    // Entry points

    pub(crate) fn recv_request(&mut self, ua: UaId, request: SipRequest, tid: TransactionId) -> Deferred {
        self.dispatch(ua, |leg| leg.recv_request(request, tid))
    }

    pub(crate) fn recv_response(&mut self, ua: UaId, tid: TransactionId, response: SipResponse) -> Deferred {
        self.dispatch(ua, |leg| leg.recv_response(tid, response))
    }

    pub(crate) fn recv_cancel(&mut self, ua: UaId) -> Deferred {
        self.dispatch(ua, |leg| leg.recv_cancel())
    }

    pub(crate) fn recv_timeout(&mut self, ua: UaId, tid: TransactionId) -> Deferred {
        self.dispatch(ua, |leg| leg.recv_timeout(tid))
    }

    pub(crate) fn on_ua_timer(&mut self, ua: UaId, kind: UaTimer) -> Deferred {
        self.traced(|call| call.dispatch(ua, |leg| leg.on_timer(kind)))
    }

    /// Tear the call down from the switch side
    pub(crate) fn disconnect(&mut self, reason: Option<&str>) -> Deferred {
        info!(state = %self.state, reason = reason.unwrap_or("-"), "disconnect requested");
        let mut deferred = Deferred::new();
        if !self.ua_a.state().is_finished() {
            let id = self.ua_a.id();
            let result = self.ua_a.disconnect(reason);
            deferred.append(self.leg_result(id, result));
        } else if let Some(ua_o) = self.ua_o.as_mut() {
            let id = ua_o.id();
            let result = ua_o.disconnect(reason);
            deferred.append(self.leg_result(id, result));
        }
        deferred.append(self.settle());
        deferred
    }

    fn leg_mut(&mut self, id: UaId) -> Option<&mut Ua> {
        if self.ua_a.id() == id {
            return Some(&mut self.ua_a);
        }
        if let Some(ua_o) = self.ua_o.as_mut().filter(|ua| ua.id() == id) {
            return Some(ua_o);
        }
        self.retired.iter_mut().find(|ua| ua.id() == id)
    }

    fn dispatch<F>(&mut self, ua: UaId, f: F) -> Deferred
    where
        F: FnOnce(&mut Ua) -> Result<Deferred>,
    {
        let result = match self.leg_mut(ua) {
            Some(leg) => f(leg),
            None => {
                debug!(ua = %ua, "no such leg in call");
                return Deferred::new();
            }
        };
        let mut deferred = self.leg_result(ua, result);
        deferred.append(self.settle());
        deferred
    }

    fn settle(&mut self) -> Deferred {
        let mut deferred = self.pump();
        deferred.append(self.check_dead());
        deferred
    }

    fn leg_result(&mut self, ua: UaId, result: Result<Deferred>) -> Deferred {
        match result {
            Ok(deferred) => deferred,
            Err(e) => {
                warn!(ua = %ua, error = %e, "leg state machine error");
                self.leg_failed(ua)
            }
        }
    }

    /// A leg returned an error: fail the ingress with a fixed 500 if it is
    /// still unanswered, otherwise force a disconnect of the offending leg
    fn leg_failed(&mut self, ua: UaId) -> Deferred {
        let mut deferred = Deferred::new();
        let result = if ua == self.ua_a.id() && self.ua_a.state().is_pending() {
            let result = self.ua_a.recv_event(CCEvent::fail(
                status::INTERNAL_ERROR,
                status::REASON_LEG_ERROR,
                Origin::Switch,
            ));
            if let Some(ua_o) = self.ua_o.as_mut() {
                match ua_o.recv_event(CCEvent::disconnect(Origin::Switch)) {
                    Ok(d) => deferred.append(d),
                    Err(e) => warn!(ua = %ua_o.id(), error = %e, "egress teardown failed"),
                }
            }
            self.enter_disconnecting();
            result
        } else {
            match self.leg_mut(ua) {
                Some(leg) => leg.disconnect(Some("internal error")),
                None => Ok(Deferred::new()),
            }
        };
        match result {
            Ok(d) => deferred.append(d),
            Err(e) => warn!(ua = %ua, error = %e, "leg teardown failed"),
        }
        deferred
    }

    /// Move queued events between the legs until both are quiet
    fn pump(&mut self) -> Deferred {
        let mut deferred = Deferred::new();
        for _ in 0..MAX_PUMP_ROUNDS {
            let ingress = self.ua_a.take_events();
            let egress: Vec<(UaId, CCEvent)> = match self.ua_o.as_mut() {
                Some(ua_o) => {
                    let id = ua_o.id();
                    ua_o.take_events().into_iter().map(|event| (id, event)).collect()
                }
                None => Vec::new(),
            };
            for leg in &mut self.retired {
                for event in leg.take_events() {
                    debug!(ua = %leg.id(), event = %event, "event from retired leg dropped");
                }
            }
            if ingress.is_empty() && egress.is_empty() {
                return deferred;
            }
            for event in ingress {
                deferred.append(self.on_ingress_event(event));
            }
            for (ua, event) in egress {
                if self.ua_o.as_ref().map(Ua::id) != Some(ua) {
                    debug!(ua = %ua, event = %event, "event from replaced leg dropped");
                    continue;
                }
                deferred.append(self.on_egress_event(event));
            }
        }
        warn!(state = %self.state, "event pump did not settle");
        deferred
    }

    fn on_ingress_event(&mut self, event: CCEvent) -> Deferred {
        debug!(state = %self.state, event = %event, "ingress event");
        let mut deferred = Deferred::new();
        match self.state {
            CallState::Idle => {
                if matches!(event.kind(), EventKind::Try(_)) {
                    deferred.append(self.start_call(event));
                }
            }
            CallState::RouteComplete | CallState::Connected | CallState::Disconnecting => {
                if !matches!(event.kind(), EventKind::Try(_)) {
                    deferred.append(self.relay_to_egress(event));
                }
            }
            CallState::WaitRoute | CallState::Dead => {}
        }
        if self.ua_a.state().is_finished() {
            self.enter_disconnecting();
        }
        deferred
    }

    fn on_egress_event(&mut self, mut event: CCEvent) -> Deferred {
        debug!(state = %self.state, event = %event, "egress event");
        let failed = matches!(event.kind(), EventKind::Fail(_) | EventKind::Disconnect(_));
        if failed && self.state == CallState::RouteComplete && self.ua_a.state().is_pending() {
            let terminal = matches!(event.kind(), EventKind::Fail(f) if f.terminal);
            let code = event.status_code();
            let huntstop = match (code, self.attempt.as_ref()) {
                (Some(code), Some(route)) => route.is_huntstop(code),
                _ => false,
            };
            let forward_on_fail = self.attempt.as_ref().map_or(true, |route| route.policy.forward_on_fail);
            if !terminal && !huntstop && !self.routes.is_empty() {
                info!(
                    rnum = self.rnum().unwrap_or(0),
                    code = code.unwrap_or(0),
                    remaining = self.routes.len(),
                    "egress attempt failed, trying next route"
                );
                return self.place_next_route();
            }
            if matches!(event.kind(), EventKind::Fail(_)) && !terminal && !huntstop && !forward_on_fail {
                event = CCEvent::fail(status::INTERNAL_ERROR, status::REASON_NO_ROUTE, Origin::Switch);
            }
        }

        if matches!(event.kind(), EventKind::Connect(_) | EventKind::PreConnect(_))
            && self.state == CallState::RouteComplete
        {
            info!(rnum = self.rnum().unwrap_or(0), "call connected");
            self.state = CallState::Connected;
            if let Some(timer) = self.group_timer.take() {
                timer.cancel();
            }
            self.routes.clear();
        }

        let deferred = self.relay_to_ingress(event);
        let egress_finished = self.ua_o.as_ref().map_or(false, |ua| ua.state().is_finished());
        if egress_finished || self.ua_a.state().is_finished() {
            self.enter_disconnecting();
        }
        deferred
    }

    fn relay_to_egress(&mut self, event: CCEvent) -> Deferred {
        if self.ua_o.is_none() {
            return Deferred::new();
        }
        let event = self.hook_media(event, LegSide::Answer);
        match self.ua_o.as_mut() {
            Some(ua_o) => {
                let id = ua_o.id();
                let result = ua_o.recv_event(event);
                self.leg_result(id, result)
            }
            None => Deferred::new(),
        }
    }

    fn relay_to_ingress(&mut self, event: CCEvent) -> Deferred {
        let event = self.hook_media(event, LegSide::Originate);
        let id = self.ua_a.id();
        let result = self.ua_a.recv_event(event);
        self.leg_result(id, result)
    }

    /// Push a media description through the relay session, if any
    fn hook_media(&self, event: CCEvent, from: LegSide) -> CCEvent {
        let (Some(session), Some(body)) = (self.media.as_ref(), event.body()) else {
            return event;
        };
        let rewritten = match from {
            LegSide::Answer => session.caller_media_changed(body),
            LegSide::Originate => session.callee_media_changed(body),
        };
        match rewritten {
            Ok(body) => event.with_body(Some(body)),
            Err(e) => {
                warn!(error = %e, "media relay refused body, forwarding it unchanged");
                event
            }
        }
    }

    fn start_call(&mut self, event: CCEvent) -> Deferred {
        let EventKind::Try(data) = event.kind() else {
            return Deferred::new();
        };
        let services = self.services.clone();
        let config = &services.config;

        self.call_id = data.call_id.clone();
        self.cli = data.cli.clone();
        self.caller_name = data.caller_name.clone();
        self.auth = data.auth.clone();
        self.source = self.ua_a.remote_addr();
        self.local_host = self.ua_a.local_uri().host.clone();
        self.max_forwards = event.max_forwards().unwrap_or(config.max_forwards);
        self.pass_headers = event
            .extra_headers()
            .iter()
            .filter(|h| config.pass_headers.iter().any(|name| h.is(name)))
            .cloned()
            .collect();
        self.log.set_field("call_id", self.call_id.clone());
        info!(cli = %data.cli, cld = %data.cld, source = ?self.source, "new call");

        if data.cld.is_empty() {
            return self.reject(status::INTERNAL_ERROR, status::REASON_NO_CLD);
        }

        let mut body = data.body.clone();
        if let (Some(allowed), Some(offer)) = (&config.allowed_pts, &body) {
            match filter_payload_types(offer, allowed) {
                Ok(filtered) => body = Some(filtered),
                Err(e) => {
                    info!(error = %e, "no acceptable media format offered");
                    return self.reject(status::NOT_ACCEPTABLE_HERE, "Not Acceptable Here");
                }
            }
        }
        self.body = body;

        self.cld = match &config.rewrite_cld {
            Some(rule) => rule.apply(&data.cld),
            None => data.cld.clone(),
        };
        if self.cld != data.cld {
            debug!(from = %data.cld, to = %self.cld, "destination rewritten");
        }

        if config.media_relay {
            self.ensure_media();
        }
        self.start_routing()
    }

    /// Answer the ingress leg with a locally generated failure
    fn reject(&mut self, code: u16, reason: &str) -> Deferred {
        info!(code, reason, "call rejected");
        let id = self.ua_a.id();
        let result = self.ua_a.recv_event(CCEvent::fail(code, reason, Origin::Switch));
        let deferred = self.leg_result(id, result);
        self.enter_disconnecting();
        deferred
    }

    fn ensure_media(&mut self) {
        if self.media.is_some() {
            return;
        }
        let Some(relay) = self.services.media_relay.clone() else {
            warn!("media relay requested but none configured");
            return;
        };
        match relay.new_session(&self.call_id) {
            Ok(session) => {
                if let Some(source) = self.source {
                    session.set_caller_target(source);
                }
                debug!("media relay session created");
                self.media = Some(session);
            }
            Err(e) => warn!(error = %e, "media relay session not created, call continues unrelayed"),
        }
    }

    fn delete_media(&mut self) {
        if let Some(session) = self.media.take() {
            debug!("media relay session deleted");
            session.delete();
        }
    }

    fn start_routing(&mut self) -> Deferred {
        let services = self.services.clone();
        if services.authorizer.is_none() && services.static_route.is_none() {
            warn!("neither an authorizer nor a static route is configured");
            return self.reject(status::INTERNAL_ERROR, status::REASON_NO_ROUTE);
        }
        let Some(source) = self.source else {
            return self.reject(status::INTERNAL_ERROR, status::REASON_LEG_ERROR);
        };

        self.state = CallState::WaitRoute;
        self.routing_generation += 1;
        let generation = self.routing_generation;
        let request = AuthRequest {
            identity: self.auth.clone(),
            caller: self.cli.clone(),
            callee: self.cld.clone(),
            call_id: self.call_id.clone(),
            source,
            caller_name: self.caller_name.clone(),
        };
        let lock = self.lock.clone();
        self.routing_task = Some(tokio::spawn(async move {
            let outcome = lookup_routes(services, request).await;
            let Some(lock) = lock.upgrade() else {
                return;
            };
            let deferred = {
                let mut call = lock.lock();
                call.traced(|call| call.on_routing(generation, outcome))
            };
            deferred.run();
        }));
        Deferred::new()
    }

    fn cancel_routing(&mut self) {
        if let Some(task) = self.routing_task.take() {
            debug!("route lookup abandoned");
            task.abort();
        }
        self.routing_generation += 1;
    }

    fn on_routing(&mut self, generation: u64, outcome: Result<Routing>) -> Deferred {
        if generation != self.routing_generation || self.state != CallState::WaitRoute {
            debug!(state = %self.state, "stale routing result dropped");
            return Deferred::new();
        }
        self.routing_task = None;

        let mut deferred = match outcome {
            Err(e) => {
                warn!(error = %e, "route lookup failed");
                self.reject(status::INTERNAL_ERROR, status::REASON_NO_ROUTE)
            }
            Ok(Routing::Rejected) => self.reject(status::FORBIDDEN, "Auth Failed"),
            Ok(Routing::Routes { credit_time: Some(credit), .. }) if credit.is_zero() => {
                self.reject(status::FORBIDDEN, "No Credit")
            }
            Ok(Routing::Routes {
                routes,
                credit_time,
                cli,
                caller_name,
            }) => {
                if let Some(cli) = cli {
                    self.cli = cli;
                }
                if caller_name.is_some() {
                    self.caller_name = caller_name;
                }
                let defaults = RouteDefaults {
                    cli: self.cli.clone(),
                    cld: self.cld.clone(),
                    caller_name: self.caller_name.clone(),
                    credit_time,
                    max_credit_time: self.services.config.max_credit_time,
                };
                self.routes = routes
                    .iter()
                    .map(|(rnum, route)| route.customize(*rnum, &defaults))
                    .collect();
                debug!(routes = self.routes.len(), "routes ready");
                self.place_next_route()
            }
        };
        deferred.append(self.settle());
        deferred
    }

    fn place_next_route(&mut self) -> Deferred {
        if self.max_forwards <= 1 {
            return self.reject(status::TOO_MANY_HOPS, "Too Many Hops");
        }
        while let Some(route) = self.routes.pop_front() {
            let rnum = route.rnum;
            match self.place_originate(route) {
                Ok(deferred) => return deferred,
                Err(e) => warn!(rnum, error = %e, "route unusable, skipped"),
            }
        }
        self.reject(status::INTERNAL_ERROR, status::REASON_NO_ROUTE)
    }

    /// Create the egress leg for `route` and hand it the Try
    fn place_originate(&mut self, route: Route) -> Result<Deferred> {
        let services = self.services.clone();
        let config = &services.config;
        let source = self
            .source
            .ok_or_else(|| B2buaError::RouteError("ingress source unknown".into()))?;
        let target = if route.is_reflect() {
            source
        } else {
            route
                .select_address(source)
                .ok_or_else(|| B2buaError::RouteError(format!("{} has no usable address", route.host)))?
        };

        let cld = match &config.rewrite_egress_cld {
            Some(rule) => rule.apply(&route.cld),
            None => route.cld.clone(),
        };
        let call_id = if config.hide_call_id {
            format!("{:x}-b2b_{}", md5::compute(self.call_id.as_bytes()), route.rnum)
        } else {
            format!("{}-b2b_{}", self.call_id, route.rnum)
        };
        let uri = if route.is_reflect() {
            SipUri::from_addr(Some(&cld), target)
        } else {
            match route.host.parse::<IpAddr>() {
                Ok(ip) => SipUri::from_addr(Some(&cld), SocketAddr::new(ip, route.port)),
                Err(_) => SipUri::new(Some(&cld), route.host.clone(), Some(route.port)),
            }
        };
        let from = NameAddr::new(SipUri::new(Some(&route.cli), self.local_host.clone(), None))
            .with_display_name(route.caller_name.clone());
        let outbound_proxy = route.outbound_proxy.filter(|proxy| *proxy != source);
        let params = UacParams {
            call_id: call_id.clone(),
            from,
            to: NameAddr::new(uri.clone()),
            request_uri: uri,
            target,
            outbound_proxy,
            credentials: route.policy.auth.clone(),
            no_reply_time: route.policy.no_reply_expires.or(config.no_reply_time),
            no_progress_time: route.policy.no_progress_expires.or(config.no_progress_time),
            expire_time: route.policy.expires.or(config.expire_time),
            credit_time: route.policy.credit_time,
            go_dead_timeout: config.go_dead_timeout,
            pass_auth: config.pass_auth,
        };

        if route.policy.media_relay == Some(true) {
            self.ensure_media();
        }
        let body = match (&self.media, &self.body) {
            (Some(session), Some(offer)) => {
                session.set_callee_target(target);
                match session.caller_media_changed(offer) {
                    Ok(rewritten) => Some(rewritten),
                    Err(e) => {
                        warn!(error = %e, "media relay refused offer, forwarding it unchanged");
                        Some(offer.clone())
                    }
                }
            }
            (Some(session), None) => {
                session.set_callee_target(target);
                None
            }
            (None, body) => body.clone(),
        };

        let mut headers = self.pass_headers.clone();
        headers.extend(route.policy.extra_headers.iter().cloned());
        let mut event = CCEvent::try_call(
            TryData {
                call_id,
                cli: route.cli.clone(),
                cld: cld.clone(),
                body,
                auth: if config.pass_auth { self.auth.clone() } else { None },
                caller_name: route.caller_name.clone(),
            },
            Origin::Caller,
        )
        .with_headers(headers);
        event.set_max_forwards(self.max_forwards - 1);

        let mut ua = Ua::new_uac(services.tl.clone(), self.lock.clone(), params);
        ua.add_observer(self.accounting.clone());
        let ua_id = ua.id();
        if let Some(old) = self.ua_o.replace(ua) {
            if old.state() != UaState::Dead {
                self.retired.push(old);
            }
        }

        if let Some(group_timeout) = route.policy.group_timeout {
            self.start_group_timer(group_timeout);
        }
        self.state = CallState::RouteComplete;
        self.log.set_field("rnum", route.rnum.to_string());
        info!(rnum = route.rnum, cld = %cld, target = %target, "placing egress attempt");
        self.attempt = Some(route);

        let result = match self.ua_o.as_mut() {
            Some(ua_o) => ua_o.recv_event(event),
            None => Ok(Deferred::new()),
        };
        Ok(self.leg_result(ua_id, result))
    }

    fn start_group_timer(&mut self, group_timeout: GroupTimeout) {
        if let Some(old) = self.group_timer.take() {
            old.cancel();
        }
        let cutoff = group_timeout.cutoff_rank;
        self.group_timer = Timeout::start(
            self.lock.clone(),
            group_timeout.timeout,
            Some(1),
            move |call: &mut CallController| call.traced(|call| call.on_group_timeout(cutoff)),
        );
    }

    fn on_group_timeout(&mut self, cutoff: u32) -> Deferred {
        self.group_timer = None;
        if self.state != CallState::RouteComplete || !self.ua_a.state().is_pending() {
            return Deferred::new();
        }
        let (Some(first), Some(last)) = (
            self.routes.front().map(|r| r.rnum),
            self.routes.back().map(|r| r.rnum),
        ) else {
            return Deferred::new();
        };
        if first > cutoff {
            return Deferred::new();
        }
        if cutoff == last + 1 {
            info!(cutoff, "group timeout in the last group, no further failover");
            self.routes.clear();
            return Deferred::new();
        }
        while self.routes.front().map_or(false, |r| r.rnum < cutoff) {
            self.routes.pop_front();
        }
        info!(cutoff, remaining = self.routes.len(), "group timeout, skipping to the next group");
        let Some(ua_o) = self.ua_o.as_mut() else {
            return Deferred::new();
        };
        let id = ua_o.id();
        let result = ua_o.disconnect(Some("group timeout"));
        let mut deferred = self.leg_result(id, result);
        deferred.append(self.settle());
        deferred
    }

    fn enter_disconnecting(&mut self) {
        if matches!(self.state, CallState::Disconnecting | CallState::Dead) {
            return;
        }
        info!(from = %self.state, "call disconnecting");
        self.state = CallState::Disconnecting;
        self.cancel_routing();
        if let Some(timer) = self.group_timer.take() {
            timer.cancel();
        }
        self.routes.clear();
        self.delete_media();
    }

    /// Dead once both legs and every retired egress leg are; the registry
    /// entry goes exactly once
    fn check_dead(&mut self) -> Deferred {
        self.retired.retain(|ua| ua.state() != UaState::Dead);
        if self.state == CallState::Dead {
            return Deferred::new();
        }
        let egress_dead = self.ua_o.as_ref().map_or(true, |ua| ua.state() == UaState::Dead);
        if self.ua_a.state() != UaState::Dead || !egress_dead || !self.retired.is_empty() {
            return Deferred::new();
        }
        self.enter_disconnecting();
        self.state = CallState::Dead;
        info!("call dead");

        if self.removed {
            return Deferred::new();
        }
        self.removed = true;
        match self.registry.clone() {
            Some(registry) => {
                let id = self.id;
                Deferred::from_fn(move || {
                    registry.remove(id);
                })
            }
            None => Deferred::new(),
        }
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(task) = self.routing_task.take() {
            task.abort();
        }
        if let Some(timer) = self.group_timer.take() {
            timer.cancel();
        }
        self.delete_media();
    }
}

impl fmt::Debug for CallController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallController")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("ingress", &self.ua_a)
            .field("egress", &self.ua_o)
            .field("routes_left", &self.routes.len())
            .finish()
    }
}

/// Authorize the call and resolve the routes it may take
async fn lookup_routes(services: Arc<CallServices>, request: AuthRequest) -> Result<Routing> {
    let mut templates = Vec::new();
    let mut credit_time = None;
    let mut cli = None;
    let mut caller_name = None;

    if let Some(authorizer) = &services.authorizer {
        let result = authorizer.authorize(request).await?;
        if !result.accepted() {
            return Ok(Routing::Rejected);
        }
        credit_time = result.credit_time();
        cli = result.cli_override();
        caller_name = result.caller_name();
        for text in result.routes() {
            match RouteTemplate::parse(&text) {
                Ok(template) => templates.push(template),
                Err(e) => warn!(route = %text, error = %e, "unparsable route skipped"),
            }
        }
    }
    if templates.is_empty() {
        if let Some(template) = &services.static_route {
            templates.push(template.clone());
        }
    }

    // ranks are counted over the routes that resolved, starting at 1
    let mut routes = Vec::with_capacity(templates.len());
    for template in &templates {
        match template.resolve().await {
            Ok(route) => routes.push((routes.len() as u32 + 1, route)),
            Err(e) => warn!(host = %template.host, error = %e, "route not resolved, skipped"),
        }
    }
    Ok(Routing::Routes {
        routes,
        credit_time,
        cli,
        caller_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::NoopAccounting;
    use crate::sip::Method;
    use crate::ua::test_support::{invite, RecordingLayer, Sent};
    use pretty_assertions::assert_eq;

    fn services(tl: Arc<RecordingLayer>, config: B2buaConfig) -> Arc<CallServices> {
        let static_route = config
            .static_route
            .as_deref()
            .map(RouteTemplate::parse)
            .transpose()
            .unwrap();
        Arc::new(CallServices {
            config,
            static_route,
            tl,
            authorizer: None,
            accounting: Arc::new(NoopAccounting),
            media_relay: None,
        })
    }

    fn invite_tid(tl: &RecordingLayer) -> Option<TransactionId> {
        tl.sent.lock().iter().find_map(|s| match s {
            Sent::Request(r, tid) if r.method == Method::Invite => Some(tid.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_missing_destination_rejected() {
        let tl = Arc::new(RecordingLayer::default());
        let call = CallController::spawn(CallId(1), services(tl.clone(), B2buaConfig::default()), None);
        call.recv_request(call.ingress_ua(), invite("100", "", None), TransactionId::new("s1"));

        let responses = tl.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].code, 500);
        assert_eq!(responses[0].reason, status::REASON_NO_CLD);
        assert_eq!(call.state(), CallState::Disconnecting);
    }

    #[tokio::test]
    async fn test_no_routing_source_rejected() {
        let tl = Arc::new(RecordingLayer::default());
        let call = CallController::spawn(CallId(2), services(tl.clone(), B2buaConfig::default()), None);
        call.recv_request(call.ingress_ua(), invite("100", "200", None), TransactionId::new("s1"));
        assert_eq!(tl.responses()[0].reason, status::REASON_NO_ROUTE);
    }

    #[tokio::test]
    async fn test_static_route_places_egress() {
        let tl = Arc::new(RecordingLayer::default());
        let config = B2buaConfig::default()
            .with_static_route("192.0.2.20:5070")
            .with_pass_headers(vec!["X-Account".into()])
            .with_hide_call_id(true);
        let call = CallController::spawn(CallId(3), services(tl.clone(), config), None);
        call.recv_request(call.ingress_ua(), invite("100", "200", None), TransactionId::new("s1"));
        assert_eq!(call.state(), CallState::WaitRoute);

        // let the route lookup task run
        for _ in 0..10 {
            if invite_tid(&tl).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(call.state(), CallState::RouteComplete);
        let invites = tl.requests(Method::Invite);
        assert_eq!(invites.len(), 1);
        let egress = &invites[0];
        assert_eq!(egress.target, "192.0.2.20:5070".parse::<SocketAddr>().unwrap());
        assert_eq!(egress.max_forwards, Some(69));
        assert_eq!(egress.header("X-Account"), Some("42"));
        assert!(egress.call_id.ends_with("-b2b_1"));
        assert!(!egress.call_id.starts_with("ingress-call"));
        assert_eq!(egress.request_uri.user.as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn test_too_many_hops() {
        let tl = Arc::new(RecordingLayer::default());
        let config = B2buaConfig::default().with_static_route("192.0.2.20");
        let call = CallController::spawn(CallId(4), services(tl.clone(), config), None);
        let mut request = invite("100", "200", None);
        request.max_forwards = Some(1);
        call.recv_request(call.ingress_ua(), request, TransactionId::new("s1"));
        for _ in 0..10 {
            if !tl.responses().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(tl.responses()[0].code, 483);
        assert!(tl.requests(Method::Invite).is_empty());
    }

    #[derive(Default)]
    struct DeadLegs(std::sync::atomic::AtomicUsize);

    impl LegObserver for DeadLegs {
        fn on_dead(&self, _report: &crate::ua::LegReport) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl DeadLegs {
        fn count(&self) -> usize {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lingering_retired_leg_keeps_call_alive() {
        let tl = Arc::new(RecordingLayer::default());
        let config = B2buaConfig::default().with_static_route("192.0.2.20");
        let call = CallController::spawn(CallId(5), services(tl.clone(), config), None);
        call.recv_request(call.ingress_ua(), invite("100", "200", None), TransactionId::new("s1"));
        for _ in 0..10 {
            if invite_tid(&tl).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        call.disconnect(Some("caller gone"));
        assert_eq!(call.state(), CallState::Disconnecting);

        // the egress attempt lingers as a replaced leg while the ingress dies
        let dead = Arc::new(DeadLegs::default());
        let deferred = call.with_mut(|c| {
            let mut leg = c.ua_o.take().unwrap();
            leg.add_observer(dead.clone());
            c.retired.push(leg);
            let mut deferred = c.ua_a.on_timer(UaTimer::GoDead).unwrap();
            deferred.append(c.check_dead());
            deferred
        });
        deferred.run();
        assert_eq!(call.with(|c| c.ingress().state()), UaState::Dead);
        assert_eq!(call.state(), CallState::Disconnecting);
        assert_eq!(dead.count(), 0);

        let deferred = call.with_mut(|c| {
            let mut deferred = c.retired[0].on_timer(UaTimer::GoDead).unwrap();
            deferred.append(c.check_dead());
            deferred
        });
        deferred.run();
        assert_eq!(call.state(), CallState::Dead);
        assert_eq!(dead.count(), 1);
        assert!(call.with(|c| c.retired.is_empty()));
    }
}
