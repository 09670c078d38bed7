//! Answering side: INVITE in, responses out

use tracing::debug;

use super::{Ua, UaState};
use crate::common::{status, B2buaError, Deferred, Origin, Result, TransactionId};
use crate::events::{CCEvent, EventKind, TryData};
use crate::sip::{Method, OutgoingResponse, SipHeader, SipRequest};

impl Ua {
    pub(super) fn uas_start(&mut self, request: SipRequest, tid: TransactionId) -> Result<Deferred> {
        if request.method != Method::Invite {
            return Err(B2buaError::invalid_state(self.state, request.method.to_string()));
        }
        self.call_id = request.call_id.clone();
        self.remote_tag = request.from.tag.clone();
        self.remote = request.from.clone().with_tag(None);
        self.local = request.to.clone().with_tag(None);
        self.remote_target = request.contact.clone().unwrap_or_else(|| request.from.uri.clone());
        self.target = Some(request.source);
        self.cli = request.from.uri.user_or_empty().to_string();
        self.cld = request.request_uri.user_or_empty().to_string();
        self.invite_tid = Some(tid);
        self.remote_media = request.body.clone();
        self.setup_ts = chrono::Utc::now();

        let caller_name = request.from.display_name.clone();
        let auth = request.authorization().map(str::to_string);
        let mut event = CCEvent::try_call(
            TryData {
                call_id: request.call_id,
                cli: self.cli.clone(),
                cld: self.cld.clone(),
                body: request.body,
                auth,
                caller_name,
            },
            Origin::Caller,
        )
        .with_headers(request.headers);
        if let Some(max_forwards) = request.max_forwards {
            event.set_max_forwards(max_forwards);
        }
        self.emit(event);
        Ok(self.change_state(UaState::UasTrying))
    }

    fn server_tid(&self) -> Result<TransactionId> {
        self.invite_tid
            .clone()
            .ok_or_else(|| B2buaError::invalid_state(self.state, "answer without INVITE"))
    }

    pub(super) fn uas_recv_event(&mut self, event: CCEvent) -> Result<Deferred> {
        let pending = matches!(self.state, UaState::UasTrying | UaState::UasRinging);
        match event.kind() {
            EventKind::Ring(p) if pending => {
                if p.code == status::TRYING {
                    return Ok(Deferred::new());
                }
                let tid = self.server_tid()?;
                let mut response = OutgoingResponse::new(p.code, p.reason.clone());
                response.body = p.body.clone();
                response.headers = event.extra_headers().to_vec();
                self.respond(&tid, response);
                self.last_scode = Some(p.code);
                if p.body.is_some() {
                    self.local_media = p.body.clone();
                }
                Ok(self.change_state(UaState::UasRinging))
            }
            EventKind::Connect(p) | EventKind::PreConnect(p) if pending => {
                let tid = self.server_tid()?;
                let code = if status::is_success(p.code) { p.code } else { status::OK };
                let mut response = OutgoingResponse::new(code, p.reason.clone());
                response.body = p.body.clone();
                response.headers = event.extra_headers().to_vec();
                self.respond(&tid, response);
                self.last_scode = Some(code);
                self.local_media = p.body.clone();
                let next = match event.kind() {
                    EventKind::PreConnect(_) => UaState::UasPreConnect,
                    _ => UaState::Connected,
                };
                Ok(self.change_state(next))
            }
            EventKind::Fail(f) if pending => {
                let tid = self.server_tid()?;
                let mut response = OutgoingResponse::new(f.code, f.reason.clone());
                response.headers = f.challenges.clone();
                if let Some(warning) = &f.warning {
                    response.headers.push(SipHeader::new("Warning", warning.clone()));
                }
                self.respond(&tid, response);
                self.last_scode = Some(f.code);
                Ok(self.change_state(UaState::Failed))
            }
            EventKind::Redirect(r) if pending => {
                let tid = self.server_tid()?;
                let mut response = OutgoingResponse::new(r.code, r.reason.clone());
                response.contact = r.targets.first().cloned();
                response.headers = r
                    .targets
                    .iter()
                    .skip(1)
                    .map(|t| SipHeader::new("Contact", format!("<{}>", t)))
                    .collect();
                self.respond(&tid, response);
                self.last_scode = Some(r.code);
                Ok(self.change_state(UaState::Failed))
            }
            EventKind::Disconnect(d) if pending => {
                let tid = self.server_tid()?;
                let response = match &d.redirect {
                    Some(target) => {
                        let mut response = OutgoingResponse::new(status::MOVED_TEMPORARILY, "Moved Temporarily");
                        response.headers.push(SipHeader::new("Contact", format!("<{}>", target)));
                        response
                    }
                    None => OutgoingResponse::new(status::INTERNAL_ERROR, "Disconnected"),
                };
                self.last_scode = Some(response.code);
                self.respond(&tid, response);
                Ok(self.change_state(UaState::Disconnected))
            }
            EventKind::Disconnect(_) if self.state == UaState::UasPreConnect => {
                self.send_in_dialog(Method::Bye, None)?;
                Ok(self.change_state(UaState::Disconnected))
            }
            // nothing was ever answered, nothing to tear down
            EventKind::Fail(_) | EventKind::Disconnect(_) if self.state == UaState::UasIdle => {
                Ok(self.change_state(UaState::Dead))
            }
            _ if self.state == UaState::Connected => self.dialog_recv_event(event),
            kind => {
                debug!(ua = %self.id, state = %self.state, event = kind.name(), "event ignored");
                Ok(Deferred::new())
            }
        }
    }

    pub(super) fn uas_cancelled(&mut self) -> Result<Deferred> {
        let tid = self.server_tid()?;
        self.respond(&tid, OutgoingResponse::new(status::REQUEST_TERMINATED, "Request Terminated"));
        self.last_scode = Some(status::REQUEST_TERMINATED);
        self.emit(CCEvent::disconnect(Origin::Caller));
        Ok(self.change_state(UaState::Disconnected))
    }

    /// Our 2xx is out, waiting for the caller's ACK
    pub(super) fn uas_preconnect_request(&mut self, request: SipRequest, tid: TransactionId) -> Result<Deferred> {
        match request.method {
            Method::Ack => {
                if request.body.is_some() {
                    self.remote_media = request.body.clone();
                }
                self.emit(CCEvent::connect(status::OK, "OK", request.body, Origin::Caller));
                Ok(self.change_state(UaState::Connected))
            }
            Method::Bye => {
                self.respond(&tid, OutgoingResponse::new(status::OK, "OK"));
                self.emit(CCEvent::disconnect(Origin::Caller));
                Ok(self.change_state(UaState::Disconnected))
            }
            _ => Ok(Deferred::new()),
        }
    }
}
