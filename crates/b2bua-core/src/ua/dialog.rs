//! Established dialog, shared by both roles

use tracing::debug;

use super::{Ua, UaState};
use crate::common::{status, Deferred, Result, TransactionId};
use crate::events::{CCEvent, EventKind};
use crate::sip::{Method, OutgoingResponse, SipRequest, SipResponse};

impl Ua {
    pub(super) fn dialog_recv_request(&mut self, request: SipRequest, tid: TransactionId) -> Result<Deferred> {
        let origin = self.peer_origin();
        match request.method {
            Method::Bye => {
                self.respond(&tid, OutgoingResponse::new(status::OK, "OK"));
                self.emit(CCEvent::disconnect(origin));
                Ok(self.change_state(UaState::Disconnected))
            }
            Method::Refer => {
                self.respond(&tid, OutgoingResponse::new(status::ACCEPTED, "Accepted"));
                self.send_in_dialog(Method::Bye, None)?;
                let event = match request.refer_to() {
                    Some(target) => CCEvent::disconnect_to(target.trim_matches(|c| c == '<' || c == '>'), origin),
                    None => CCEvent::disconnect(origin),
                };
                self.emit(event);
                Ok(self.change_state(UaState::Disconnected))
            }
            Method::Invite => {
                if self.pending_server.is_some() {
                    self.respond(&tid, OutgoingResponse::new(491, "Request Pending"));
                    return Ok(Deferred::new());
                }
                self.pending_server = Some(tid);
                if request.body.is_some() {
                    self.remote_media = request.body.clone();
                }
                self.emit(CCEvent::update(request.body, origin));
                Ok(Deferred::new())
            }
            Method::Info => {
                self.respond(&tid, OutgoingResponse::new(status::OK, "OK"));
                self.emit(CCEvent::info(request.body, origin));
                Ok(Deferred::new())
            }
            _ => {
                debug!(ua = %self.id, method = %request.method, "in-dialog request ignored");
                Ok(Deferred::new())
            }
        }
    }

    pub(super) fn dialog_recv_event(&mut self, event: CCEvent) -> Result<Deferred> {
        match event.kind() {
            EventKind::Disconnect(_) => {
                if let Some(tid) = self.pending_ack.take() {
                    self.tl.send_ack(&tid, None);
                }
                if let Some(tid) = self.pending_server.take() {
                    self.respond(&tid, OutgoingResponse::new(status::REQUEST_TERMINATED, "Request Terminated"));
                }
                let mut bye = self.in_dialog_request(Method::Bye, None)?;
                if let Some(reason) = event.reason() {
                    bye.headers
                        .push(crate::sip::SipHeader::new("Reason", format!("SIP;text=\"{}\"", reason)));
                }
                self.tl.send_request(bye);
                Ok(self.change_state(UaState::Disconnected))
            }
            EventKind::Update { body } => {
                if body.is_some() {
                    self.local_media = body.clone();
                }
                let tid = self.send_in_dialog(Method::Invite, body.clone())?;
                self.pending_client = Some(tid);
                Ok(Deferred::new())
            }
            EventKind::Info { body } => {
                self.send_in_dialog(Method::Info, body.clone())?;
                Ok(Deferred::new())
            }
            EventKind::Connect(p) | EventKind::PreConnect(p) => {
                if let Some(tid) = self.pending_server.take() {
                    let code = if status::is_success(p.code) { p.code } else { status::OK };
                    let mut response = OutgoingResponse::new(code, p.reason.clone());
                    response.body = p.body.clone();
                    self.respond(&tid, response);
                    self.local_media = p.body.clone();
                } else if let Some(tid) = self.pending_ack.take() {
                    self.tl.send_ack(&tid, p.body.clone());
                    self.local_media = p.body.clone();
                }
                Ok(Deferred::new())
            }
            EventKind::Fail(f) => {
                // a rejected re-INVITE leaves the call up
                if let Some(tid) = self.pending_server.take() {
                    self.respond(&tid, OutgoingResponse::new(f.code, f.reason.clone()));
                }
                Ok(Deferred::new())
            }
            EventKind::Try(_) | EventKind::Ring(_) | EventKind::Redirect(_) => Ok(Deferred::new()),
        }
    }

    pub(super) fn dialog_recv_response(&mut self, tid: TransactionId, response: SipResponse) -> Result<Deferred> {
        if self.pending_client.as_ref() == Some(&tid) {
            if status::is_provisional(response.code) {
                return Ok(Deferred::new());
            }
            self.pending_client = None;
            let origin = self.peer_origin();
            if status::is_success(response.code) {
                self.tl.send_ack(&tid, None);
                if response.body.is_some() {
                    self.remote_media = response.body.clone();
                }
                self.emit(CCEvent::connect(response.code, response.reason, response.body, origin));
            } else {
                self.emit(CCEvent::fail(response.code, response.reason, origin));
            }
            return Ok(Deferred::new());
        }

        // 2xx retransmission for the initial INVITE
        let retransmit = self.invite_tid.as_ref() == Some(&tid)
            && status::is_success(response.code)
            && self.pending_ack.as_ref() != Some(&tid);
        if retransmit {
            self.tl.send_ack(&tid, None);
        }
        Ok(Deferred::new())
    }
}
