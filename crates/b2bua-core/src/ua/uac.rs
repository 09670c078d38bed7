//! Originating side: INVITE out, responses in

use tracing::{debug, warn};

use super::{below, Ua, UaState, UaTimer};
use crate::auth::DigestChallenge;
use crate::common::{status, Deferred, Origin, Result, TransactionId};
use crate::events::{CCEvent, EventKind, FailData, TryData};
use crate::sip::{Method, OutgoingRequest, RAck, SipHeader, SipResponse};

impl Ua {
    pub(super) fn uac_recv_event(&mut self, event: CCEvent) -> Result<Deferred> {
        match (self.state, event.kind()) {
            (UaState::UacIdle, EventKind::Try(data)) => {
                let data = data.clone();
                self.uac_start(&event, data)
            }
            (UaState::UacIdle, EventKind::Fail(_) | EventKind::Redirect(_) | EventKind::Disconnect(_)) => {
                Ok(self.change_state(UaState::Dead))
            }
            (
                UaState::UacTrying | UaState::UacRinging,
                EventKind::Fail(_) | EventKind::Redirect(_) | EventKind::Disconnect(_),
            ) => {
                if let Some(tid) = &self.invite_tid {
                    self.tl.cancel(tid, event.reason().map(str::to_string));
                }
                Ok(self.change_state(UaState::Disconnected))
            }
            (UaState::Connected, _) => self.dialog_recv_event(event),
            (state, kind) => {
                debug!(ua = %self.id, state = %state, event = kind.name(), "event ignored");
                Ok(Deferred::new())
            }
        }
    }

    fn uac_start(&mut self, event: &CCEvent, data: TryData) -> Result<Deferred> {
        self.invite_headers = event.extra_headers().to_vec();
        if self.pass_auth {
            if let Some(credential) = &data.auth {
                self.invite_headers.push(SipHeader::new("Authorization", credential.clone()));
            }
        }
        if data.caller_name.is_some() {
            self.local.display_name = data.caller_name.clone();
        }
        self.invite_body = data.body.clone();
        self.local_media = data.body;
        self.max_forwards = event.max_forwards();
        self.setup_ts = event.rtime().wall();
        self.setup_at = tokio::time::Instant::now();

        self.send_invite()?;

        if let Some(expire) = self.expire_time {
            self.start_timer(UaTimer::Expire, expire);
        }
        match (self.no_reply_time, self.no_progress_time) {
            (Some(nr), np) if below(nr, np) && below(nr, self.expire_time) => {
                self.start_timer(UaTimer::NoReply, nr);
            }
            (_, Some(np)) if below(np, self.expire_time) => {
                self.start_timer(UaTimer::NoProgress, np);
            }
            _ => {}
        }

        Ok(self.change_state(UaState::UacTrying))
    }

    fn send_invite(&mut self) -> Result<()> {
        let target = self
            .target
            .ok_or_else(|| crate::common::B2buaError::invalid_state(self.state, "INVITE without target"))?;
        let request = OutgoingRequest {
            ua: self.id,
            method: Method::Invite,
            request_uri: self.remote_target.clone(),
            target,
            outbound_proxy: self.outbound_proxy,
            call_id: self.call_id.clone(),
            from: self.local_party(),
            to: self.remote.clone(),
            cseq: self.cseq,
            max_forwards: self.max_forwards,
            rack: None,
            headers: self.invite_headers.clone(),
            body: self.invite_body.clone(),
        };
        self.invite_tid = Some(self.tl.send_request(request));
        Ok(())
    }

    pub(super) fn uac_invite_response(&mut self, tid: TransactionId, response: SipResponse) -> Result<Deferred> {
        if self.invite_tid.as_ref() != Some(&tid) || response.method != Method::Invite {
            debug!(ua = %self.id, tid = %tid, "response for another transaction ignored");
            return Ok(Deferred::new());
        }
        let code = response.code;

        if code == status::TRYING {
            if self.p100_ts.is_none() {
                self.p100_ts = Some(chrono::Utc::now());
            }
            if self.timers.is_active(UaTimer::NoReply) {
                self.timers.cancel(UaTimer::NoReply);
                if let Some(np) = self.no_progress_time.filter(|np| below(*np, self.expire_time)) {
                    let remaining = np.saturating_sub(self.setup_at.elapsed());
                    self.start_timer(UaTimer::NoProgress, remaining.max(std::time::Duration::from_millis(1)));
                }
            }
            return Ok(Deferred::new());
        }

        if status::is_provisional(code) {
            if let Some(rseq) = response.rseq {
                if let Some(prev) = self.last_rseq {
                    if rseq != prev.wrapping_add(1) {
                        debug!(ua = %self.id, rseq, prev, "out of order reliable provisional dropped");
                        return Ok(Deferred::new());
                    }
                }
                self.last_rseq = Some(rseq);
                if response.to_tag.is_some() {
                    self.remote_tag = response.to_tag.clone();
                }
                self.send_prack(rseq, response.cseq)?;
            } else if response.to_tag.is_some() {
                self.remote_tag = response.to_tag.clone();
            }
            self.last_scode = Some(code);
            if self.p1xx_ts.is_none() {
                self.p1xx_ts = Some(chrono::Utc::now());
            }
            self.timers.cancel(UaTimer::NoReply);
            self.timers.cancel(UaTimer::NoProgress);
            if response.body.is_some() {
                self.remote_media = response.body.clone();
            }
            self.emit(CCEvent::ring(code, response.reason, response.body, Origin::Callee));
            return Ok(self.change_state(UaState::UacRinging));
        }

        self.last_scode = Some(code);

        if status::is_success(code) {
            let Some(tag) = response.to_tag.clone() else {
                warn!(ua = %self.id, code, "2xx without To tag, tearing leg down");
                self.tl.send_ack(&tid, None);
                self.send_in_dialog(Method::Bye, None)?;
                self.last_scode = Some(status::BAD_GATEWAY);
                self.emit(CCEvent::fail_with(
                    FailData::new(status::BAD_GATEWAY, "Bad Gateway").terminal(),
                    Origin::Switch,
                ));
                return Ok(self.change_state(UaState::Failed));
            };
            self.remote_tag = Some(tag);
            if let Some(contact) = response.contacts.first() {
                self.remote_target = contact.clone();
            }
            self.remote_media = response.body.clone();
            if self.invite_body.is_some() {
                self.tl.send_ack(&tid, None);
                self.emit(CCEvent::connect(code, response.reason, response.body, Origin::Callee));
            } else {
                // late offer: ACK carries our answer once the other side has it
                self.pending_ack = Some(tid);
                self.emit(CCEvent::pre_connect(code, response.reason, response.body, Origin::Callee));
            }
            return Ok(self.change_state(UaState::Connected));
        }

        if status::is_redirect(code) && !response.contacts.is_empty() {
            self.emit(CCEvent::redirect(code, response.reason, response.contacts, Origin::Callee));
            return Ok(self.change_state(UaState::Failed));
        }

        if status::is_auth_challenge(code) && !self.auth_attempted {
            if let Some((user, pass)) = self.credentials.clone() {
                let challenge = response.challenges().iter().find_map(DigestChallenge::from_header);
                if let Some(challenge) = challenge {
                    self.auth_attempted = true;
                    let answer = challenge.answer(&user, &pass, "INVITE", &self.remote_target.to_string());
                    self.invite_headers
                        .retain(|h| !h.is("Authorization") && !h.is("Proxy-Authorization"));
                    self.invite_headers.push(answer);
                    self.cseq += 1;
                    debug!(ua = %self.id, code, "answering digest challenge");
                    self.send_invite()?;
                    return Ok(Deferred::new());
                }
            }
        }

        let challenges = if self.pass_auth && status::is_auth_challenge(code) {
            response.challenges()
        } else {
            Vec::new()
        };
        let warning = response.warning().map(str::to_string);
        self.emit(CCEvent::fail_with(
            FailData::new(code, response.reason)
                .with_challenges(challenges)
                .with_warning(warning),
            Origin::Callee,
        ));
        Ok(self.change_state(UaState::Failed))
    }

    /// Responses arriving after the attempt was abandoned
    pub(super) fn uac_late_response(&mut self, tid: TransactionId, response: SipResponse) -> Result<Deferred> {
        let is_invite = self.invite_tid.as_ref() == Some(&tid) && response.method == Method::Invite;
        if is_invite && status::is_success(response.code) && self.connect_ts.is_none() {
            debug!(ua = %self.id, code = response.code, "late 2xx after CANCEL, sending ACK and BYE");
            self.remote_tag = response.to_tag.clone();
            if let Some(contact) = response.contacts.first() {
                self.remote_target = contact.clone();
            }
            self.tl.send_ack(&tid, None);
            self.send_in_dialog(Method::Bye, None)?;
            // only once per dialog
            self.connect_ts = Some(chrono::Utc::now());
        }
        Ok(Deferred::new())
    }

    fn send_prack(&mut self, rseq: u32, cseq: u32) -> Result<()> {
        let mut request = self.in_dialog_request(Method::Prack, None)?;
        request.rack = Some(RAck {
            rseq,
            cseq,
            method: Method::Invite,
        });
        self.tl.send_request(request);
        Ok(())
    }
}
