//! Shared handle to one call

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::{CallController, CallState};
use crate::common::{CallId, Deferred, TransactionId, UaId};
use crate::sip::{SipRequest, SipResponse};

/// Point-in-time view of a call for the administrative surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub id: CallId,
    pub state: CallState,
    pub call_id: String,
    pub cli: String,
    pub cld: String,
    /// Rank of the route currently (or last) attempted
    pub rnum: Option<u32>,
    pub routes_left: usize,
    pub ingress: String,
    pub egress: Option<String>,
    pub setup_time: DateTime<Utc>,
}

/// Cloneable reference to a call controller.
///
/// Every method takes the call lock, lets the controller process the
/// input, releases the lock and only then runs the callbacks the
/// controller deferred.
#[derive(Clone)]
pub struct CallHandle {
    id: CallId,
    ingress: UaId,
    inner: Arc<Mutex<CallController>>,
}

impl CallHandle {
    pub(crate) fn new(id: CallId, inner: Arc<Mutex<CallController>>) -> Self {
        let ingress = inner.lock().ingress().id();
        Self { id, ingress, inner }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// The UA answering the inbound dialog
    pub fn ingress_ua(&self) -> UaId {
        self.ingress
    }

    /// The current egress UA, if one has been placed
    pub fn egress_ua(&self) -> Option<UaId> {
        self.inner.lock().egress().map(|ua| ua.id())
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state()
    }

    pub fn info(&self) -> CallInfo {
        self.inner.lock().info()
    }

    /// Inspect the controller under its lock
    pub fn with<R>(&self, f: impl FnOnce(&CallController) -> R) -> R {
        f(&self.inner.lock())
    }

    #[cfg(test)]
    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut CallController) -> R) -> R {
        f(&mut self.inner.lock())
    }

    fn run(&self, f: impl FnOnce(&mut CallController) -> Deferred) {
        let deferred = {
            let mut call = self.inner.lock();
            call.traced(f)
        };
        deferred.run();
    }

    /// A request from the peer of leg `ua`
    pub fn recv_request(&self, ua: UaId, request: SipRequest, tid: TransactionId) {
        self.run(|call| call.recv_request(ua, request, tid));
    }

    /// A response on a client transaction of leg `ua`
    pub fn recv_response(&self, ua: UaId, tid: TransactionId, response: SipResponse) {
        self.run(|call| call.recv_response(ua, tid, response));
    }

    pub fn recv_cancel(&self, ua: UaId) {
        self.run(|call| call.recv_cancel(ua));
    }

    /// The transaction layer gave up on `tid`
    pub fn recv_timeout(&self, ua: UaId, tid: TransactionId) {
        self.run(|call| call.recv_timeout(ua, tid));
    }

    pub fn disconnect(&self, reason: Option<&str>) {
        self.run(|call| call.disconnect(reason));
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("ingress", &self.ingress)
            .finish()
    }
}
