//! B2BUA facade and its builder

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::accounting::{Accounting, NoopAccounting};
use crate::auth::Authorizer;
use crate::common::{status, B2buaError, CallId, Result, TransactionId};
use crate::config::B2buaConfig;
use crate::controller::{CallController, CallHandle, CallInfo, CallServices};
use crate::media::MediaRelay;
use crate::registry::CallRegistry;
use crate::route::RouteTemplate;
use crate::sip::{Method, OutgoingResponse, SipRequest, TransactionLayer};

/// What the transaction layer should do with a new inbound dialog
#[derive(Debug)]
pub struct NewDialog {
    /// The call created for the dialog; route further traffic to it
    pub call: Option<CallHandle>,
    /// Immediate final response when no call was created
    pub response: Option<OutgoingResponse>,
}

impl NewDialog {
    fn refuse(code: u16, reason: &str) -> Self {
        Self {
            call: None,
            response: Some(OutgoingResponse::new(code, reason)),
        }
    }
}

/// Builder for [`B2bua`]
pub struct B2buaBuilder {
    config: B2buaConfig,
    transaction_layer: Option<Arc<dyn TransactionLayer>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    accounting: Option<Arc<dyn Accounting>>,
    media_relay: Option<Arc<dyn MediaRelay>>,
}

impl B2buaBuilder {
    pub fn new(config: B2buaConfig) -> Self {
        Self {
            config,
            transaction_layer: None,
            authorizer: None,
            accounting: None,
            media_relay: None,
        }
    }

    pub fn transaction_layer(mut self, tl: Arc<dyn TransactionLayer>) -> Self {
        self.transaction_layer = Some(tl);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn accounting(mut self, accounting: Arc<dyn Accounting>) -> Self {
        self.accounting = Some(accounting);
        self
    }

    pub fn media_relay(mut self, relay: Arc<dyn MediaRelay>) -> Self {
        self.media_relay = Some(relay);
        self
    }

    pub fn build(self) -> Result<B2bua> {
        self.config.validate()?;
        let tl = self
            .transaction_layer
            .ok_or_else(|| B2buaError::ConfigError("a transaction layer is required".into()))?;
        if self.config.media_relay && self.media_relay.is_none() {
            return Err(B2buaError::ConfigError(
                "media_relay is enabled but no relay was supplied".into(),
            ));
        }
        if self.authorizer.is_none() && self.config.static_route.is_none() {
            return Err(B2buaError::ConfigError(
                "either an authorizer or a static route is required".into(),
            ));
        }
        let static_route = self
            .config
            .static_route
            .as_deref()
            .map(RouteTemplate::parse)
            .transpose()?;

        info!(
            static_route = self.config.static_route.as_deref().unwrap_or("-"),
            authorizer = self.authorizer.is_some(),
            media_relay = self.config.media_relay,
            "b2bua configured"
        );
        Ok(B2bua {
            services: Arc::new(CallServices {
                config: self.config,
                static_route,
                tl,
                authorizer: self.authorizer,
                accounting: self.accounting.unwrap_or_else(|| Arc::new(NoopAccounting)),
                media_relay: self.media_relay,
            }),
            registry: CallRegistry::new(),
        })
    }
}

/// Entry point for the transaction layer and the administrative surface
pub struct B2bua {
    services: Arc<CallServices>,
    registry: CallRegistry,
}

impl fmt::Debug for B2bua {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("B2bua")
            .field("config", &self.services.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl B2bua {
    pub fn builder(config: B2buaConfig) -> B2buaBuilder {
        B2buaBuilder::new(config)
    }

    pub fn config(&self) -> &B2buaConfig {
        &self.services.config
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    /// A request that matched no existing dialog.
    ///
    /// Only an out-of-dialog INVITE from an accepted source creates a call;
    /// it is fed to the new call's ingress leg before returning. Must be
    /// called from within a tokio runtime.
    pub fn on_new_dialog(&self, request: SipRequest, tid: TransactionId) -> NewDialog {
        if request.method != Method::Invite {
            debug!(method = %request.method, source = %request.source, "non-INVITE outside a dialog");
            return NewDialog::refuse(status::NOT_IMPLEMENTED, "Not Implemented");
        }
        if request.to.tag.is_some() {
            debug!(call_id = %request.call_id, "re-INVITE for unknown dialog");
            return NewDialog::refuse(status::CALL_DOES_NOT_EXIST, "Call Leg/Transaction Does Not Exist");
        }
        if !self.services.config.accepts(request.source.ip()) {
            info!(source = %request.source, "call from unaccepted source refused");
            return NewDialog::refuse(status::FORBIDDEN, "Forbidden");
        }

        let id = self.registry.allocate_id();
        let call = CallController::spawn(id, self.services.clone(), Some(self.registry.link()));
        self.registry.insert(call.clone());
        debug!(call = %id, call_id = %request.call_id, "new call");
        call.recv_request(call.ingress_ua(), request, tid);
        NewDialog {
            call: Some(call),
            response: None,
        }
    }

    pub fn call(&self, id: CallId) -> Option<CallHandle> {
        self.registry.get(id)
    }

    pub fn list_calls(&self) -> Vec<CallInfo> {
        self.registry.list()
    }

    pub fn list_calls_json(&self) -> Result<String> {
        self.registry.list_json()
    }

    pub fn disconnect(&self, id: CallId) -> Result<()> {
        self.registry.disconnect(id)
    }

    pub fn disconnect_all(&self) -> usize {
        self.registry.disconnect_all()
    }
}
