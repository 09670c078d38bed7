//! # B2BUA core
//!
//! Call-control core of a SIP back-to-back user agent. Each inbound call
//! is answered by one user agent (the ingress leg) and bridged to an
//! outbound user agent (the egress leg) placed towards a route chosen by
//! an external authorizer or a static route, failing over through the
//! route list until a callee answers.
//!
//! The crate does not speak SIP on the wire. A transaction layer hands it
//! parsed requests and responses and sends what it produces, see
//! [`sip::TransactionLayer`].
//!
//! ## Modules
//!
//! - `events`: call-control events exchanged between legs and controller
//! - `ua`: per-leg state machines
//! - `controller`: per-call bridging, routing and failover
//! - `timer`: one-shot and repeating timers bound to a call lock
//! - `route`: route templates and their per-call customization
//! - `auth`, `accounting`, `media`: external collaborators
//! - `registry`, `api`: the live-call map and the facade built on it
//!
//! ## Example
//!
//! ```ignore
//! let b2b = B2bua::builder(B2buaConfig::from_file("b2bua.toml")?)
//!     .transaction_layer(tl)
//!     .authorizer(radius)
//!     .build()?;
//!
//! let dialog = b2b.on_new_dialog(request, tid);
//! ```

pub mod accounting;
pub mod api;
pub mod auth;
pub mod common;
pub mod config;
pub mod controller;
pub mod events;
pub mod media;
pub mod registry;
pub mod route;
pub mod sip;
pub mod timer;
pub mod ua;

pub use accounting::{Accounting, NoopAccounting};
pub use api::{B2bua, B2buaBuilder, NewDialog};
pub use auth::{AuthRequest, AuthResult, Authorizer};
pub use common::{B2buaError, CallId, Deferred, LegSide, Origin, Result, TransactionId, UaId};
pub use config::{B2buaConfig, RewriteRule};
pub use controller::{CallHandle, CallInfo, CallState};
pub use events::{CCEvent, EventKind};
pub use media::{MediaRelay, MediaRelaySession};
pub use registry::CallRegistry;
pub use route::{Route, RouteTemplate};
pub use sip::TransactionLayer;
pub use timer::Timeout;
pub use ua::{LegObserver, LegReport, Ua, UaState};
