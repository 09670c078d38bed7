//! Accounting collaborator
//!
//! The controller reports each leg's connect and disconnect to an
//! accounting backend (RADIUS in production). Calls are fire-and-forget:
//! they run after the call lock has been released and their outcome never
//! affects the call.

use std::sync::Arc;

use crate::ua::{LegObserver, LegReport};

pub trait Accounting: Send + Sync {
    fn connect(&self, report: &LegReport);

    /// Also invoked for legs that failed before connecting, with the final
    /// status code in the report
    fn disconnect(&self, report: &LegReport);
}

/// Accounting disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccounting;

impl Accounting for NoopAccounting {
    fn connect(&self, _report: &LegReport) {}

    fn disconnect(&self, _report: &LegReport) {}
}

/// Feeds a leg's lifecycle into an [`Accounting`] backend
pub(crate) struct AccountingObserver {
    accounting: Arc<dyn Accounting>,
}

impl AccountingObserver {
    pub(crate) fn new(accounting: Arc<dyn Accounting>) -> Arc<Self> {
        Arc::new(Self { accounting })
    }
}

impl LegObserver for AccountingObserver {
    fn on_connect(&self, report: &LegReport) {
        self.accounting.connect(report);
    }

    fn on_disconnect(&self, report: &LegReport) {
        self.accounting.disconnect(report);
    }

    fn on_fail(&self, report: &LegReport) {
        self.accounting.disconnect(report);
    }
}
