//! Registry of live calls
//!
//! The map has its own locking, separate from the per-call locks, and is
//! only held for an insert, lookup or removal. Administrative operations
//! copy the handles out first and then go through each call's lock.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::common::{B2buaError, CallId, Result};
use crate::controller::{CallHandle, CallInfo};

#[derive(Clone, Default)]
pub struct CallRegistry {
    calls: Arc<DashMap<CallId, CallHandle>>,
    next_id: Arc<AtomicU64>,
}

/// Non-owning back reference a call uses to remove itself
#[derive(Clone)]
pub(crate) struct RegistryLink(Weak<DashMap<CallId, CallHandle>>);

impl RegistryLink {
    /// True only for the call that actually removed the entry
    pub(crate) fn remove(&self, id: CallId) -> bool {
        let Some(calls) = self.0.upgrade() else {
            return false;
        };
        let removed = calls.remove(&id).is_some();
        if removed {
            debug!(call = %id, remaining = calls.len(), "call removed from registry");
        }
        removed
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_id(&self) -> CallId {
        CallId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn link(&self) -> RegistryLink {
        RegistryLink(Arc::downgrade(&self.calls))
    }

    pub(crate) fn insert(&self, call: CallHandle) {
        self.calls.insert(call.id(), call);
    }

    pub fn get(&self, id: CallId) -> Option<CallHandle> {
        self.calls.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn handles(&self) -> Vec<CallHandle> {
        self.calls.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of every live call, ordered by id
    pub fn list(&self) -> Vec<CallInfo> {
        let mut calls: Vec<CallInfo> = self.handles().iter().map(CallHandle::info).collect();
        calls.sort_by_key(|info| info.id);
        calls
    }

    /// [`list`](Self::list) rendered as a JSON array
    pub fn list_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.list())
            .map_err(|e| infra_common::Error::Internal(format!("cannot render call list: {}", e)).into())
    }

    pub fn disconnect(&self, id: CallId) -> Result<()> {
        let call = self.get(id).ok_or(B2buaError::CallNotFound(id))?;
        info!(call = %id, "administrative disconnect");
        call.disconnect(Some("administrative disconnect"));
        Ok(())
    }

    /// Disconnect every live call; returns how many were told to
    pub fn disconnect_all(&self) -> usize {
        let calls = self.handles();
        info!(calls = calls.len(), "disconnecting all calls");
        for call in &calls {
            call.disconnect(Some("administrative disconnect"));
        }
        calls.len()
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry").field("calls", &self.calls.len()).finish()
    }
}
