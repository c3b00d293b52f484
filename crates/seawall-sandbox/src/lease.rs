//! Slot leases.
//!
//! A [`SlotLease`] is the caller-facing handle over a checked-out slot.  The
//! plugin-chain collaborator acquires a lease, issues calls, and must settle
//! it with [`SlotLease::release`] (normal return) or [`SlotLease::ignore`]
//! (take responsibility for the slot, e.g. after abandoning a call).

use std::sync::Arc;

use crate::error::Result;
use crate::instance::{CallContext, CallOutcome};
use crate::pool::VmPool;
use crate::slot::VmSlot;

/// Exclusive checkout of one pool slot.
pub struct SlotLease {
    slot: Arc<VmSlot>,
    pool: VmPool,
    settled: bool,
}

impl SlotLease {
    pub(crate) fn new(slot: Arc<VmSlot>, pool: VmPool) -> Self {
        Self {
            slot,
            pool,
            settled: false,
        }
    }

    /// Invoke an exported function on the leased slot.
    ///
    /// Calls are serialized per slot; `ctx` is bound for host functions for
    /// the duration of exactly this call.
    pub async fn call(&self, function: &str, input: &[u8], ctx: CallContext) -> Result<CallOutcome> {
        self.slot.call(function, input, ctx).await
    }

    /// Invoke `function` (with empty input) exactly once over the slot's
    /// lifetime.  Subsequent leases of the same slot skip it.
    pub async fn initialize_once(&self, function: &str) -> Result<()> {
        let slot = Arc::clone(&self.slot);
        let function = function.to_owned();
        self.slot
            .initialize_once(move || async move {
                slot.call(&function, &[], CallContext::new()).await.map(|_| ())
            })
            .await
    }

    /// Stable identity of the leased slot within its pool.
    pub fn slot_index(&self) -> u64 {
        self.slot.index()
    }

    /// Whether the slot will be destroyed instead of reused on release.
    pub fn is_retiring(&self) -> bool {
        self.slot.is_retiring()
    }

    /// Return the slot to its pool.
    pub fn release(mut self) {
        self.settled = true;
        self.pool.release_slot(Arc::clone(&self.slot));
    }

    /// Drop the slot from the pool's in-use set without returning or
    /// destroying it. The caller takes responsibility for the slot.
    pub fn ignore(mut self) {
        self.settled = true;
        self.pool.ignore_slot(Arc::clone(&self.slot));
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.settled {
            // Deliberate policy: an abandoned lease keeps its slot checked
            // out rather than returning a possibly-busy instance to the pool.
            tracing::warn!(
                plugin = %self.pool.plugin_id(),
                slot = self.slot.index(),
                "lease dropped without release or ignore; slot stays checked out"
            );
        }
    }
}
