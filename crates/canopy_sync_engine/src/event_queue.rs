//! Serialization point for cache changes and their events.

use canopy_core::Dispatch;
use parking_lot::ReentrantMutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Runs one cache change at a time and fires its events before the next
/// change starts.
///
/// The gate is reentrant so a listener may write to the database from
/// inside its callback; the nested change completes, with its events,
/// before the outer callback returns.
#[derive(Default)]
pub(crate) struct EventQueue {
    gate: ReentrantMutex<()>,
    fired: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `change`, then fires the dispatches it produced, in order.
    ///
    /// `change` must release every lock it takes before returning.
    pub fn serialize<R>(&self, change: impl FnOnce() -> (R, Vec<Dispatch>)) -> R {
        let _gate = self.gate.lock();
        let (result, dispatches) = change();
        self.fire(dispatches);
        result
    }

    fn fire(&self, dispatches: Vec<Dispatch>) {
        if dispatches.is_empty() {
            return;
        }
        tracing::trace!(count = dispatches.len(), "firing events");
        self.fired
            .fetch_add(dispatches.len() as u64, Ordering::Relaxed);
        for dispatch in dispatches {
            dispatch.fire();
        }
    }

    /// Dispatches fired so far.
    #[cfg(test)]
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}
