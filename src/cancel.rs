//! Cooperative run cancellation
//!
//! The orchestrator and the CLI's signal handler share one token with
//! every worker. Workers check it between engine invocations, never
//! mid-call, so chunks already merged stay merged and the latest
//! checkpoint stays valid for resume. The first cancellation records
//! why the run stopped; the reason travels into the run summary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Shared cancellation signal for one run. Clones observe each other.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation, recording why. Only the first request's
    /// reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            *self
                .state
                .reason
                .lock()
                .expect("cancel reason state poisoned") = Some(reason.into());
        }
    }

    /// Why the run was cancelled, if it was.
    pub fn reason(&self) -> Option<String> {
        self.state
            .reason
            .lock()
            .expect("cancel reason state poisoned")
            .clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
