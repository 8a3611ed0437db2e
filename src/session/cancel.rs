//! Cancellation coordinator.
//!
//! Owns the session phase, a non-owning reference to the running engine and
//! the cancellation flag, all behind one mutex.  `request_cancel` may be
//! called from any thread; it never blocks on the engine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{Engine, TestState};
use crate::error::BridgeError;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Phase of the single client session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Configuring,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// CancellationCoordinator
// ---------------------------------------------------------------------------

struct Inner {
    state: SessionState,
    active: Option<Weak<dyn Engine>>,
    cancelled: bool,
}

pub struct CancellationCoordinator {
    inner: Mutex<Inner>,
}

impl Default for CancellationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                active: None,
                cancelled: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the session slot (`Idle -> Configuring`).
    ///
    /// The slot returns to `Idle` when the returned guard is dropped.
    pub fn reserve(self: &Arc<Self>) -> Result<SessionSlot, BridgeError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Idle {
            debug!(state = %inner.state, "session slot busy");
            return Err(BridgeError::SessionAlreadyActive);
        }
        inner.state = SessionState::Configuring;
        Ok(SessionSlot {
            coordinator: Arc::clone(self),
        })
    }

    /// Record `engine` as the active session and clear the flag.
    pub fn register(&self, engine: &Arc<dyn Engine>) -> Result<(), BridgeError> {
        let mut inner = self.lock();
        if inner.active.is_some() {
            return Err(BridgeError::AlreadyActive);
        }
        inner.active = Some(Arc::downgrade(engine));
        inner.cancelled = false;
        inner.state = SessionState::Running;
        Ok(())
    }

    /// Ask the active session to stop.
    ///
    /// Returns `false` (and does nothing) when no session is registered.
    /// Failing to reach the remote peer is logged; the local stop still
    /// happens.
    pub fn request_cancel(&self) -> bool {
        let engine = {
            let mut inner = self.lock();
            let Some(engine) = inner.active.as_ref().and_then(Weak::upgrade) else {
                debug!("cancellation requested but no active client test is running");
                return false;
            };
            inner.cancelled = true;
            engine
        };

        info!("cancellation requested, signalling active iperf3 client to stop");
        engine.set_state(TestState::ClientTerminate);
        if let Err(e) = engine.send_state(TestState::ClientTerminate) {
            warn!(error = %e, "failed to send CLIENT_TERMINATE to server");
        }
        true
    }

    /// Clear the active session and the flag, returning the flag as it was.
    pub fn unregister(&self) -> bool {
        let mut inner = self.lock();
        let was_cancelled = inner.cancelled;
        inner.active = None;
        inner.cancelled = false;
        was_cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_registered(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    fn transition(&self, to: SessionState) {
        let mut inner = self.lock();
        debug!(from = %inner.state, to = %to, "session transition");
        inner.state = to;
    }

    fn release(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Idle;
        inner.active = None;
        inner.cancelled = false;
    }
}

// ---------------------------------------------------------------------------
// SessionSlot
// ---------------------------------------------------------------------------

/// Exclusive claim on the session slot.  Dropping it returns the
/// coordinator to `Idle` on every exit path.
pub struct SessionSlot {
    coordinator: Arc<CancellationCoordinator>,
}

impl SessionSlot {
    /// Move to a terminal state ahead of teardown.
    pub fn finish(&self, state: SessionState) {
        debug_assert!(state.is_terminal());
        self.coordinator.transition(state);
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
