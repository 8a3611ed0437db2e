//! Callback marshaling.
//!
//! Progress is observed on the engine thread, which the host never created.
//! An [`ExecutionContext`] describes how to get from an arbitrary thread into
//! the host: whether the current thread may call in directly, and how to
//! attach a foreign thread for the duration of one call.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::progress::ProgressEvent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    /// The host side has shut down and will not accept more calls.
    #[error("host execution context is gone")]
    HostGone,

    #[error("host refused to attach thread: {0}")]
    Refused(String),
}

/// Host runtime the progress callback lives in.
pub trait ExecutionContext: Send + Sync {
    /// Whether the calling thread may invoke the host directly.
    fn is_attached(&self) -> bool;

    /// Attach the calling thread.
    fn attach(&self) -> Result<(), AttachError>;

    /// Undo a previous [`ExecutionContext::attach`] on the calling thread.
    fn detach(&self);

    /// Hand one event to the host.  Only called on an attached thread.
    fn invoke(&self, event: &ProgressEvent);
}

// ---------------------------------------------------------------------------
// CallbackAdapter
// ---------------------------------------------------------------------------

/// Delivers progress events into an [`ExecutionContext`] from any thread.
pub struct CallbackAdapter {
    context: Arc<dyn ExecutionContext>,
}

impl CallbackAdapter {
    pub fn new(context: impl ExecutionContext + 'static) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Adapter that calls `f` directly on the engine thread.
    pub fn inline<F>(f: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        Self::new(InlineContext::new(f))
    }

    /// Deliver one event.  Never panics and never blocks beyond the host
    /// callback itself.
    pub fn deliver(&self, event: &ProgressEvent) {
        let attached_here = if self.context.is_attached() {
            false
        } else {
            match self.context.attach() {
                Ok(()) => true,
                Err(e) => {
                    debug!(interval = event.sequence_number, error = %e, "dropping progress event");
                    return;
                }
            }
        };

        let context = &self.context;
        if panic::catch_unwind(AssertUnwindSafe(|| context.invoke(event))).is_err() {
            warn!(interval = event.sequence_number, "progress callback panicked");
        }

        if attached_here {
            self.context.detach();
        }
    }
}

// ---------------------------------------------------------------------------
// InlineContext
// ---------------------------------------------------------------------------

/// Calls a Rust closure on whatever thread delivers.  Always attached.
pub struct InlineContext<F> {
    callback: F,
}

impl<F> InlineContext<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ExecutionContext for InlineContext<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn is_attached(&self) -> bool {
        true
    }

    fn attach(&self) -> Result<(), AttachError> {
        Ok(())
    }

    fn detach(&self) {}

    fn invoke(&self, event: &ProgressEvent) {
        (self.callback)(event)
    }
}

// ---------------------------------------------------------------------------
// ChannelContext
// ---------------------------------------------------------------------------

/// Forwards events into a host event loop over an unbounded channel.
///
/// The thread that creates the context is its home thread and stays attached.
/// Any other thread is attached per delivery, which fails once the receiving
/// side has been dropped.
pub struct ChannelContext {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    home: ThreadId,
    attached: Mutex<HashSet<ThreadId>>,
}

impl ChannelContext {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            tx,
            home: thread::current().id(),
            attached: Mutex::new(HashSet::new()),
        };
        (ctx, rx)
    }

    /// Foreign threads currently attached.
    pub fn attached_count(&self) -> usize {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ExecutionContext for ChannelContext {
    fn is_attached(&self) -> bool {
        let id = thread::current().id();
        id == self.home
            || self
                .attached
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&id)
    }

    fn attach(&self) -> Result<(), AttachError> {
        if self.tx.is_closed() {
            return Err(AttachError::HostGone);
        }
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread::current().id());
        Ok(())
    }

    fn detach(&self) {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread::current().id());
    }

    fn invoke(&self, event: &ProgressEvent) {
        if self.tx.send(*event).is_err() {
            debug!(interval = event.sequence_number, "host receiver closed mid-delivery");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
