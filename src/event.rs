//! Completion tokens for asynchronous device work
//!
//! Every asynchronous operation (fill, copy) returns an [`Event`]. The token
//! is the only channel through which device-side failures become visible:
//! callers inspect [`Event::status`] or block on [`Event::wait`] when they
//! need the result. This layer performs no retries.

use crate::error::{MemoryError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Observable state of an asynchronous operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// Work is still queued or executing
    Pending,
    /// Work finished successfully
    Complete,
    /// Work failed during device execution
    Failed(String),
}

struct EventInner {
    state: Mutex<EventStatus>,
    done: Condvar,
}

/// Handle to a pending or finished asynchronous operation
///
/// Cheap to clone; all clones observe the same completion state.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Token for work that has already finished
    ///
    /// Host-resident views return these from their no-op fill/copy paths.
    pub fn completed() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventStatus::Complete),
                done: Condvar::new(),
            }),
        }
    }

    pub(crate) fn pending() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventStatus::Pending),
                done: Condvar::new(),
            }),
        }
    }

    pub(crate) fn signal_complete(&self) {
        let mut state = self.inner.state.lock();
        *state = EventStatus::Complete;
        self.inner.done.notify_all();
    }

    pub(crate) fn signal_failed(&self, message: String) {
        let mut state = self.inner.state.lock();
        *state = EventStatus::Failed(message);
        self.inner.done.notify_all();
    }

    /// Non-blocking status query
    pub fn status(&self) -> EventStatus {
        self.inner.state.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status(), EventStatus::Complete)
    }

    /// Block until the operation reaches a terminal state
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::AsyncTaskFailed`] if the device task failed.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while matches!(*state, EventStatus::Pending) {
            self.inner.done.wait(&mut state);
        }
        match &*state {
            EventStatus::Complete => Ok(()),
            EventStatus::Failed(message) => Err(MemoryError::AsyncTaskFailed(message.clone())),
            EventStatus::Pending => unreachable!(),
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("status", &self.status()).finish()
    }
}
