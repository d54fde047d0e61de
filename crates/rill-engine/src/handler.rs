//! Task handler state machine.
//!
//! A handler is the backend-specific lifecycle token for one task: it owns
//! the submit/poll/kill interaction and advances monotonically through
//! [`HandlerStatus`]. Monitors drive handlers; nothing else touches them
//! after submission.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::trace;

use crate::{
    error::EngineError,
    task::{TaskResult, TaskRun},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerStatus {
    New,
    Submitted,
    Running,
    Completed,
}

/// Shared status holder: monotonic transitions, `last_update` stamping, and
/// a watch-based completion latch for callers that block on a single task.
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<(HandlerStatus, Instant)>,
    completed: watch::Sender<bool>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            inner: Mutex::new((HandlerStatus::New, Instant::now())),
            completed,
        }
    }

    pub fn status(&self) -> HandlerStatus {
        self.inner.lock().expect("status lock poisoned").0
    }

    pub fn last_update(&self) -> Instant {
        self.inner.lock().expect("status lock poisoned").1
    }

    /// Advance to `next`. Setting the current status again or moving
    /// backwards is a no-op; returns whether a transition happened.
    pub fn set(&self, next: HandlerStatus) -> bool {
        let mut guard = self.inner.lock().expect("status lock poisoned");
        if next <= guard.0 {
            return false;
        }
        trace!("handler status {:?} -> {:?}", guard.0, next);
        *guard = (next, Instant::now());
        if next == HandlerStatus::Completed {
            let _ = self.completed.send(true);
        }
        true
    }

    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completed.subscribe()
    }
}

/// Backend lifecycle contract for one task.
///
/// `check_if_running` and `check_if_completed` are idempotent: they return
/// true exactly once, at the transition, and false on every later call.
#[async_trait]
pub trait TaskHandler: Send {
    fn task(&self) -> &Arc<TaskRun>;

    fn status(&self) -> HandlerStatus;

    fn last_update(&self) -> Instant;

    /// Latch released when the handler reaches `Completed`.
    fn completion(&self) -> watch::Receiver<bool>;

    /// NEW -> SUBMITTED, triggering the backend action.
    async fn submit(&mut self) -> Result<(), EngineError>;

    /// SUBMITTED -> RUNNING when the backend reports execution started.
    async fn check_if_running(&mut self) -> Result<bool, EngineError>;

    /// RUNNING -> COMPLETED when the task finished; populates the result.
    async fn check_if_completed(&mut self) -> Result<bool, EngineError>;

    /// Force termination at any post-NEW state.
    async fn kill(&mut self);

    /// The completion record; available once COMPLETED.
    fn take_result(&mut self) -> Option<TaskResult>;
}
