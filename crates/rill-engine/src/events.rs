//! Task lifecycle events.
//!
//! The dispatcher and monitors fan events out to registered listeners.
//! Listeners are observability hooks; a failing listener is logged and
//! never propagates into the task lifecycle.

use std::sync::{Arc, RwLock};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::warn;

use crate::task::TaskRun;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum TaskEventKind {
    /// Handed to a monitor.
    Submitted,
    /// Satisfied from the cache or a store directory; no submission.
    Cached,
    /// The backend reported execution started.
    Started,
    Completed {
        exit_status: i32,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub process: String,
    pub task: String,
    pub id: u64,
    pub work_dir: Utf8PathBuf,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub(crate) fn new(kind: TaskEventKind, task: &TaskRun) -> Self {
        Self {
            process: task.process.clone(),
            task: task.name.clone(),
            id: task.id,
            work_dir: task.work_dir.clone(),
            kind,
        }
    }
}

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
pub type TaskListener = Arc<dyn Fn(&TaskEvent) -> ListenerResult + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<TaskListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: TaskListener) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    pub fn emit(&self, event: TaskEvent) {
        let listeners = self.listeners.read().expect("listener lock poisoned");
        for listener in listeners.iter() {
            if let Err(e) = listener(&event) {
                warn!("task event listener failed: {e}");
            }
        }
    }
}
