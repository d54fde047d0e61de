//! Executor backends.
//!
//! A backend is a factory: it pre-builds the wrapper for a task, creates the
//! handler that drives it, and describes how its monitor should poll. Grid
//! backends additionally know how to build submit/kill/queue command lines
//! and parse their output.

pub mod grid;
pub mod local;
pub mod native;

use std::{fmt::Write as _, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    error::EngineError,
    handler::TaskHandler,
    stage::FileHolder,
    task::TaskRun,
    wrapper,
};

/// State of a job in a grid scheduler's queue listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Running,
    Hold,
    Error,
    Completed,
    Unknown,
}

/// How the monitor for a backend should behave.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Admission budget: max concurrently submitted/running handlers. The
    /// admission FIFO has the same capacity, so `put` blocks once both are
    /// full.
    pub capacity: usize,
    pub poll_interval: Duration,
    /// How often to re-run the queue command; `None` for backends without a
    /// queue snapshot.
    pub queue_refresh: Option<Duration>,
}

#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn monitor_settings(&self) -> MonitorSettings;

    /// Pre-build the wrapper and side files before submission.
    fn prepare(&self, task: &TaskRun) -> Result<(), EngineError> {
        wrapper::write_task_files(task, self.as_backend())
    }

    /// Object-safe self upcast for default methods that need `&dyn`.
    fn as_backend(&self) -> &dyn ExecutorBackend;

    fn create_handler(&self, task: Arc<TaskRun>, wake: Arc<Notify>) -> Box<dyn TaskHandler>;

    /// Stage-in command block for the wrapper.
    fn staging_files_script(&self, files: &[FileHolder]) -> String {
        let mut script = String::new();
        for holder in files {
            let _ = writeln!(script, "rm -rf \"{}\"", holder.stored_name);
            let _ = writeln!(
                script,
                "ln -s \"{}\" \"{}\"",
                holder.source_path, holder.stored_name
            );
        }
        script
    }

    /// Stage-out command block for the wrapper; empty when outputs are
    /// collected in place.
    fn unstage_outputs_script(&self, _task: &TaskRun) -> String {
        String::new()
    }

    /// Refresh the backend's cached queue snapshot, if it keeps one. Called
    /// by the monitor at `queue_refresh` intervals.
    async fn refresh_queue(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_staging_script_links_every_file() {
        let backend = local::LocalBackend::new(1, Duration::from_millis(10));
        let files = vec![
            FileHolder {
                source_path: "/data/a".into(),
                stored_name: "file1".into(),
            },
            FileHolder {
                source_path: "/data/b".into(),
                stored_name: "file2".into(),
            },
        ];
        let script = backend.staging_files_script(&files);
        assert_eq!(
            script,
            "rm -rf \"file1\"\nln -s \"/data/a\" \"file1\"\nrm -rf \"file2\"\nln -s \"/data/b\" \
             \"file2\"\n"
        );
    }
}
