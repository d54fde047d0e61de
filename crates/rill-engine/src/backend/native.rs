//! Native backend: inline code bodies run on the runtime instead of a
//! shell. There is no wrapper, no work-directory staging and no exit file;
//! the body's return value is the task's output.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ExecutorBackend, MonitorSettings};
use crate::{
    error::EngineError,
    handler::{HandlerStatus, StatusCell, TaskHandler},
    task::{TaskResult, TaskRun},
    value::Value,
};

pub struct NativeBackend {
    capacity: usize,
}

impl NativeBackend {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

#[async_trait]
impl ExecutorBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn as_backend(&self) -> &dyn ExecutorBackend {
        self
    }

    fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            capacity: self.capacity,
            poll_interval: Duration::from_millis(20),
            queue_refresh: None,
        }
    }

    fn prepare(&self, task: &TaskRun) -> Result<(), EngineError> {
        // No wrapper to build; the work dir still exists for provenance.
        std::fs::create_dir_all(&task.work_dir)?;
        Ok(())
    }

    fn create_handler(&self, task: Arc<TaskRun>, wake: Arc<Notify>) -> Box<dyn TaskHandler> {
        Box::new(NativeHandler {
            task,
            cell: StatusCell::new(),
            wake,
            handle: None,
            result: None,
        })
    }
}

struct NativeHandler {
    task: Arc<TaskRun>,
    cell: StatusCell,
    wake: Arc<Notify>,
    handle: Option<tokio::task::JoinHandle<Result<Value, EngineError>>>,
    result: Option<TaskResult>,
}

#[async_trait]
impl TaskHandler for NativeHandler {
    fn task(&self) -> &Arc<TaskRun> {
        &self.task
    }

    fn status(&self) -> HandlerStatus {
        self.cell.status()
    }

    fn last_update(&self) -> std::time::Instant {
        self.cell.last_update()
    }

    fn completion(&self) -> tokio::sync::watch::Receiver<bool> {
        self.cell.completion()
    }

    async fn submit(&mut self) -> Result<(), EngineError> {
        let body = self.task.native.clone().ok_or_else(|| {
            EngineError::Validation(format!(
                "process '{}' targets the native executor but has no code body",
                self.task.process
            ))
        })?;
        let context = self.task.context.clone();
        let wake = self.wake.clone();
        self.handle = Some(tokio::task::spawn_blocking(move || {
            let out = body(&context);
            wake.notify_one();
            out
        }));
        self.cell.set(HandlerStatus::Submitted);
        Ok(())
    }

    async fn check_if_running(&mut self) -> Result<bool, EngineError> {
        if self.cell.status() == HandlerStatus::Submitted && self.handle.is_some() {
            self.cell.set(HandlerStatus::Running);
            return Ok(true);
        }
        Ok(false)
    }

    async fn check_if_completed(&mut self) -> Result<bool, EngineError> {
        if self.cell.status() != HandlerStatus::Running {
            return Ok(false);
        }
        if !self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            return Ok(false);
        }
        let handle = self.handle.take().expect("handle checked above");
        let result = match handle.await {
            Ok(Ok(value)) => TaskResult {
                exit_status: 0,
                stdout: None,
                value: Some(value),
                error: None,
            },
            Ok(Err(e)) => TaskResult {
                exit_status: 1,
                stdout: None,
                value: None,
                error: Some(e.to_string()),
            },
            Err(join_error) => TaskResult::failed(format!("native body panicked: {join_error}")),
        };
        self.result = Some(result);
        self.cell.set(HandlerStatus::Completed);
        Ok(true)
    }

    async fn kill(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        if self.result.is_none() {
            self.result = Some(TaskResult::failed("task was killed"));
        }
        self.cell.set(HandlerStatus::Completed);
    }

    fn take_result(&mut self) -> Option<TaskResult> {
        self.result.take()
    }
}
