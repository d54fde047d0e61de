//! Per-backend task monitor.
//!
//! One monitor exists per backend class. It owns a bounded admission FIFO
//! (the `put` side blocks when full, which is the engine's backpressure) and
//! a single polling worker that submits admitted handlers up to the
//! capacity, refreshes the backend's queue snapshot, and drives every
//! non-terminal handler through its running/completed checks.

use std::{collections::VecDeque, sync::Arc};

use futures::future::BoxFuture;
use tokio::{
    sync::{mpsc, watch, Notify},
    time::{sleep, Instant},
};
use tracing::{debug, warn};

use crate::{
    backend::ExecutorBackend,
    error::EngineError,
    events::{EventBus, TaskEvent, TaskEventKind},
    handler::{HandlerStatus, TaskHandler},
    task::{TaskResult, TaskRun},
};

/// Completion callback owned by the submitting process: collects outputs,
/// binds them to channels and applies the error strategy.
pub type Collector =
    Arc<dyn Fn(Arc<TaskRun>, TaskResult) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

pub struct Submission {
    pub handler: Box<dyn TaskHandler>,
    pub collector: Collector,
}

/// Give up on a handler after this many failed submit attempts.
const MAX_SUBMIT_ATTEMPTS: u32 = 3;
/// After this many consecutive backend command failures, every owned
/// handler is marked failed.
const MAX_BACKEND_FAILURES: u32 = 5;

pub struct TaskMonitor {
    backend: Arc<dyn ExecutorBackend>,
    events: Arc<EventBus>,
    rx: mpsc::Receiver<Submission>,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

/// Cloneable handle used by the dispatcher to feed a monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    name: &'static str,
    tx: mpsc::Sender<Submission>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
}

impl MonitorHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a handler. Blocks while the admission FIFO is full.
    pub async fn put(&self, submission: Submission) -> Result<(), EngineError> {
        self.tx
            .send(submission)
            .await
            .map_err(|_| EngineError::SessionTerminated)
    }

    /// Wake the poller ahead of its interval.
    pub fn signal_complete(&self) {
        self.wake.notify_one();
    }

    /// The wake handle given to handlers with asynchronous completion.
    pub(crate) fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.wake.notify_one();
    }
}

struct Active {
    handler: Box<dyn TaskHandler>,
    collector: Collector,
}

impl TaskMonitor {
    pub fn new(backend: Arc<dyn ExecutorBackend>, events: Arc<EventBus>) -> (Self, MonitorHandle) {
        let settings = backend.monitor_settings();
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = MonitorHandle {
            name: backend.name(),
            tx,
            wake: wake.clone(),
            shutdown: shutdown_tx,
        };
        let monitor = Self {
            backend,
            events,
            rx,
            wake,
            shutdown: shutdown_rx,
        };
        (monitor, handle)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let settings = self.backend.monitor_settings();
        let mut active: Vec<Active> = Vec::new();
        let mut backlog: VecDeque<(Submission, u32)> = VecDeque::new();
        let mut backend_failures = 0u32;
        let mut last_refresh: Option<Instant> = None;
        debug!(
            "monitor for backend '{}' started with capacity {}",
            self.backend.name(),
            settings.capacity
        );

        loop {
            // 1. Admit NEW handlers in insertion order up to the budget.
            while active.len() < settings.capacity {
                let (mut submission, attempts) = match backlog.pop_front() {
                    Some(entry) => entry,
                    None => match self.rx.try_recv() {
                        Ok(submission) => (submission, 0),
                        Err(_) => break,
                    },
                };
                match submission.handler.submit().await {
                    Ok(()) => {
                        backend_failures = 0;
                        active.push(Active {
                            handler: submission.handler,
                            collector: submission.collector,
                        });
                    }
                    Err(e) => {
                        backend_failures += 1;
                        let attempts = attempts + 1;
                        if attempts >= MAX_SUBMIT_ATTEMPTS {
                            warn!("giving up on task submission: {e}");
                            self.fail(submission, e.to_string()).await;
                        } else {
                            debug!("submit failed (attempt {attempts}), will retry: {e}");
                            backlog.push_back((submission, attempts));
                        }
                        // Back off until the next tick instead of hammering
                        // a broken backend.
                        break;
                    }
                }
            }

            // 2. Refresh the cached queue snapshot when due.
            if let Some(interval) = settings.queue_refresh {
                let due = last_refresh.is_none_or(|at| at.elapsed() >= interval);
                if due && !active.is_empty() {
                    last_refresh = Some(Instant::now());
                    match self.backend.refresh_queue().await {
                        Ok(()) => backend_failures = 0,
                        Err(e) => {
                            backend_failures += 1;
                            warn!("queue refresh failed: {e}");
                        }
                    }
                }
            }

            if backend_failures >= MAX_BACKEND_FAILURES {
                warn!(
                    "backend '{}' failed {backend_failures} times in a row, failing all owned \
                     handlers",
                    self.backend.name()
                );
                for mut entry in active.drain(..) {
                    entry.handler.kill().await;
                    let task = entry.handler.task().clone();
                    let result = TaskResult::failed("backend unavailable");
                    self.settle(&entry.collector, task, result).await;
                }
                for (submission, _) in backlog.drain(..) {
                    self.fail(submission, "backend unavailable".to_owned()).await;
                }
                backend_failures = 0;
            }

            // 3. Drive every non-terminal handler.
            let mut index = 0;
            while index < active.len() {
                match Self::advance(&mut active[index], &self.events).await {
                    Ok(None) => index += 1,
                    Ok(Some(result)) => {
                        let entry = active.swap_remove(index);
                        let task = entry.handler.task().clone();
                        self.settle(&entry.collector, task, result).await;
                    }
                    Err(e) => {
                        let mut entry = active.swap_remove(index);
                        entry.handler.kill().await;
                        let task = entry.handler.task().clone();
                        self.events.emit(TaskEvent::new(
                            TaskEventKind::Failed {
                                message: e.to_string(),
                            },
                            &task,
                        ));
                        self.settle(&entry.collector, task, TaskResult::failed(e.to_string()))
                            .await;
                    }
                }
            }

            // 4. Park until something happens.
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = sleep(settings.poll_interval) => {}
            }
            if *self.shutdown.borrow() {
                break;
            }
        }

        // Session shutdown: kill whatever is still owned. Completion latches
        // release through the handlers' status cells.
        debug!(
            "monitor for backend '{}' stopping with {} active handlers",
            self.backend.name(),
            active.len()
        );
        for mut entry in active.drain(..) {
            entry.handler.kill().await;
        }
        for (mut submission, _) in backlog.drain(..) {
            submission.handler.kill().await;
        }
        self.rx.close();
        while let Ok(mut submission) = self.rx.try_recv() {
            submission.handler.kill().await;
        }
    }

    /// One running/completed check round for a handler. Returns the result
    /// once the handler completed.
    async fn advance(
        entry: &mut Active,
        events: &EventBus,
    ) -> Result<Option<TaskResult>, EngineError> {
        if entry.handler.status() < HandlerStatus::Running && entry.handler.check_if_running().await?
        {
            events.emit(TaskEvent::new(TaskEventKind::Started, entry.handler.task()));
        }
        if entry.handler.check_if_completed().await? {
            let result = entry
                .handler
                .take_result()
                .unwrap_or_else(|| TaskResult::failed("handler completed without a result"));
            return Ok(Some(result));
        }
        Ok(None)
    }

    async fn settle(&self, collector: &Collector, task: Arc<TaskRun>, result: TaskResult) {
        let kind = if result.ok() {
            TaskEventKind::Completed {
                exit_status: result.exit_status,
            }
        } else {
            TaskEventKind::Failed {
                message: result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("exit status {}", result.exit_status)),
            }
        };
        self.events.emit(TaskEvent::new(kind, &task));
        if let Err(e) = collector(task, result).await {
            warn!("output collector failed: {e}");
        }
    }

    async fn fail(&self, submission: Submission, message: String) {
        let task = submission.handler.task().clone();
        self.events.emit(TaskEvent::new(
            TaskEventKind::Failed {
                message: message.clone(),
            },
            &task,
        ));
        if let Err(e) = (submission.collector)(task, TaskResult::failed(message)).await {
            warn!("output collector failed: {e}");
        }
    }
}
