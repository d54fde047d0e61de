//! Task dispatcher.
//!
//! Session-scoped router between processes and monitors: one monitor per
//! backend class, created lazily. Monitors created after `start()` begin
//! polling immediately; earlier ones are held and started together.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::watch;
use tracing::debug;

use crate::{
    backend::ExecutorBackend,
    error::EngineError,
    events::{EventBus, TaskEvent, TaskEventKind, TaskListener},
    monitor::{Collector, MonitorHandle, Submission, TaskMonitor},
    task::TaskRun,
};

#[derive(Default)]
struct Inner {
    monitors: HashMap<&'static str, MonitorHandle>,
    pending: Vec<TaskMonitor>,
    running: Vec<tokio::task::JoinHandle<()>>,
    started: bool,
}

pub struct TaskDispatcher {
    events: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl Default for TaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDispatcher {
    pub fn new() -> Self {
        Self {
            events: Arc::new(EventBus::new()),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn add_listener(&self, listener: TaskListener) {
        self.events.subscribe(listener);
    }

    /// Start polling. Monitors created before this point are spawned now.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
        inner.started = true;
        let pending = std::mem::take(&mut inner.pending);
        for monitor in pending {
            inner.running.push(monitor.spawn());
        }
    }

    /// The monitor for a backend class, created on first use.
    pub fn monitor_for(&self, backend: &Arc<dyn ExecutorBackend>) -> MonitorHandle {
        let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
        if let Some(handle) = inner.monitors.get(backend.name()) {
            return handle.clone();
        }
        let (monitor, handle) = TaskMonitor::new(backend.clone(), self.events.clone());
        debug!("created monitor for backend '{}'", backend.name());
        if inner.started {
            inner.running.push(monitor.spawn());
        } else {
            inner.pending.push(monitor);
        }
        inner.monitors.insert(backend.name(), handle.clone());
        handle
    }

    /// Create the handler for a task, enqueue it on the right monitor, and
    /// optionally block until it completes.
    pub async fn submit(
        &self,
        backend: &Arc<dyn ExecutorBackend>,
        task: Arc<TaskRun>,
        collector: Collector,
        await_termination: bool,
        message: &str,
    ) -> Result<(), EngineError> {
        let handle = self.monitor_for(backend);
        let handler = backend.create_handler(task.clone(), handle.waker());
        debug!("{message}");
        self.events
            .emit(TaskEvent::new(TaskEventKind::Submitted, &task));
        let completion = handler.completion();
        handle.put(Submission { handler, collector }).await?;
        handle.signal_complete();
        if await_termination {
            wait_released(completion).await?;
        }
        Ok(())
    }

    /// Stop all monitors. Queued and in-flight handlers are killed by their
    /// monitors; completion latches release with a session-terminated error.
    pub async fn shutdown(&self) {
        let (handles, running) = {
            let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
            inner.pending.clear();
            (
                inner.monitors.values().cloned().collect::<Vec<_>>(),
                std::mem::take(&mut inner.running),
            )
        };
        for handle in &handles {
            handle.stop();
        }
        for join in running {
            let _ = join.await;
        }
    }
}

async fn wait_released(mut completion: watch::Receiver<bool>) -> Result<(), EngineError> {
    loop {
        if *completion.borrow() {
            return Ok(());
        }
        completion
            .changed()
            .await
            .map_err(|_| EngineError::SessionTerminated)?;
    }
}
