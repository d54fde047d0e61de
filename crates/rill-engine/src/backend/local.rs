//! Local backend: tasks run as child processes on this machine.
//!
//! Submission spawns `/bin/bash .command.sh` inside the task work directory
//! with stdout and stderr redirected to `.command.out`. A detached waiter
//! task owns the child, publishes its exit through a watch channel and pings
//! the monitor so completion is observed without a full poll interval.

use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    process::Command,
    sync::{mpsc, watch, Notify},
    time::Instant,
};
use tracing::debug;

use super::{ExecutorBackend, MonitorSettings};
use crate::{
    error::EngineError,
    handler::{HandlerStatus, StatusCell, TaskHandler},
    task::{read_exit_file, TaskResult, TaskRun, EXIT_UNKNOWN, WRAPPER_FILE},
};

pub struct LocalBackend {
    capacity: usize,
    poll_interval: Duration,
}

impl LocalBackend {
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            capacity,
            poll_interval,
        }
    }

    /// Pool sized to the machine, polled fast enough that short tasks do
    /// not linger.
    pub fn with_defaults() -> Self {
        let capacity = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);
        Self::new(capacity, Duration::from_millis(50))
    }
}

#[async_trait]
impl ExecutorBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn as_backend(&self) -> &dyn ExecutorBackend {
        self
    }

    fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            capacity: self.capacity,
            poll_interval: self.poll_interval,
            queue_refresh: None,
        }
    }

    fn create_handler(&self, task: Arc<TaskRun>, wake: Arc<Notify>) -> Box<dyn TaskHandler> {
        Box::new(LocalHandler {
            task,
            cell: StatusCell::new(),
            wake,
            exit: None,
            kill_tx: None,
            started_at: None,
            timed_out: false,
            result: None,
        })
    }
}

/// How the child ended, as observed by the waiter task.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ChildExit {
    Finished(Option<i32>),
    Killed,
}

struct LocalHandler {
    task: Arc<TaskRun>,
    cell: StatusCell,
    wake: Arc<Notify>,
    exit: Option<watch::Receiver<Option<ChildExit>>>,
    kill_tx: Option<mpsc::Sender<()>>,
    started_at: Option<Instant>,
    timed_out: bool,
    result: Option<TaskResult>,
}

impl LocalHandler {
    fn observed_exit(&self) -> Option<ChildExit> {
        self.exit.as_ref().and_then(|rx| *rx.borrow())
    }

    fn request_kill(&self) {
        if let Some(tx) = &self.kill_tx {
            let _ = tx.try_send(());
        }
    }
}

#[async_trait]
impl TaskHandler for LocalHandler {
    fn task(&self) -> &Arc<TaskRun> {
        &self.task
    }

    fn status(&self) -> HandlerStatus {
        self.cell.status()
    }

    fn last_update(&self) -> std::time::Instant {
        self.cell.last_update()
    }

    fn completion(&self) -> watch::Receiver<bool> {
        self.cell.completion()
    }

    async fn submit(&mut self) -> Result<(), EngineError> {
        let submit_err = |message: String| EngineError::SubmitFailed {
            task: self.task.name.clone(),
            message,
        };
        let out = std::fs::File::create(self.task.out_file())
            .map_err(|e| submit_err(e.to_string()))?;
        let err = out.try_clone().map_err(|e| submit_err(e.to_string()))?;

        let mut command = Command::new("/bin/bash");
        command
            .arg(WRAPPER_FILE)
            .current_dir(&self.task.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));
        // Put the child in its own process group so kill() takes the whole
        // tree with it.
        #[cfg(unix)]
        {
            use nix::unistd::setsid;
            unsafe {
                command.pre_exec(|| {
                    setsid()?;
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(|e| submit_err(e.to_string()))?;
        let pid = child.id();
        debug!("spawned task '{}' as pid {:?}", self.task.name, pid);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let wake = self.wake.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => {
                    ChildExit::Finished(status.ok().and_then(|s| s.code()))
                }
                _ = kill_rx.recv() => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        // Negative pid addresses the process group.
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                    }
                    let _ = child.kill().await;
                    ChildExit::Killed
                }
            };
            let _ = exit_tx.send(Some(exit));
            wake.notify_one();
        });

        self.exit = Some(exit_rx);
        self.kill_tx = Some(kill_tx);
        self.started_at = Some(Instant::now());
        self.cell.set(HandlerStatus::Submitted);
        Ok(())
    }

    async fn check_if_running(&mut self) -> Result<bool, EngineError> {
        // The process object exists as soon as submission returned.
        if self.cell.status() == HandlerStatus::Submitted && self.exit.is_some() {
            self.cell.set(HandlerStatus::Running);
            return Ok(true);
        }
        Ok(false)
    }

    async fn check_if_completed(&mut self) -> Result<bool, EngineError> {
        if self.cell.status() != HandlerStatus::Running {
            return Ok(false);
        }
        if let Some(exit) = self.observed_exit() {
            let result = if self.timed_out {
                let limit = self.task.max_duration.unwrap_or_default();
                TaskResult {
                    exit_status: EXIT_UNKNOWN,
                    stdout: Some(self.task.out_file()),
                    value: None,
                    error: Some(
                        EngineError::WalltimeExceeded {
                            task: self.task.name.clone(),
                            limit,
                        }
                        .to_string(),
                    ),
                }
            } else {
                match exit {
                    ChildExit::Finished(code) => {
                        let exit_status = read_exit_file(&self.task.work_dir)
                            .or(code)
                            .unwrap_or(EXIT_UNKNOWN);
                        TaskResult {
                            exit_status,
                            stdout: Some(self.task.out_file()),
                            value: None,
                            error: None,
                        }
                    }
                    ChildExit::Killed => TaskResult {
                        exit_status: EXIT_UNKNOWN,
                        stdout: Some(self.task.out_file()),
                        value: None,
                        error: Some("task was killed".to_owned()),
                    },
                }
            };
            self.result = Some(result);
            self.cell.set(HandlerStatus::Completed);
            return Ok(true);
        }
        // Enforce the walltime: destroy the process group and let the next
        // poll observe the exit.
        if let (Some(limit), Some(started_at)) = (self.task.max_duration, self.started_at) {
            if !self.timed_out && started_at.elapsed() > limit {
                debug!("task '{}' exceeded walltime, killing", self.task.name);
                self.timed_out = true;
                self.request_kill();
            }
        }
        Ok(false)
    }

    async fn kill(&mut self) {
        self.request_kill();
        if self.result.is_none() {
            self.result = Some(TaskResult::failed("task was killed"));
        }
        self.cell.set(HandlerStatus::Completed);
    }

    fn take_result(&mut self) -> Option<TaskResult> {
        self.result.take()
    }
}
