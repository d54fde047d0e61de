//! Grid backend: tasks run through a batch scheduler.
//!
//! The backend is generic over a [`GridScheduler`], which only describes the
//! scheduler's wire format: how to build submit/kill/queue command lines and
//! parse their stdout. Handlers never run the queue command themselves; they
//! read the snapshot the monitor refreshes at its configured interval.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use camino::Utf8Path;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{ExecutorBackend, MonitorSettings, QueueStatus};
use crate::{
    error::EngineError,
    handler::{HandlerStatus, StatusCell, TaskHandler},
    task::{read_exit_file, TaskResult, TaskRun, EXIT_UNKNOWN},
};

/// Grace period for `.exitcode` to land on shared storage after the job has
/// left the queue.
const EXIT_FILE_GRACE: Duration = Duration::from_secs(90);

/// Wire format of one batch scheduler family.
pub trait GridScheduler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn submit_command(&self, task: &TaskRun, wrapper: &Utf8Path) -> Vec<String>;

    fn kill_command(&self, job_id: &str) -> Vec<String>;

    fn queue_command(&self, queue: Option<&str>) -> Vec<String>;

    /// Extract the job id from the submit command's stdout.
    fn parse_submit_id(&self, stdout: &str) -> Option<String>;

    /// Parse the queue command's stdout into a `{job id -> status}` map.
    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus>;
}

type QueueSnapshot = Arc<RwLock<HashMap<String, QueueStatus>>>;

pub struct GridBackend<S> {
    scheduler: Arc<S>,
    settings: MonitorSettings,
    queue: Option<String>,
    snapshot: QueueSnapshot,
}

impl<S: GridScheduler> GridBackend<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            settings: MonitorSettings {
                capacity: 100,
                poll_interval: Duration::from_secs(1),
                queue_refresh: Some(Duration::from_secs(30)),
            },
            queue: None,
            snapshot: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[async_trait]
impl<S: GridScheduler> ExecutorBackend for GridBackend<S> {
    fn name(&self) -> &'static str {
        self.scheduler.name()
    }

    fn as_backend(&self) -> &dyn ExecutorBackend {
        self
    }

    fn monitor_settings(&self) -> MonitorSettings {
        self.settings
    }

    fn create_handler(&self, task: Arc<TaskRun>, _wake: Arc<Notify>) -> Box<dyn TaskHandler> {
        Box::new(GridHandler {
            task,
            cell: StatusCell::new(),
            scheduler: self.scheduler.clone(),
            snapshot: self.snapshot.clone(),
            job_id: None,
            exit_missing_since: None,
            result: None,
        })
    }

    async fn refresh_queue(&self) -> Result<(), EngineError> {
        let argv = self.scheduler.queue_command(self.queue.as_deref());
        let output = run_command(&argv).await?;
        let parsed = self.scheduler.parse_queue_status(&output);
        debug!("queue snapshot refreshed with {} jobs", parsed.len());
        *self.snapshot.write().expect("queue snapshot lock poisoned") = parsed;
        Ok(())
    }
}

async fn run_command(argv: &[String]) -> Result<String, EngineError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| EngineError::Backend("empty command line".to_owned()))?;
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::Backend(format!("failed to run {program}: {e}")))?;
    if !output.status.success() {
        return Err(EngineError::Backend(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

struct GridHandler<S> {
    task: Arc<TaskRun>,
    cell: StatusCell,
    scheduler: Arc<S>,
    snapshot: QueueSnapshot,
    job_id: Option<String>,
    exit_missing_since: Option<Instant>,
    result: Option<TaskResult>,
}

impl<S: GridScheduler> GridHandler<S> {
    fn queue_status(&self) -> Option<QueueStatus> {
        let job_id = self.job_id.as_deref()?;
        self.snapshot
            .read()
            .expect("queue snapshot lock poisoned")
            .get(job_id)
            .copied()
    }

    fn complete(&mut self, result: TaskResult) {
        self.result = Some(result);
        self.cell.set(HandlerStatus::Completed);
    }
}

#[async_trait]
impl<S: GridScheduler> TaskHandler for GridHandler<S> {
    fn task(&self) -> &Arc<TaskRun> {
        &self.task
    }

    fn status(&self) -> HandlerStatus {
        self.cell.status()
    }

    fn last_update(&self) -> Instant {
        self.cell.last_update()
    }

    fn completion(&self) -> tokio::sync::watch::Receiver<bool> {
        self.cell.completion()
    }

    async fn submit(&mut self) -> Result<(), EngineError> {
        let argv = self
            .scheduler
            .submit_command(&self.task, &self.task.wrapper_file());
        let stdout = run_command(&argv)
            .await
            .map_err(|e| EngineError::SubmitFailed {
                task: self.task.name.clone(),
                message: e.to_string(),
            })?;
        let job_id =
            self.scheduler
                .parse_submit_id(&stdout)
                .ok_or_else(|| EngineError::SubmitFailed {
                    task: self.task.name.clone(),
                    message: format!("could not parse job id from: {}", stdout.trim()),
                })?;
        debug!("task '{}' submitted as job {job_id}", self.task.name);
        self.job_id = Some(job_id);
        self.cell.set(HandlerStatus::Submitted);
        Ok(())
    }

    async fn check_if_running(&mut self) -> Result<bool, EngineError> {
        if self.cell.status() != HandlerStatus::Submitted {
            return Ok(false);
        }
        if self.queue_status() == Some(QueueStatus::Running) {
            self.cell.set(HandlerStatus::Running);
            return Ok(true);
        }
        Ok(false)
    }

    async fn check_if_completed(&mut self) -> Result<bool, EngineError> {
        let status = self.cell.status();
        if status != HandlerStatus::Running && status != HandlerStatus::Submitted {
            return Ok(false);
        }
        if let Some(exit_status) = read_exit_file(&self.task.work_dir) {
            self.complete(TaskResult {
                exit_status,
                stdout: Some(self.task.out_file()),
                value: None,
                error: None,
            });
            return Ok(true);
        }
        // Exit file not there yet. If the scheduler still owns the job that
        // is fine; once it has left the queue only the grace period remains.
        let gone = matches!(
            self.queue_status(),
            None | Some(QueueStatus::Completed) | Some(QueueStatus::Error)
        );
        if gone {
            let missing_since = *self.exit_missing_since.get_or_insert_with(Instant::now);
            if missing_since.elapsed() > EXIT_FILE_GRACE {
                warn!(
                    "job for task '{}' left the queue but produced no exit file",
                    self.task.name
                );
                self.complete(TaskResult {
                    exit_status: EXIT_UNKNOWN,
                    stdout: Some(self.task.out_file()),
                    value: None,
                    error: Some("task completed without an exit file".to_owned()),
                });
                return Ok(true);
            }
        } else {
            self.exit_missing_since = None;
        }
        Ok(false)
    }

    async fn kill(&mut self) {
        if let Some(job_id) = &self.job_id {
            let argv = self.scheduler.kill_command(job_id);
            if let Err(e) = run_command(&argv).await {
                warn!("failed to cancel job {job_id}: {e}");
            }
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

/// SLURM-like scheduler wire format.
pub struct SlurmScheduler;

impl SlurmScheduler {
    fn job_name(task: &TaskRun) -> String {
        let raw = format!("rill-{}", task.name);
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    fn walltime(limit: Duration) -> String {
        let total = limit.as_secs();
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

impl GridScheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn submit_command(&self, task: &TaskRun, wrapper: &Utf8Path) -> Vec<String> {
        let mut argv = vec![
            "sbatch".to_owned(),
            "-D".to_owned(),
            task.work_dir.to_string(),
            "-J".to_owned(),
            Self::job_name(task),
            "-o".to_owned(),
            "/dev/null".to_owned(),
        ];
        if let Some(limit) = task.max_duration {
            argv.push("-t".to_owned());
            argv.push(Self::walltime(limit));
        }
        if let Some(queue) = &task.queue {
            argv.push("-p".to_owned());
            argv.push(queue.clone());
        }
        if let Some(options) = &task.cluster_options {
            argv.extend(options.split_whitespace().map(str::to_owned));
        }
        argv.push(wrapper.to_string());
        argv
    }

    fn kill_command(&self, job_id: &str) -> Vec<String> {
        vec!["scancel".to_owned(), job_id.to_owned()]
    }

    fn queue_command(&self, queue: Option<&str>) -> Vec<String> {
        let mut argv = vec![
            "squeue".to_owned(),
            "-h".to_owned(),
            "-o".to_owned(),
            "%i %t".to_owned(),
        ];
        if let Some(queue) = queue {
            argv.push("-p".to_owned());
            argv.push(queue.to_owned());
        }
        argv
    }

    fn parse_submit_id(&self, stdout: &str) -> Option<String> {
        for line in stdout.lines() {
            if line.starts_with("Submitted batch job") {
                return line.split_whitespace().last().map(str::to_owned);
            }
        }
        // Some deployments print the bare id.
        let trimmed = stdout.trim();
        (!trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()))
            .then(|| trimmed.to_owned())
    }

    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut map = HashMap::new();
        for line in stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(id), Some(code)) = (fields.next(), fields.next()) else {
                continue;
            };
            let status = match code {
                "PD" => QueueStatus::Pending,
                "R" => QueueStatus::Running,
                "S" => QueueStatus::Hold,
                "CA" | "F" | "NF" | "TO" => QueueStatus::Error,
                "CD" => QueueStatus::Completed,
                _ => QueueStatus::Unknown,
            };
            map.insert(id.to_owned(), status);
        }
        map
    }
}
