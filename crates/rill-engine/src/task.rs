//! Per-firing task records.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};

use crate::{error::EngineError, stage::FileHolder, value::Value};

/// Exit status sentinel used while the real code is unknown.
pub const EXIT_UNKNOWN: i32 = i32::MAX;

pub const WRAPPER_FILE: &str = ".command.sh";
pub const LAUNCHER_FILE: &str = ".command.run";
pub const ENV_FILE: &str = ".command.env";
pub const OUT_FILE: &str = ".command.out";
pub const STDIN_FILE: &str = ".command.in";
pub const EXIT_FILE: &str = ".exitcode";

/// An inline code body executed by the native backend instead of a shell
/// script.
pub type NativeBody =
    Arc<dyn Fn(&BTreeMap<String, Value>) -> Result<Value, EngineError> + Send + Sync>;

/// Returns the file holders to stage for a task. The merge processor
/// overrides this to cover all accumulated firings.
pub type StagedProvider = Arc<dyn Fn() -> Vec<FileHolder> + Send + Sync>;

/// One firing of a process: immutable once built. Mutable completion state
/// travels separately as [`TaskResult`].
pub struct TaskRun {
    /// Monotonic within the owning process.
    pub id: u64,
    /// Submission ordinal within the owning process (1-based).
    pub index: u64,
    /// Display name, e.g. `align (3)`.
    pub name: String,
    pub process: String,
    pub session_id: String,
    /// Cache key; absent when caching is disabled.
    pub hash: Option<String>,
    pub work_dir: Utf8PathBuf,
    /// Rendered command text; absent for native bodies.
    pub script: Option<String>,
    pub native: Option<NativeBody>,
    /// Firing context the script was rendered against.
    pub context: BTreeMap<String, Value>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub container: Option<String>,
    pub queue: Option<String>,
    pub cluster_options: Option<String>,
    pub max_duration: Option<Duration>,
    pub attempt: u32,
    /// Extra files written into the work directory before submission, e.g.
    /// the per-firing command files of a merged task.
    pub aux_files: Vec<(String, String)>,
    pub staged_provider: StagedProvider,
}

impl TaskRun {
    pub fn staged(&self) -> Vec<FileHolder> {
        (self.staged_provider)()
    }

    pub fn wrapper_file(&self) -> Utf8PathBuf {
        self.work_dir.join(WRAPPER_FILE)
    }

    pub fn launcher_file(&self) -> Utf8PathBuf {
        self.work_dir.join(LAUNCHER_FILE)
    }

    pub fn env_file(&self) -> Utf8PathBuf {
        self.work_dir.join(ENV_FILE)
    }

    pub fn out_file(&self) -> Utf8PathBuf {
        self.work_dir.join(OUT_FILE)
    }

    pub fn stdin_file(&self) -> Utf8PathBuf {
        self.work_dir.join(STDIN_FILE)
    }

    pub fn exit_file(&self) -> Utf8PathBuf {
        self.work_dir.join(EXIT_FILE)
    }

    /// Interpreter from the script's shebang line, if any.
    pub fn interpreter(&self) -> Option<&str> {
        let script = self.script.as_deref()?;
        let first = script.lines().next()?;
        first.strip_prefix("#!").map(str::trim)
    }

    /// Script body with any shebang line removed.
    pub fn script_body(&self) -> Option<&str> {
        let script = self.script.as_deref()?;
        if script.starts_with("#!") {
            Some(script.split_once('\n').map(|(_, rest)| rest).unwrap_or(""))
        } else {
            Some(script)
        }
    }
}

impl fmt::Debug for TaskRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRun")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("name", &self.name)
            .field("process", &self.process)
            .field("hash", &self.hash)
            .field("work_dir", &self.work_dir)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// What a handler observed once its task left the backend.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// `EXIT_UNKNOWN` when no exit code could be read.
    pub exit_status: i32,
    /// Path to the merged stdout/stderr capture, when the backend produced
    /// one.
    pub stdout: Option<Utf8PathBuf>,
    /// Return value of a native body.
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(&self) -> bool {
        self.error.is_none() && self.exit_status == 0
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            exit_status: EXIT_UNKNOWN,
            stdout: None,
            value: None,
            error: Some(message.into()),
        }
    }
}

/// Read `.exitcode` from a work directory.
pub(crate) fn read_exit_file(work_dir: &Utf8Path) -> Option<i32> {
    let raw = std::fs::read_to_string(work_dir.join(EXIT_FILE)).ok()?;
    raw.trim().parse().ok()
}
