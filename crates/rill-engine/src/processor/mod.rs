//! The operator layer: turns channel traffic into task firings.
//!
//! [`ParallelProcessor`] fires one task per inbound tuple (with an optional
//! `each` fan-out stage upstream); [`MergeProcessor`] folds every tuple into
//! a single submission on termination. Both share [`ProcessorCore`]: input
//! resolution, script rendering, hashing, cache consult, dispatch, output
//! collection and the error strategy.

mod merge;
mod parallel;

pub use merge::MergeProcessor;
pub use parallel::ParallelProcessor;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use camino::Utf8Path;
use rill_cache::CacheEntry;
use rill_hash::{HashInput, HashKey};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::{
    backend::ExecutorBackend,
    channel::{Element, InputSource},
    config::ProcessConfig,
    error::{EngineError, ErrorStrategy},
    events::{TaskEvent, TaskEventKind},
    monitor::Collector,
    params::{InParam, OutParam, OutSlot, ParamSpec, SetSlot},
    session::Session,
    stage::{self, FileHolder, NameRegistry},
    task::{NativeBody, TaskResult, TaskRun},
    value::Value,
};

/// A declared unit of work: typed inputs, typed outputs and a body.
pub struct ProcessDef {
    pub name: String,
    pub inputs: Vec<InParam>,
    pub outputs: Vec<OutParam>,
    pub body: ProcessBody,
}

pub enum ProcessBody {
    Script(ScriptTemplate),
    Native(NativeBody),
}

/// Script template with explicit `$name` / `${name}` lookup against the
/// firing context. `$$` renders a literal dollar; unknown names are errors.
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    text: String,
}

impl ScriptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn render(
        &self,
        process: &str,
        context: &BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        let mut out = String::with_capacity(self.text.len());
        let mut chars = self.text.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some((_, '$')) => {
                    chars.next();
                    out.push('$');
                }
                Some((_, '{')) => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(EngineError::Validation(format!(
                            "unterminated ${{ in script of process '{process}'"
                        )));
                    }
                    out.push_str(&lookup(process, context, &name)?.to_string());
                }
                Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {
                    let mut name = String::new();
                    while let Some((_, c)) = chars.peek().copied() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(&lookup(process, context, &name)?.to_string());
                }
                _ => out.push('$'),
            }
        }
        Ok(out)
    }
}

fn lookup<'a>(
    process: &str,
    context: &'a BTreeMap<String, Value>,
    name: &str,
) -> Result<&'a Value, EngineError> {
    context.get(name).ok_or_else(|| EngineError::UnknownVariable {
        process: process.to_owned(),
        name: name.to_owned(),
    })
}

/// Per-process counters and the poison-pill latch.
#[derive(Debug, Default)]
pub struct StateAccumulator {
    fired: AtomicU64,
    settled: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    cached: AtomicU64,
    errors: AtomicU64,
    poisoned: AtomicBool,
    notify: Notify,
}

impl StateAccumulator {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cached(&self) -> u64 {
        self.cached.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn record_fired(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }

    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    fn settle(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.settled.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn settle_completed(&self) {
        self.settle(&self.completed);
    }

    fn settle_cached(&self) {
        self.settle(&self.cached);
    }

    fn settle_error(&self) {
        self.settle(&self.errors);
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until every recorded firing has settled.
    async fn quiesce(&self) {
        loop {
            let notified = self.notify.notified();
            if self.settled.load(Ordering::SeqCst) >= self.fired.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Everything a firing resolved before submission.
struct TaskSetup {
    context: BTreeMap<String, Value>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    files: Vec<FileHolder>,
    /// `(input name, resolved value)` in declared order; file inputs carry
    /// their source paths so content is hashed.
    hash_entries: Vec<(String, Value)>,
}

pub(crate) struct ProcessorCore {
    session: Arc<Session>,
    name: String,
    specs: Vec<ParamSpec>,
    outputs: Vec<OutParam>,
    body: ProcessBody,
    config: ProcessConfig,
    backend: Arc<dyn ExecutorBackend>,
    state: Arc<StateAccumulator>,
    shared_values: Mutex<BTreeMap<String, Value>>,
    shared_files: Mutex<BTreeMap<String, Vec<FileHolder>>>,
    fatal: AtomicBool,
}

impl ProcessorCore {
    fn new(
        session: Arc<Session>,
        name: String,
        specs: Vec<ParamSpec>,
        outputs: Vec<OutParam>,
        body: ProcessBody,
        config: ProcessConfig,
    ) -> Result<Self, EngineError> {
        let backend = session.backend(&config.executor)?;
        for output in &outputs {
            validate_output(&name, output)?;
        }
        Ok(Self {
            session,
            name,
            specs,
            outputs,
            body,
            config,
            backend,
            state: Arc::new(StateAccumulator::default()),
            shared_values: Mutex::new(BTreeMap::new()),
            shared_files: Mutex::new(BTreeMap::new()),
            fatal: AtomicBool::new(false),
        })
    }

    fn has_shared(&self) -> bool {
        self.specs.iter().any(ParamSpec::is_shared)
    }

    fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Effective firing concurrency: forced serial with shared inputs.
    fn max_forks(&self) -> usize {
        if self.has_shared() {
            1
        } else {
            self.config
                .max_forks
                .unwrap_or(self.backend.monitor_settings().capacity)
                .max(1)
        }
    }

    /// Resolve one tuple into context, env, stdin and staged files.
    ///
    /// Two passes: values first, so file patterns can reference them; then
    /// file inputs, expanded against the now-complete context.
    fn setup_task(
        &self,
        index: u64,
        tuple: &[Value],
        registry: &mut NameRegistry,
    ) -> Result<TaskSetup, EngineError> {
        struct DeferredFile {
            entry_slot: Option<usize>,
            name: String,
            pattern: String,
            value: Value,
            shared: bool,
        }

        let mut context = BTreeMap::new();
        let mut env = Vec::new();
        let mut stdin = None;
        let mut entries: Vec<Option<(String, Value)>> = vec![None; self.specs.len()];
        let mut deferred: Vec<DeferredFile> = Vec::new();

        for (slot, spec) in self.specs.iter().enumerate() {
            let value = &tuple[slot];
            match spec {
                ParamSpec::Value { name } | ParamSpec::Each { name } => {
                    context.insert(name.clone(), value.clone());
                    entries[slot] = Some((name.clone(), value.clone()));
                }
                ParamSpec::Env { name } => {
                    env.push((name.clone(), value.to_string()));
                    context.insert(name.clone(), value.clone());
                    entries[slot] = Some((name.clone(), value.clone()));
                }
                ParamSpec::Stdin => {
                    stdin = Some(value.to_string());
                    entries[slot] = Some(("stdin".to_owned(), value.clone()));
                }
                ParamSpec::File { name, pattern } => {
                    deferred.push(DeferredFile {
                        entry_slot: Some(slot),
                        name: name.clone(),
                        pattern: pattern.clone(),
                        value: value.clone(),
                        shared: false,
                    });
                }
                ParamSpec::Set { slots } => {
                    let items = value.iter_items();
                    if items.len() != slots.len() {
                        return Err(EngineError::Validation(format!(
                            "process '{}': set input expects {} elements, got {}",
                            self.name,
                            slots.len(),
                            items.len()
                        )));
                    }
                    for (inner, item) in slots.iter().zip(items) {
                        match inner {
                            SetSlot::Value { name } => {
                                context.insert(name.clone(), item);
                            }
                            SetSlot::File { name, pattern } => {
                                deferred.push(DeferredFile {
                                    entry_slot: None,
                                    name: name.clone(),
                                    pattern: pattern.clone(),
                                    value: item,
                                    shared: false,
                                });
                            }
                        }
                    }
                    entries[slot] = Some((format!("set{slot}"), value.clone()));
                }
                ParamSpec::SharedValue { name, .. } => {
                    let mut shared = self.shared_values.lock().expect("shared lock poisoned");
                    if index == 1 {
                        shared.insert(name.clone(), value.clone());
                    }
                    let resolved = shared.get(name).cloned().ok_or_else(|| {
                        EngineError::Internal(format!("shared input '{name}' never resolved"))
                    })?;
                    context.insert(name.clone(), resolved.clone());
                    entries[slot] = Some((name.clone(), resolved));
                }
                ParamSpec::SharedFile { name, pattern, .. } => {
                    deferred.push(DeferredFile {
                        entry_slot: Some(slot),
                        name: name.clone(),
                        pattern: pattern.clone(),
                        value: value.clone(),
                        shared: true,
                    });
                }
            }
        }

        let mut files = Vec::new();
        for item in deferred {
            let holders = if item.shared && index > 1 {
                self.shared_files
                    .lock()
                    .expect("shared lock poisoned")
                    .get(&item.name)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Internal(format!(
                            "shared file input '{}' never resolved",
                            item.name
                        ))
                    })?
            } else {
                let pattern = if item.pattern.contains('$') {
                    ScriptTemplate::new(&item.pattern).render(&self.name, &context)?
                } else {
                    item.pattern.clone()
                };
                let holders = stage::normalize(&item.value)?;
                for holder in &holders {
                    if !holder.source_path.exists() {
                        return Err(
                            stage::StagingError::MissingSource(holder.source_path.clone()).into()
                        );
                    }
                }
                let holders = stage::expand_pattern(&pattern, holders, registry)?;
                if item.shared {
                    self.shared_files
                        .lock()
                        .expect("shared lock poisoned")
                        .insert(item.name.clone(), holders.clone());
                }
                holders
            };

            let staged_names: Vec<Value> = holders
                .iter()
                .map(|h| Value::Str(h.stored_name.clone()))
                .collect();
            let context_value = if staged_names.len() == 1 {
                staged_names.into_iter().next().expect("one element")
            } else {
                Value::List(staged_names)
            };
            context.insert(item.name.clone(), context_value);

            if let Some(slot) = item.entry_slot {
                entries[slot] = Some((
                    item.name.clone(),
                    Value::List(
                        holders
                            .iter()
                            .map(|h| Value::Path(h.source_path.clone()))
                            .collect(),
                    ),
                ));
            }
            files.extend(holders);
        }

        Ok(TaskSetup {
            context,
            env,
            stdin,
            files,
            hash_entries: entries.into_iter().flatten().collect(),
        })
    }

    fn render_script(&self, context: &BTreeMap<String, Value>) -> Result<Option<String>, EngineError> {
        match &self.body {
            ProcessBody::Script(template) => Ok(Some(template.render(&self.name, context)?)),
            ProcessBody::Native(_) => Ok(None),
        }
    }

    fn native_body(&self) -> Option<NativeBody> {
        match &self.body {
            ProcessBody::Native(body) => Some(body.clone()),
            ProcessBody::Script(_) => None,
        }
    }

    /// The firing hash: `(session, script, inputs in declared order)`.
    fn compute_hash(&self, setup: &TaskSetup, script: Option<&str>) -> Result<Option<String>, EngineError> {
        let Some(mode) = self.config.cache.hash_mode() else {
            return Ok(None);
        };
        let script = script
            .map(str::to_owned)
            .unwrap_or_else(|| format!("native:{}", self.name));
        let mut key = HashKey::new(mode);
        key.push("session", &HashInput::Str(self.session.id_str()))?;
        key.push("script", &HashInput::Str(script))?;
        for (name, value) in &setup.hash_entries {
            key.push(name, &value.to_hash_input())?;
        }
        Ok(Some(key.finish()))
    }

    fn build_task(
        &self,
        id: u64,
        index: u64,
        name: String,
        hash: Option<String>,
        script: Option<String>,
        setup: TaskSetup,
    ) -> Result<Arc<TaskRun>, EngineError> {
        let work_dir = self.session.allocate_work_dir(hash.as_deref())?;
        let files = setup.files;
        Ok(Arc::new(TaskRun {
            id,
            index,
            name,
            process: self.name.clone(),
            session_id: self.session.id_str(),
            hash,
            work_dir,
            script,
            native: self.native_body(),
            context: setup.context,
            env: setup.env,
            stdin: setup.stdin,
            container: self.config.container.clone(),
            queue: self.config.queue.clone(),
            cluster_options: self.config.cluster_options.clone(),
            max_duration: self.config.max_duration,
            attempt: 1,
            aux_files: Vec::new(),
            staged_provider: Arc::new(move || files.clone()),
        }))
    }

    /// Hand a task to the dispatcher. Blocks on the completion latch when
    /// the process is serialized.
    async fn submit_task(self: &Arc<Self>, task: Arc<TaskRun>) -> Result<(), EngineError> {
        self.backend.prepare(&task)?;
        self.state.record_submitted();
        let await_termination = self.has_shared() || self.config.max_forks.is_some();
        let message = format!("submitting task '{}'", task.name);
        self.session
            .dispatcher()
            .submit(&self.backend, task, self.collector(), await_termination, &message)
            .await
    }

    fn collector(self: &Arc<Self>) -> Collector {
        let core = self.clone();
        Arc::new(move |task, result| {
            let core = core.clone();
            Box::pin(async move { core.on_complete(task, result).await })
        })
    }

    async fn on_complete(
        self: Arc<Self>,
        task: Arc<TaskRun>,
        result: TaskResult,
    ) -> Result<(), EngineError> {
        if !result.ok() {
            let error = EngineError::Execution {
                task: task.name.clone(),
                exit_status: result.exit_status,
            };
            return self.handle_failure(Some(task), error).await;
        }
        match self.collect_outputs(
            &task.work_dir,
            &task.context,
            result.stdout.as_deref(),
            result.value.as_ref(),
        ) {
            Ok(values) => {
                self.bind_outputs(&values);
                if let Some(hash) = &task.hash {
                    let entry = CacheEntry {
                        hash: hash.clone(),
                        work_dir: task.work_dir.clone(),
                        exit_status: result.exit_status,
                    };
                    if let Err(e) = self.session.cache().record(&entry) {
                        warn!("failed to record cache entry for '{}': {e}", task.name);
                    }
                }
                self.state.settle_completed();
                Ok(())
            }
            Err(e) => self.handle_failure(Some(task), e).await,
        }
    }

    /// Apply the process error strategy to a failed firing.
    async fn handle_failure(
        self: &Arc<Self>,
        task: Option<Arc<TaskRun>>,
        error: EngineError,
    ) -> Result<(), EngineError> {
        match self.config.strategy() {
            ErrorStrategy::Ignore => {
                warn!("process '{}': firing failed, ignoring: {error}", self.name);
                self.state.settle_error();
                Ok(())
            }
            ErrorStrategy::Retry { max_retries } => {
                if let Some(task) = task {
                    if task.attempt <= max_retries {
                        warn!(
                            "task '{}' failed, retrying (attempt {} of {}): {error}",
                            task.name,
                            task.attempt + 1,
                            max_retries + 1
                        );
                        let retry = self.build_retry(&task)?;
                        let core = self.clone();
                        // Resubmission goes through its own spawn so the
                        // monitor loop driving this collector never blocks
                        // on its own admission queue.
                        tokio::spawn(async move {
                            if let Err(e) = core.submit_task(retry).await {
                                core.terminal_failure(&e);
                            }
                        });
                        return Ok(());
                    }
                }
                self.terminal_failure(&error);
                Ok(())
            }
            ErrorStrategy::Terminate => {
                self.terminal_failure(&error);
                Ok(())
            }
        }
    }

    fn terminal_failure(&self, error: &EngineError) {
        error!("process '{}' failed: {error}", self.name);
        self.fatal.store(true, Ordering::SeqCst);
        self.session.record_fatal(error);
        self.state.settle_error();
    }

    fn build_retry(&self, task: &TaskRun) -> Result<Arc<TaskRun>, EngineError> {
        let work_dir = self.session.allocate_work_dir(task.hash.as_deref())?;
        Ok(Arc::new(TaskRun {
            id: task.id,
            index: task.index,
            name: task.name.clone(),
            process: task.process.clone(),
            session_id: task.session_id.clone(),
            hash: task.hash.clone(),
            work_dir,
            script: task.script.clone(),
            native: task.native.clone(),
            context: task.context.clone(),
            env: task.env.clone(),
            stdin: task.stdin.clone(),
            container: task.container.clone(),
            queue: task.queue.clone(),
            cluster_options: task.cluster_options.clone(),
            max_duration: task.max_duration,
            attempt: task.attempt + 1,
            aux_files: task.aux_files.clone(),
            staged_provider: task.staged_provider.clone(),
        }))
    }

    /// Try to satisfy the firing from the cache. Returns the bound values on
    /// a usable hit; any missing output or non-zero exit rejects the hit
    /// wholesale.
    fn try_rehydrate(
        &self,
        hash: &str,
        context: &BTreeMap<String, Value>,
    ) -> Option<(CacheEntry, Vec<Value>)> {
        let entry = match self.session.cache().lookup(hash) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                debug!("ignoring unreadable cache entry for {hash}: {e}");
                return None;
            }
        };
        if entry.exit_status != 0 || !entry.work_dir.is_dir() {
            debug!("rejecting cache entry for {hash}");
            return None;
        }
        let stdout = entry.work_dir.join(crate::task::OUT_FILE);
        match self.collect_outputs(&entry.work_dir, context, Some(&stdout), None) {
            Ok(values) => Some((entry, values)),
            Err(e) => {
                debug!("cache entry for {hash} is missing outputs, resubmitting: {e}");
                None
            }
        }
    }

    /// Store-directory short circuit: bind previously stored outputs
    /// without submitting.
    fn try_stored(&self, context: &BTreeMap<String, Value>) -> Option<Vec<Value>> {
        let dir = self.config.store_dir.as_ref()?;
        let stdout = dir.join(crate::task::OUT_FILE);
        self.collect_outputs(dir, context, Some(&stdout), None).ok()
    }

    fn collect_outputs(
        &self,
        work_dir: &Utf8Path,
        context: &BTreeMap<String, Value>,
        stdout: Option<&Utf8Path>,
        native_value: Option<&Value>,
    ) -> Result<Vec<Value>, EngineError> {
        self.outputs
            .iter()
            .map(|output| match output {
                OutParam::Value { name, .. } => self.value_output(context, name),
                OutParam::File { pattern, .. } => file_output(work_dir, pattern),
                OutParam::Stdout { .. } => stdout_output(stdout, native_value, work_dir),
                OutParam::Set { slots, .. } => slots
                    .iter()
                    .map(|slot| match slot {
                        OutSlot::Value { name } => self.value_output(context, name),
                        OutSlot::File { pattern } => file_output(work_dir, pattern),
                        OutSlot::Stdout => stdout_output(stdout, native_value, work_dir),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List),
            })
            .collect()
    }

    fn value_output(
        &self,
        context: &BTreeMap<String, Value>,
        name: &str,
    ) -> Result<Value, EngineError> {
        lookup(&self.name, context, name).cloned()
    }

    fn bind_outputs(&self, values: &[Value]) {
        for (output, value) in self.outputs.iter().zip(values) {
            output.writer().send(value.clone());
        }
    }

    /// Bind shared outputs once, after the operator stopped and before the
    /// pill goes downstream.
    fn bind_shared_outputs(&self) {
        for spec in &self.specs {
            match spec {
                ParamSpec::SharedValue { name, out: Some(out) } => {
                    if let Some(value) = self
                        .shared_values
                        .lock()
                        .expect("shared lock poisoned")
                        .get(name)
                    {
                        out.send(value.clone());
                    }
                    out.close();
                }
                ParamSpec::SharedFile { name, out: Some(out), .. } => {
                    let holders = self
                        .shared_files
                        .lock()
                        .expect("shared lock poisoned")
                        .get(name)
                        .cloned()
                        .unwrap_or_default();
                    let paths: Vec<Value> = holders
                        .iter()
                        .map(|h| Value::Path(h.source_path.clone()))
                        .collect();
                    match paths.len() {
                        0 => {}
                        1 => out.send(paths.into_iter().next().expect("one element")),
                        _ => out.send(Value::List(paths)),
                    }
                    out.close();
                }
                _ => {}
            }
        }
    }

    /// Forward the poison pill downstream.
    fn close_outputs(&self) {
        for output in &self.outputs {
            output.writer().close();
        }
    }

    fn emit_cached(&self, task: &str, id: u64, work_dir: &Utf8Path) {
        self.session.dispatcher().events().emit(TaskEvent {
            process: self.name.clone(),
            task: task.to_owned(),
            id,
            work_dir: work_dir.to_owned(),
            kind: TaskEventKind::Cached,
        });
    }
}

fn validate_output(process: &str, output: &OutParam) -> Result<(), EngineError> {
    let check = |pattern: &str| {
        globset::Glob::new(pattern).map(|_| ()).map_err(|e| {
            EngineError::Validation(format!(
                "process '{process}': invalid output glob '{pattern}': {e}"
            ))
        })
    };
    match output {
        OutParam::File { pattern, .. } => check(pattern),
        OutParam::Set { slots, .. } => {
            for slot in slots {
                if let OutSlot::File { pattern } = slot {
                    check(pattern)?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn file_output(work_dir: &Utf8Path, pattern: &str) -> Result<Value, EngineError> {
    let matcher = globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| EngineError::Validation(format!("invalid output glob '{pattern}': {e}")))?
        .compile_matcher();
    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(work_dir).min_depth(1).sort_by_file_name() {
        let Ok(entry) = entry else { continue };
        let Some(path) = Utf8Path::from_path(entry.path()) else {
            continue;
        };
        let Ok(relative) = path.strip_prefix(work_dir) else {
            continue;
        };
        // Engine-internal dotfiles are never outputs unless asked for by
        // name.
        if !pattern.starts_with('.')
            && relative
                .components()
                .any(|c| c.as_str().starts_with('.'))
        {
            continue;
        }
        if matcher.is_match(relative.as_str()) {
            matches.push(Value::Path(path.to_owned()));
        }
    }
    match matches.len() {
        0 => Err(EngineError::MissingOutput {
            pattern: pattern.to_owned(),
            dir: work_dir.to_owned(),
        }),
        1 => Ok(matches.into_iter().next().expect("one element")),
        _ => Ok(Value::List(matches)),
    }
}

fn stdout_output(
    stdout: Option<&Utf8Path>,
    native_value: Option<&Value>,
    work_dir: &Utf8Path,
) -> Result<Value, EngineError> {
    if let Some(value) = native_value {
        return Ok(value.clone());
    }
    let path = stdout.ok_or_else(|| EngineError::MissingOutput {
        pattern: "stdout".to_owned(),
        dir: work_dir.to_owned(),
    })?;
    let raw = std::fs::read_to_string(path).map_err(|_| EngineError::MissingOutput {
        pattern: "stdout".to_owned(),
        dir: work_dir.to_owned(),
    })?;
    Ok(Value::Str(raw.trim_end().to_owned()))
}

/// Read one tuple from every input in declared order, expand `each`
/// combinations, and feed the downstream operator. `None` marks the poison
/// pill.
///
/// Shared positions are read once and replayed; a process with only bound
/// values (no queues) fires exactly once.
fn spawn_tuple_driver(
    mut sources: Vec<InputSource>,
    each: Vec<usize>,
    sticky: Vec<usize>,
) -> mpsc::UnboundedReceiver<Option<Vec<Value>>> {
    use itertools::Itertools;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let has_queue = sources.iter().any(InputSource::is_queue);
        let mut replay: HashMap<usize, Value> = HashMap::new();
        loop {
            let mut tuple = Vec::with_capacity(sources.len());
            let mut stopped = false;
            for (slot, source) in sources.iter_mut().enumerate() {
                if let Some(value) = replay.get(&slot) {
                    tuple.push(value.clone());
                    continue;
                }
                match source.read().await {
                    Element::Item(value) => {
                        if sticky.contains(&slot) {
                            replay.insert(slot, value.clone());
                        }
                        tuple.push(value);
                    }
                    Element::Stop => {
                        stopped = true;
                        break;
                    }
                }
            }
            if stopped {
                let _ = tx.send(None);
                return;
            }
            if each.is_empty() {
                if tx.send(Some(tuple)).is_err() {
                    return;
                }
            } else {
                let lists: Vec<Vec<Value>> = each.iter().map(|&i| tuple[i].iter_items()).collect();
                for combination in lists.into_iter().multi_cartesian_product() {
                    let mut expanded = tuple.clone();
                    for (&slot, value) in each.iter().zip(combination) {
                        expanded[slot] = value;
                    }
                    if tx.send(Some(expanded)).is_err() {
                        return;
                    }
                }
            }
            if !has_queue {
                let _ = tx.send(None);
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::channel::channel;

    #[test]
    fn template_renders_known_names() {
        let context = BTreeMap::from([
            ("x".to_owned(), Value::Int(42)),
            ("name".to_owned(), Value::from("world")),
        ]);
        let template = ScriptTemplate::new("echo $x and ${name}; price: $$5");
        assert_eq!(
            template.render("p", &context).unwrap(),
            "echo 42 and world; price: $5"
        );
    }

    #[test]
    fn template_rejects_unknown_names() {
        let template = ScriptTemplate::new("echo $missing");
        assert!(matches!(
            template.render("p", &BTreeMap::new()),
            Err(EngineError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn template_leaves_bare_dollars_alone() {
        let template = ScriptTemplate::new("echo $? $ 1");
        assert_eq!(template.render("p", &BTreeMap::new()).unwrap(), "echo $? $ 1");
    }

    #[tokio::test]
    async fn driver_emits_tuples_then_pill() {
        let (tx, rx) = channel();
        tx.send(Value::Int(1));
        tx.send(Value::Int(2));
        tx.close();
        let mut tuples = spawn_tuple_driver(
            vec![InputSource::Queue(rx), InputSource::of(9)],
            vec![],
            vec![],
        );
        assert_eq!(
            tuples.recv().await,
            Some(Some(vec![Value::Int(1), Value::Int(9)]))
        );
        assert_eq!(
            tuples.recv().await,
            Some(Some(vec![Value::Int(2), Value::Int(9)]))
        );
        assert_eq!(tuples.recv().await, Some(None));
    }

    #[tokio::test]
    async fn driver_expands_each_in_declared_order() {
        let mut tuples = spawn_tuple_driver(
            vec![
                InputSource::of(vec![Value::Int(1), Value::Int(2)]),
                InputSource::of(vec![Value::from("x"), Value::from("y")]),
                InputSource::of(9),
            ],
            vec![0, 1],
            vec![],
        );
        let mut seen = Vec::new();
        while let Some(Some(tuple)) = tuples.recv().await {
            seen.push(tuple);
        }
        assert_eq!(
            seen,
            vec![
                vec![Value::Int(1), Value::from("x"), Value::Int(9)],
                vec![Value::Int(1), Value::from("y"), Value::Int(9)],
                vec![Value::Int(2), Value::from("x"), Value::Int(9)],
                vec![Value::Int(2), Value::from("y"), Value::Int(9)],
            ]
        );
    }

    #[tokio::test]
    async fn driver_replays_sticky_positions() {
        let (shared_tx, shared_rx) = channel();
        let (tx, rx) = channel();
        shared_tx.send(Value::Int(7));
        shared_tx.send(Value::Int(8)); // never read: sticky replays the first
        tx.send(Value::from("a"));
        tx.send(Value::from("b"));
        tx.close();
        let mut tuples = spawn_tuple_driver(
            vec![InputSource::Queue(shared_rx), InputSource::Queue(rx)],
            vec![],
            vec![0],
        );
        assert_eq!(
            tuples.recv().await,
            Some(Some(vec![Value::Int(7), Value::from("a")]))
        );
        assert_eq!(
            tuples.recv().await,
            Some(Some(vec![Value::Int(7), Value::from("b")]))
        );
        assert_eq!(tuples.recv().await, Some(None));
    }

    #[tokio::test]
    async fn all_value_inputs_fire_once() {
        let mut tuples =
            spawn_tuple_driver(vec![InputSource::of(1), InputSource::of(2)], vec![], vec![]);
        assert_eq!(
            tuples.recv().await,
            Some(Some(vec![Value::Int(1), Value::Int(2)]))
        );
        assert_eq!(tuples.recv().await, Some(None));
    }
}
