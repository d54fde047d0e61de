//! Run session: identity, work-directory allocation, backend registry and
//! teardown.
//!
//! The session id is part of every cache key, so a resumed run must be
//! built with the prior run's id to see its cache entries.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use rill_cache::CacheIndex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    backend::{
        grid::{GridBackend, SlurmScheduler},
        local::LocalBackend,
        native::NativeBackend,
        ExecutorBackend,
    },
    dispatcher::TaskDispatcher,
    error::EngineError,
};

pub struct Session {
    id: Uuid,
    work_root: Utf8PathBuf,
    resume: bool,
    dispatcher: Arc<TaskDispatcher>,
    cache: CacheIndex,
    backends: Mutex<HashMap<&'static str, Arc<dyn ExecutorBackend>>>,
    fatal: Mutex<Option<String>>,
}

pub struct SessionBuilder {
    work_root: Utf8PathBuf,
    id: Option<Uuid>,
    resume: bool,
}

impl SessionBuilder {
    pub fn new(work_root: impl AsRef<Utf8Path>) -> Self {
        Self {
            work_root: work_root.as_ref().to_owned(),
            id: None,
            resume: false,
        }
    }

    /// Reuse a prior run's id; required for cache hits on resume.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn build(self) -> Result<Arc<Session>, EngineError> {
        std::fs::create_dir_all(&self.work_root)?;
        let cache = CacheIndex::new(&self.work_root.join(".rill").join("cache"))?;
        let session = Session {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            work_root: self.work_root,
            resume: self.resume,
            dispatcher: Arc::new(TaskDispatcher::new()),
            cache,
            backends: Mutex::new(HashMap::new()),
            fatal: Mutex::new(None),
        };
        session.register_backend(Arc::new(LocalBackend::with_defaults()));
        session.register_backend(Arc::new(GridBackend::new(SlurmScheduler)));
        session.register_backend(Arc::new(NativeBackend::new(4)));
        session.dispatcher.start();
        debug!("session {} started at {}", session.id, session.work_root);
        Ok(Arc::new(session))
    }
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn id_str(&self) -> String {
        self.id.to_string()
    }

    pub fn work_root(&self) -> &Utf8Path {
        &self.work_root
    }

    pub fn resume(&self) -> bool {
        self.resume
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn cache(&self) -> &CacheIndex {
        &self.cache
    }

    pub fn register_backend(&self, backend: Arc<dyn ExecutorBackend>) {
        self.backends
            .lock()
            .expect("backend registry lock poisoned")
            .insert(backend.name(), backend);
    }

    pub fn backend(&self, name: &str) -> Result<Arc<dyn ExecutorBackend>, EngineError> {
        self.backends
            .lock()
            .expect("backend registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("unknown executor '{name}'")))
    }

    /// Allocate a fresh work directory: hash-addressed two-level layout, or
    /// a random one when caching is disabled. Directories are claimed with
    /// an atomic create, so a name is never handed out twice.
    pub fn allocate_work_dir(&self, hash: Option<&str>) -> Result<Utf8PathBuf, EngineError> {
        let base = match hash {
            Some(hash) if hash.len() > 2 => self.work_root.join(&hash[..2]).join(&hash[2..]),
            _ => {
                let salt: String = rand::thread_rng()
                    .sample_iter(rand::distributions::Alphanumeric)
                    .take(12)
                    .map(|c| (c as char).to_ascii_lowercase())
                    .collect();
                self.work_root.join("uncached").join(salt)
            }
        };
        if let Some(parent) = base.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut candidate = base.clone();
        let mut attempt = 1;
        loop {
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    candidate = Utf8PathBuf::from(format!("{base}_{attempt}"));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record the first fatal error of the run.
    pub fn record_fatal(&self, error: &EngineError) {
        let mut guard = self.fatal.lock().expect("fatal lock poisoned");
        if guard.is_none() {
            *guard = Some(error.to_string());
        }
    }

    pub fn first_error(&self) -> Option<String> {
        self.fatal.lock().expect("fatal lock poisoned").clone()
    }

    /// Stop all monitors, killing queued and in-flight handlers. Latched
    /// callers are released with a session-terminated error.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
