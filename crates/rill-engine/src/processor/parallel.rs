//! Per-message firing operator.
//!
//! Each inbound tuple becomes one task firing, run concurrently up to the
//! process's fork cap. `each` inputs are expanded by the upstream tuple
//! driver, so this operator always sees one value per position. On the
//! poison pill it drains in-flight firings, binds shared outputs once, and
//! forwards the pill.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{spawn_tuple_driver, ProcessDef, ProcessorCore, StateAccumulator};
use crate::{
    config::ProcessConfig, error::EngineError, session::Session, stage::NameRegistry, value::Value,
};

pub struct ParallelProcessor {
    core: Arc<ProcessorCore>,
    join: tokio::task::JoinHandle<()>,
}

impl ParallelProcessor {
    pub fn spawn(
        session: &Arc<Session>,
        def: ProcessDef,
        config: ProcessConfig,
    ) -> Result<Self, EngineError> {
        let ProcessDef {
            name,
            inputs,
            outputs,
            body,
        } = def;
        let mut specs = Vec::with_capacity(inputs.len());
        let mut sources = Vec::with_capacity(inputs.len());
        for input in inputs {
            let (spec, source) = input.split();
            specs.push(spec);
            sources.push(source);
        }
        let each: Vec<usize> = specs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_each())
            .map(|(i, _)| i)
            .collect();
        let sticky: Vec<usize> = specs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_shared())
            .map(|(i, _)| i)
            .collect();
        let core = Arc::new(ProcessorCore::new(
            session.clone(),
            name,
            specs,
            outputs,
            body,
            config,
        )?);
        let tuples = spawn_tuple_driver(sources, each, sticky);
        let join = tokio::spawn(run(core.clone(), tuples));
        Ok(Self { core, join })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> Arc<StateAccumulator> {
        self.core.state.clone()
    }

    /// Wait until the operator has stopped and its outputs are closed.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

async fn run(
    core: Arc<ProcessorCore>,
    mut tuples: tokio::sync::mpsc::UnboundedReceiver<Option<Vec<Value>>>,
) {
    let semaphore = Arc::new(Semaphore::new(core.max_forks()));
    let mut index = 0u64;
    while let Some(Some(tuple)) = tuples.recv().await {
        if core.is_fatal() {
            break;
        }
        // Firing index is assigned in message-arrival order, before any
        // concurrency.
        index += 1;
        core.state.record_fired();
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("firing semaphore closed while the operator is live");
        let core = core.clone();
        tokio::spawn(async move {
            core.fire(index, tuple).await;
            drop(permit);
        });
    }
    debug!("process '{}' drained, waiting for in-flight firings", core.name);
    core.state.poison();
    core.state.quiesce().await;
    // Bind shared outputs first, then forward the pill.
    core.bind_shared_outputs();
    core.close_outputs();
}

impl ProcessorCore {
    pub(super) async fn fire(self: Arc<Self>, index: u64, tuple: Vec<Value>) {
        if let Err(e) = self.fire_inner(index, tuple).await {
            warn!("firing {index} of process '{}' failed: {e}", self.name);
            let _ = self.handle_failure(None, e).await;
        }
    }

    async fn fire_inner(self: &Arc<Self>, index: u64, tuple: Vec<Value>) -> Result<(), EngineError> {
        let task_name = format!("{} ({index})", self.name);
        let mut registry = NameRegistry::new();
        let setup = self.setup_task(index, &tuple, &mut registry)?;
        let script = self.render_script(&setup.context)?;

        // Stored outputs short-circuit both execution and hashing.
        if let Some(store_dir) = self.config.store_dir.clone() {
            if let Some(values) = self.try_stored(&setup.context) {
                debug!("task '{task_name}' satisfied from store dir {store_dir}");
                self.bind_outputs(&values);
                self.emit_cached(&task_name, index, &store_dir);
                self.state.settle_cached();
                return Ok(());
            }
        }

        let hash = self.compute_hash(&setup, script.as_deref())?;
        if self.session.resume() {
            if let Some(hash) = &hash {
                if let Some((entry, values)) = self.try_rehydrate(hash, &setup.context) {
                    debug!("task '{task_name}' restored from cache at {}", entry.work_dir);
                    self.bind_outputs(&values);
                    self.emit_cached(&task_name, index, &entry.work_dir);
                    self.state.settle_cached();
                    return Ok(());
                }
            }
        }

        let task = self.build_task(index, index, task_name, hash, script, setup)?;
        self.submit_task(task).await
    }
}
