//! Fold operator: many firings, one submission.
//!
//! Every inbound tuple is resolved like a regular firing, but instead of
//! submitting, its rendered command is appended to a running script buffer
//! as a marked section, its files join the accumulated staging map and its
//! sub-hash joins an ordered list. The poison pill folds the list into the
//! merge hash and submits the single combined task.

use std::{collections::BTreeMap, fmt::Write as _, sync::Arc};

use rill_hash::fold_digests;
use tracing::{debug, warn};

use super::{spawn_tuple_driver, ProcessBody, ProcessDef, ProcessorCore, StateAccumulator, TaskSetup};
use crate::{
    config::ProcessConfig,
    error::EngineError,
    path_trie::PathTrie,
    session::Session,
    stage::{FileHolder, NameRegistry},
    value::Value,
    wrapper,
};

pub struct MergeProcessor {
    core: Arc<ProcessorCore>,
    join: tokio::task::JoinHandle<()>,
}

/// One collected firing, ready to splice into the merged script.
struct MergePart {
    section: String,
    aux_files: Vec<(String, String)>,
    files: Vec<FileHolder>,
    sub_hash: Option<String>,
    context: BTreeMap<String, Value>,
}

impl MergeProcessor {
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
        if !matches!(body, ProcessBody::Script(_)) {
            return Err(EngineError::Validation(format!(
                "merge process '{name}' requires a script body"
            )));
        }
        let mut specs = Vec::with_capacity(inputs.len());
        let mut sources = Vec::with_capacity(inputs.len());
        for input in inputs {
            let (spec, source) = input.split();
            specs.push(spec);
            sources.push(source);
        }
        if specs.iter().any(|s| s.is_each()) {
            return Err(EngineError::Validation(format!(
                "merge process '{name}' cannot declare 'each' inputs"
            )));
        }
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
        let tuples = spawn_tuple_driver(sources, Vec::new(), sticky);
        let join = tokio::spawn(run(core.clone(), tuples));
        Ok(Self { core, join })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> Arc<StateAccumulator> {
        self.core.state.clone()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

async fn run(
    core: Arc<ProcessorCore>,
    mut tuples: tokio::sync::mpsc::UnboundedReceiver<Option<Vec<Value>>>,
) {
    let mut registry = NameRegistry::new();
    let mut sections = Vec::new();
    let mut aux_files = Vec::new();
    let mut holders = Vec::new();
    let mut sub_hashes = Vec::new();
    let mut merged_context = BTreeMap::new();
    let mut count = 0u64;

    while let Some(Some(tuple)) = tuples.recv().await {
        if core.is_fatal() {
            break;
        }
        count += 1;
        match core.collect_firing(count, &tuple, &mut registry) {
            Ok(part) => {
                sections.push(part.section);
                aux_files.extend(part.aux_files);
                holders.extend(part.files);
                if let Some(sub_hash) = part.sub_hash {
                    sub_hashes.push(sub_hash);
                }
                merged_context.extend(part.context);
            }
            Err(e) => {
                warn!("merge process '{}': firing {count} failed: {e}", core.name);
                let _ = core.handle_failure(None, e).await;
            }
        }
    }
    core.state.poison();

    if sections.is_empty() {
        warn!(
            "merge process '{}' terminated without collecting any firings",
            core.name
        );
        core.bind_shared_outputs();
        core.close_outputs();
        return;
    }
    if core.is_fatal() {
        core.close_outputs();
        return;
    }

    // The merge hash folds the sorted per-firing sub-hashes, so completion
    // order of upstream processes cannot perturb it.
    let hash =
        (!sub_hashes.is_empty()).then(|| fold_digests(&core.session.id_str(), &sub_hashes));
    let task_name = format!("{} (merge)", core.name);

    if core.session.resume() {
        if let Some(hash) = &hash {
            if let Some((entry, values)) = core.try_rehydrate(hash, &merged_context) {
                debug!("task '{task_name}' restored from cache at {}", entry.work_dir);
                core.bind_outputs(&values);
                core.emit_cached(&task_name, 1, &entry.work_dir);
                core.bind_shared_outputs();
                core.close_outputs();
                return;
            }
        }
    }

    let setup = TaskSetup {
        context: merged_context,
        env: Vec::new(),
        stdin: None,
        files: holders,
        hash_entries: Vec::new(),
    };
    let outcome = build_and_submit(&core, task_name, hash, sections, aux_files, setup).await;
    if let Err(e) = outcome {
        warn!("merge process '{}' failed to submit: {e}", core.name);
        let _ = core.handle_failure(None, e).await;
    }
    core.state.quiesce().await;
    core.bind_shared_outputs();
    core.close_outputs();
}

async fn build_and_submit(
    core: &Arc<ProcessorCore>,
    task_name: String,
    hash: Option<String>,
    sections: Vec<String>,
    aux_files: Vec<(String, String)>,
    setup: TaskSetup,
) -> Result<(), EngineError> {
    let script = sections.concat();
    let mut task = core.build_task(1, 1, task_name, hash, Some(script), setup)?;
    {
        let task = Arc::get_mut(&mut task).expect("freshly built task is unshared");
        task.aux_files = aux_files;
        // Container invocations live inside the sections; the outer wrapper
        // must not wrap the whole fold again.
        task.container = None;
    }
    core.state.record_fired();
    core.submit_task(task).await
}

impl ProcessorCore {
    /// Resolve one tuple and turn it into a script section instead of a
    /// submission.
    fn collect_firing(
        &self,
        index: u64,
        tuple: &[Value],
        registry: &mut NameRegistry,
    ) -> Result<MergePart, EngineError> {
        let setup = self.setup_task(index, tuple, registry)?;
        let command = self
            .render_script(&setup.context)?
            .expect("merge body is validated to be a script");
        let sub_hash = self.compute_hash(&setup, Some(&command))?;

        let mut section = format!("# rill merge section {index}\n");
        let mut aux_files = Vec::new();
        let containerized = self.config.container.is_some();
        if containerized {
            let mut env_text = String::new();
            for (key, value) in &setup.env {
                let _ = writeln!(env_text, "{key}={value}");
            }
            aux_files.push((format!(".command.env.{index}"), env_text));
        } else {
            for (key, value) in &setup.env {
                let _ = writeln!(section, "export {key}=\"{}\"", wrapper::escape(value));
            }
        }

        let command_file = format!(".command.cmd.{index}");
        let mut body = command;
        if !body.ends_with('\n') {
            body.push('\n');
        }
        aux_files.push((command_file.clone(), body));

        let mut line = if let Some(image) = &self.config.container {
            let mut mounts = PathTrie::new();
            for holder in &setup.files {
                if let Some(parent) = holder.source_path.parent() {
                    mounts.insert(parent);
                }
            }
            let mut line = String::from("docker run --rm");
            for prefix in mounts.prefixes() {
                let _ = write!(line, " -v \"{prefix}:{prefix}\"");
            }
            let _ = write!(
                line,
                " -v \"$PWD:$PWD\" -w \"$PWD\" --env-file .command.env.{index} {image} /bin/bash \
                 {command_file}"
            );
            line
        } else {
            format!("/bin/bash {command_file}")
        };
        if let Some(stdin) = &setup.stdin {
            let stdin_file = format!(".command.in.{index}");
            aux_files.push((stdin_file.clone(), stdin.clone()));
            let _ = write!(line, " < {stdin_file}");
        }
        section.push_str(&line);
        section.push('\n');

        Ok(MergePart {
            section,
            aux_files,
            files: setup.files,
            sub_hash,
            context: setup.context,
        })
    }
}
