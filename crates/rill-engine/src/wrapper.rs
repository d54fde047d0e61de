//! Shell wrapper generation.
//!
//! Every submitted task executes through a generated `.command.sh`: export
//! declared environment, stage inputs under their relative names, run the
//! user command (container-wrapped when configured), capture the exit code
//! to `.exitcode` and merge stdout+stderr into `.command.out`. The text is
//! deterministic for a given task, so it never perturbs the cache key.

use std::fmt::Write as _;

use crate::{
    backend::ExecutorBackend,
    error::EngineError,
    path_trie::PathTrie,
    task::{ENV_FILE, LAUNCHER_FILE, OUT_FILE, STDIN_FILE, TaskRun},
};

/// Generated wrapper text plus the side files it relies on.
#[derive(Debug, PartialEq, Eq)]
pub struct WrapperBuild {
    pub wrapper: String,
    /// User script run through an explicit interpreter; present when the
    /// script carries a shebang or the task is containerized.
    pub launcher: Option<String>,
    /// `KEY=VALUE` lines for container runs.
    pub env_file: Option<String>,
}

pub fn build(task: &TaskRun, backend: &dyn ExecutorBackend) -> WrapperBuild {
    let staged = task.staged();
    let containerized = task.container.is_some();
    let interpreter = task.interpreter().unwrap_or("/bin/bash").to_owned();
    let needs_launcher = containerized || task.interpreter().is_some();

    let mut wrapper = String::new();
    wrapper.push_str("#!/bin/bash\n");
    let _ = writeln!(wrapper, "# rill wrapper for task '{}'", task.name);
    wrapper.push_str("set -u\n");
    let _ = writeln!(wrapper, "cd \"{}\"", task.work_dir);

    if !containerized {
        for (key, value) in &task.env {
            let _ = writeln!(wrapper, "export {key}=\"{}\"", escape(value));
        }
    }

    let stage_in = backend.staging_files_script(&staged);
    if !stage_in.is_empty() {
        wrapper.push_str("# stage inputs\n");
        wrapper.push_str(&stage_in);
    }

    let redirect = redirection(task);
    if let Some(image) = &task.container {
        let mut mounts = PathTrie::new();
        for holder in &staged {
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
            " -v \"{dir}:{dir}\" -w \"{dir}\" --env-file {ENV_FILE} {image} {interpreter} \
             {LAUNCHER_FILE}{redirect}",
            dir = task.work_dir
        );
        wrapper.push_str(&line);
        wrapper.push('\n');
    } else if needs_launcher {
        let _ = writeln!(wrapper, "{interpreter} {LAUNCHER_FILE}{redirect}");
    } else {
        wrapper.push_str("(\n");
        let body = task.script_body().unwrap_or_default();
        wrapper.push_str(body);
        if !body.ends_with('\n') {
            wrapper.push('\n');
        }
        let _ = writeln!(wrapper, "){redirect}");
    }

    wrapper.push_str("echo $? > .exitcode\n");
    let unstage = backend.unstage_outputs_script(task);
    if !unstage.is_empty() {
        wrapper.push_str(&unstage);
    }

    let launcher = needs_launcher.then(|| {
        // Keep the shebang: the file also runs standalone for debugging.
        task.script.clone().unwrap_or_default()
    });
    let env_file = containerized.then(|| {
        let mut text = String::new();
        for (key, value) in &task.env {
            let _ = writeln!(text, "{key}={value}");
        }
        text
    });

    WrapperBuild {
        wrapper,
        launcher,
        env_file,
    }
}

/// Write the wrapper and its side files into the task work directory.
pub fn write_task_files(task: &TaskRun, backend: &dyn ExecutorBackend) -> Result<(), EngineError> {
    std::fs::create_dir_all(&task.work_dir)?;
    let built = build(task, backend);
    if let Some(stdin) = &task.stdin {
        std::fs::write(task.stdin_file(), stdin)?;
    }
    for (name, contents) in &task.aux_files {
        std::fs::write(task.work_dir.join(name), contents)?;
    }
    if let Some(launcher) = &built.launcher {
        std::fs::write(task.launcher_file(), launcher)?;
    }
    if let Some(env_file) = &built.env_file {
        std::fs::write(task.env_file(), env_file)?;
    }
    std::fs::write(task.wrapper_file(), built.wrapper)?;
    Ok(())
}

fn redirection(task: &TaskRun) -> String {
    let mut redirect = format!(" > {OUT_FILE} 2>&1");
    if task.stdin.is_some() {
        let _ = write!(redirect, " < {STDIN_FILE}");
    }
    redirect
}

pub(crate) fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
