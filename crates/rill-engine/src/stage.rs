//! Input file staging.
//!
//! Raw channel values are normalized into [`FileHolder`]s, then the declared
//! pattern is expanded against the number of items to assign each holder a
//! collision-free `stored_name` inside the task work directory.

use std::collections::HashSet;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging conflict: stored name '{0}' assigned twice")]
    StagingConflict(String),
    #[error("input pattern '{0}' may not contain path separators")]
    InvalidPattern(String),
    #[error("pattern '{pattern}' expects exactly one file, got {count}")]
    CardinalityMismatch { pattern: String, count: usize },
    #[error("single-character pattern '{pattern}' cannot enumerate {count} items")]
    PatternOverflow { pattern: String, count: usize },
    #[error("cannot stage value '{0}' as a file")]
    NotAFile(String),
    #[error("input file does not exist: {0}")]
    MissingSource(Utf8PathBuf),
}

impl StagingError {
    /// Missing network paths are worth a retry; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StagingError::MissingSource(path) => is_remote_path(path.as_str()),
            _ => false,
        }
    }
}

pub fn is_remote_path(raw: &str) -> bool {
    ["http://", "https://", "ftp://", "s3://"]
        .iter()
        .any(|scheme| raw.starts_with(scheme))
}

/// A file to stage: `source_path` is linked under `stored_name` in the work
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHolder {
    pub source_path: Utf8PathBuf,
    pub stored_name: String,
}

/// Tracks stored names already claimed for one task, and the running
/// wildcard counter. Parallel firings use a fresh registry per firing; a
/// merge task keeps one registry across all accumulated firings so names
/// stay distinct in the single shared work directory.
#[derive(Debug, Default)]
pub struct NameRegistry {
    used: HashSet<String>,
    counter: u64,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&mut self, name: &str) -> Result<(), StagingError> {
        if !self.used.insert(name.to_owned()) {
            return Err(StagingError::StagingConflict(name.to_owned()));
        }
        Ok(())
    }

    fn next_index(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

/// Wrap a raw input value into file holders. Strings and paths become single
/// holders named after their file name component; lists flatten element-wise.
pub fn normalize(value: &Value) -> Result<Vec<FileHolder>, StagingError> {
    match value {
        Value::Path(path) => Ok(vec![holder_for(path.clone())]),
        Value::Str(raw) => Ok(vec![holder_for(Utf8PathBuf::from(raw))]),
        Value::List(items) => {
            let mut holders = Vec::with_capacity(items.len());
            for item in items {
                holders.extend(normalize(item)?);
            }
            Ok(holders)
        }
        other => Err(StagingError::NotAFile(other.to_string())),
    }
}

fn holder_for(source_path: Utf8PathBuf) -> FileHolder {
    let stored_name = source_path
        .file_name()
        .unwrap_or(source_path.as_str())
        .to_owned();
    FileHolder {
        source_path,
        stored_name,
    }
}

/// Expand a staging pattern over normalized holders.
///
/// * `*` anywhere in the pattern enumerates `file1`, `file2`, … in place of
///   the wildcard, so `*.fa` over one file stages as `file1.fa`.
/// * `?` enumerates a single-character counter, `1.txt`, `2.txt`, …
/// * a literal pattern requires exactly one file and names it verbatim.
pub fn expand_pattern(
    pattern: &str,
    mut holders: Vec<FileHolder>,
    registry: &mut NameRegistry,
) -> Result<Vec<FileHolder>, StagingError> {
    if pattern.contains('/') {
        return Err(StagingError::InvalidPattern(pattern.to_owned()));
    }
    if pattern.contains('*') {
        for holder in &mut holders {
            let index = registry.next_index();
            holder.stored_name = pattern.replacen('*', &format!("file{index}"), 1);
        }
    } else if pattern.contains('?') {
        for holder in &mut holders {
            let index = registry.next_index();
            if index > 9 {
                return Err(StagingError::PatternOverflow {
                    pattern: pattern.to_owned(),
                    count: holders.len(),
                });
            }
            holder.stored_name = pattern.replacen('?', &index.to_string(), 1);
        }
    } else {
        if holders.len() != 1 {
            return Err(StagingError::CardinalityMismatch {
                pattern: pattern.to_owned(),
                count: holders.len(),
            });
        }
        holders[0].stored_name = pattern.to_owned();
    }
    for holder in &holders {
        registry.claim(&holder.stored_name)?;
    }
    Ok(holders)
}
