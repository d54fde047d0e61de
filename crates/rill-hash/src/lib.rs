#![deny(clippy::all)]
//! Content hashing for task cache keys.
//!
//! A task's cache key is a digest over an ordered sequence of keyed entries:
//! the session id, the rendered script, and every resolved input in declared
//! order. Files contribute according to the selected [`HashMode`], so the same
//! inputs produce the same key across runs and any changed byte produces a
//! different one.

use std::{fs, io::Read, time::UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to hash {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("non UTF-8 path under {0}")]
    NonUtf8Path(Utf8PathBuf),
}

/// How file inputs contribute to the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// Hash file contents. Directories contribute metadata only.
    Standard,
    /// Like `Standard`, but directories are recursed and every contained
    /// file's contents are hashed.
    Deep,
    /// Hash path, size and mtime. Cheap, but misses same-size in-place edits.
    Lenient,
}

/// A value that can be fed to a [`HashKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum HashInput {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Path(Utf8PathBuf),
    List(Vec<HashInput>),
}

// One tag byte per variant keeps Int(1) and Str("1") from colliding.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_PATH: u8 = 5;
const TAG_LIST: u8 = 6;

/// Incremental hasher over keyed entries.
///
/// Entries are order-sensitive: `push("a", x); push("b", y)` and the reverse
/// produce different digests.
pub struct HashKey {
    mode: HashMode,
    hasher: Sha256,
}

impl HashKey {
    pub fn new(mode: HashMode) -> Self {
        Self {
            mode,
            hasher: Sha256::new(),
        }
    }

    pub fn mode(&self) -> HashMode {
        self.mode
    }

    /// Feed one keyed entry. The name is length-framed so consecutive
    /// entries cannot run into each other.
    pub fn push(&mut self, name: &str, value: &HashInput) -> Result<(), HashError> {
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.feed(value)
    }

    fn feed(&mut self, value: &HashInput) -> Result<(), HashError> {
        match value {
            HashInput::Null => self.hasher.update([TAG_NULL]),
            HashInput::Bool(b) => self.hasher.update([TAG_BOOL, *b as u8]),
            HashInput::Int(i) => {
                self.hasher.update([TAG_INT]);
                self.hasher.update(i.to_le_bytes());
            }
            HashInput::Float(f) => {
                self.hasher.update([TAG_FLOAT]);
                self.hasher.update(f.to_le_bytes());
            }
            HashInput::Str(s) => {
                self.hasher.update([TAG_STR]);
                self.hasher.update((s.len() as u64).to_le_bytes());
                self.hasher.update(s.as_bytes());
            }
            HashInput::Path(p) => {
                self.hasher.update([TAG_PATH]);
                self.feed_path(p)?;
            }
            HashInput::List(items) => {
                self.hasher.update([TAG_LIST]);
                self.hasher.update((items.len() as u64).to_le_bytes());
                for item in items {
                    self.feed(item)?;
                }
            }
        }
        Ok(())
    }

    fn feed_path(&mut self, path: &Utf8Path) -> Result<(), HashError> {
        let meta = fs::metadata(path).map_err(|source| HashError::Io {
            path: path.to_owned(),
            source,
        })?;
        match self.mode {
            HashMode::Lenient => self.feed_attributes(path, &meta)?,
            HashMode::Standard => {
                if meta.is_dir() {
                    self.feed_attributes(path, &meta)?;
                } else {
                    self.feed_contents(path)?;
                }
            }
            HashMode::Deep => {
                if meta.is_dir() {
                    self.feed_tree(path)?;
                } else {
                    self.feed_contents(path)?;
                }
            }
        }
        Ok(())
    }

    fn feed_attributes(&mut self, path: &Utf8Path, meta: &fs::Metadata) -> Result<(), HashError> {
        self.hasher.update(path.as_str().as_bytes());
        self.hasher.update(meta.len().to_le_bytes());
        let mtime = meta
            .modified()
            .map_err(|source| HashError::Io {
                path: path.to_owned(),
                source,
            })?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.hasher.update(mtime.as_secs().to_le_bytes());
        self.hasher.update(mtime.subsec_nanos().to_le_bytes());
        Ok(())
    }

    fn feed_contents(&mut self, path: &Utf8Path) -> Result<(), HashError> {
        let wrap = |source| HashError::Io {
            path: path.to_owned(),
            source,
        };
        let mut file = fs::File::open(path).map_err(wrap)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(wrap)?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buf[..n]);
        }
        Ok(())
    }

    // Sorted walk so directory iteration order cannot leak into the digest.
    fn feed_tree(&mut self, root: &Utf8Path) -> Result<(), HashError> {
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| HashError::Io {
                path: root.to_owned(),
                source: e.into(),
            })?;
            let path = Utf8Path::from_path(entry.path())
                .ok_or_else(|| HashError::NonUtf8Path(root.to_owned()))?;
            let relative = path.strip_prefix(root).unwrap_or(path);
            self.hasher.update((relative.as_str().len() as u64).to_le_bytes());
            self.hasher.update(relative.as_str().as_bytes());
            if entry.file_type().is_file() {
                self.feed_contents(path)?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Fold per-firing digests into a single merge digest.
///
/// The digests are sorted before folding, so the result is independent of
/// firing completion order.
pub fn fold_digests(session_id: &str, digests: &[String]) -> String {
    let mut sorted: Vec<&str> = digests.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update((session_id.len() as u64).to_le_bytes());
    hasher.update(session_id.as_bytes());
    for digest in sorted {
        hasher.update(digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}
