#![deny(clippy::all)]
//! On-disk index of completed task runs, keyed by content hash.
//!
//! Each successful run records one JSON metadata file under the index
//! directory. A resumed run looks its hash up here and, on a hit, rehydrates
//! outputs from the recorded work directory instead of resubmitting.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache index io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cache metadata for {hash}: {source}")]
    InvalidMetadata {
        hash: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What a prior successful run recorded for one task hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub work_dir: Utf8PathBuf,
    pub exit_status: i32,
}

pub struct CacheIndex {
    index_dir: Utf8PathBuf,
}

impl CacheIndex {
    pub fn new(index_dir: &Utf8Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(index_dir)?;
        Ok(Self {
            index_dir: index_dir.to_owned(),
        })
    }

    fn entry_path(&self, hash: &str) -> Utf8PathBuf {
        self.index_dir.join(format!("{hash}.json"))
    }

    /// Look a hash up. A missing record is a miss; a corrupt record is an
    /// error the caller downgrades to a miss.
    #[tracing::instrument(skip_all, fields(hash))]
    pub fn lookup(&self, hash: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(hash);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("cache miss for {hash}");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let entry = serde_json::from_str(&raw).map_err(|source| CacheError::InvalidMetadata {
            hash: hash.to_owned(),
            source,
        })?;
        Ok(Some(entry))
    }

    /// Record a completed run. Written to a temp file and renamed so
    /// concurrent readers never observe a partial record.
    #[tracing::instrument(skip_all)]
    pub fn record(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let raw = serde_json::to_string(entry).map_err(|source| CacheError::InvalidMetadata {
            hash: entry.hash.clone(),
            source,
        })?;
        let tmp = self
            .index_dir
            .join(format!(".{}.json.{}.tmp", entry.hash, std::process::id()));
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, self.entry_path(&entry.hash))?;
        Ok(())
    }

    /// Drop a record, e.g. after rejecting a stale hit.
    pub fn evict(&self, hash: &str) -> Result<(), CacheError> {
        match std::fs::remove_file(self.entry_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
