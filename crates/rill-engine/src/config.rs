//! Per-process execution configuration.
//!
//! Deserialized from the `process.*` scope of a run configuration. Unknown
//! keys are rejected at load time so typos surface before any task fires.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Deserializer};

use crate::error::ErrorStrategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ProcessConfig {
    /// Backend name: `local`, `slurm`, `native`, or a registered custom one.
    pub executor: String,
    /// Per-process parallelism cap. Defaults to the backend's pool size.
    pub max_forks: Option<usize>,
    /// Per-task walltime, e.g. `"30m"`.
    #[serde(deserialize_with = "duration_opt")]
    pub max_duration: Option<Duration>,
    /// Container image; switches env handling to an env file and adds mounts.
    pub container: Option<String>,
    /// Appended verbatim to the grid submit command line.
    pub cluster_options: Option<String>,
    /// Grid queue / partition name.
    pub queue: Option<String>,
    pub cache: CacheMode,
    /// Skip execution entirely when the declared outputs already exist here.
    pub store_dir: Option<Utf8PathBuf>,
    pub error_strategy: ErrorStrategyConfig,
    /// Attempt cap for `errorStrategy = "retry"`.
    pub max_retries: u32,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executor: "local".to_owned(),
            max_forks: None,
            max_duration: None,
            container: None,
            cluster_options: None,
            queue: None,
            cache: CacheMode::Standard,
            store_dir: None,
            error_strategy: ErrorStrategyConfig::Terminate,
            max_retries: 1,
        }
    }
}

impl ProcessConfig {
    pub fn strategy(&self) -> ErrorStrategy {
        match self.error_strategy {
            ErrorStrategyConfig::Terminate => ErrorStrategy::Terminate,
            ErrorStrategyConfig::Ignore => ErrorStrategy::Ignore,
            ErrorStrategyConfig::Retry => ErrorStrategy::Retry {
                max_retries: self.max_retries,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategyConfig {
    Terminate,
    Ignore,
    Retry,
}

/// Hash mode selection; `false` disables caching altogether.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Standard,
    Deep,
    Lenient,
    Disabled,
}

impl CacheMode {
    pub fn hash_mode(&self) -> Option<rill_hash::HashMode> {
        match self {
            CacheMode::Standard => Some(rill_hash::HashMode::Standard),
            CacheMode::Deep => Some(rill_hash::HashMode::Deep),
            CacheMode::Lenient => Some(rill_hash::HashMode::Lenient),
            CacheMode::Disabled => None,
        }
    }
}

impl<'de> Deserialize<'de> for CacheMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(CacheMode::Standard),
            Raw::Flag(false) => Ok(CacheMode::Disabled),
            Raw::Name(name) => match name.as_str() {
                "standard" => Ok(CacheMode::Standard),
                "deep" => Ok(CacheMode::Deep),
                "lenient" => Ok(CacheMode::Lenient),
                other => Err(serde::de::Error::custom(format!(
                    "unknown cache mode '{other}'"
                ))),
            },
        }
    }
}

fn duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}
