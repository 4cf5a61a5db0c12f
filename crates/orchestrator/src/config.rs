#![forbid(unsafe_code)]

use crate::retry::RetryPolicy;
use bf_core::manifest::DEFAULT_PIPELINE_VERSION;
use bf_core::{DEFAULT_STAGE_COUNT, OutOfOrderPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    DryRun,
    Command,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub timeout_s: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::DryRun,
            program: None,
            args: Vec::new(),
            timeout_s: 60,
        }
    }
}

/// Everything an invocation needs besides its input message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub storage_dir: PathBuf,
    pub object_store_root: PathBuf,
    pub container_reference: String,
    pub input_prefix: String,
    pub input_extension: String,
    pub results_prefix: String,
    pub stage_count: u8,
    pub out_of_order_policy: OutOfOrderPolicy,
    pub submit_retry: RetryPolicy,
    pub ledger_retry: RetryPolicy,
    pub max_job_duration_s: u64,
    pub watchdog_interval_s: u64,
    pub watchdog_batch: usize,
    pub pipeline_version: String,
    pub final_designs_limit: Option<usize>,
    pub backend: BackendConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".binderflow"),
            object_store_root: PathBuf::from("objects"),
            container_reference: String::new(),
            input_prefix: "targets/".to_string(),
            input_extension: "pdb".to_string(),
            results_prefix: "results/".to_string(),
            stage_count: DEFAULT_STAGE_COUNT,
            out_of_order_policy: OutOfOrderPolicy::default(),
            submit_retry: RetryPolicy::default(),
            ledger_retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff_ms: 50,
                max_backoff_ms: 1_000,
                multiplier: 2,
            },
            max_job_duration_s: 6 * 60 * 60,
            watchdog_interval_s: 60,
            watchdog_batch: 100,
            pipeline_version: DEFAULT_PIPELINE_VERSION.to_string(),
            final_designs_limit: None,
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_yaml::Error },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "read {}: {source}", path.display()),
            Self::Parse { path, source } => write!(f, "parse {}: {source}", path.display()),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Invalid(_) => None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_count == 0 {
            return Err(ConfigError::Invalid("stage_count must be >= 1".to_string()));
        }
        if self.submit_retry.max_attempts == 0 || self.ledger_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry max_attempts must be >= 1".to_string(),
            ));
        }
        if self.input_extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Invalid("input_extension must not be empty".to_string()));
        }
        if self.max_job_duration_s == 0 {
            return Err(ConfigError::Invalid(
                "max_job_duration_s must be > 0".to_string(),
            ));
        }
        if self.final_designs_limit == Some(0) {
            return Err(ConfigError::Invalid(
                "final_designs_limit must be > 0 when set".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Command {
            if self.container_reference.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "container_reference is required for the command backend".to_string(),
                ));
            }
            if self.backend.program.as_deref().is_none_or(|p| p.trim().is_empty()) {
                return Err(ConfigError::Invalid(
                    "backend.program is required for the command backend".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `<results_prefix><job_id>/`
    pub fn output_prefix(&self, job_id: &bf_core::JobId) -> String {
        let mut prefix = self.results_prefix.clone();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        format!("{prefix}{job_id}/")
    }

    pub fn max_job_duration_ms(&self) -> i64 {
        i64::try_from(self.max_job_duration_s.saturating_mul(1_000)).unwrap_or(i64::MAX)
    }
}
