use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::task::{Language, Limits};

const CONFIG_FILE: &str = "codebox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub languages: LanguagesConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-task resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum source length in characters
    #[serde(default = "default_max_code_chars")]
    pub max_code_chars: usize,

    /// Wall-clock timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Memory ceiling (e.g., "128m", "1g", or plain bytes)
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Captured bytes kept per output stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Maximum number of processes inside one sandbox
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_code_chars: default_max_code_chars(),
            timeout_secs: default_timeout_secs(),
            memory: default_memory(),
            max_output_bytes: default_max_output_bytes(),
            pids_limit: default_pids_limit(),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Sandboxes allowed to run at the same time, across all requests
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Hard cap on tasks in one batch; larger batches are rejected
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_batch: default_max_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Where the staging directory is mounted inside the sandbox
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
        }
    }
}

/// Runtime image and interpreter for one language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub image: String,
    pub interpreter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagesConfig {
    #[serde(default = "default_python_runtime")]
    pub python: RuntimeConfig,
    #[serde(default = "default_node_runtime")]
    pub node: RuntimeConfig,
}

impl Default for LanguagesConfig {
    fn default() -> Self {
        Self {
            python: default_python_runtime(),
            node: default_node_runtime(),
        }
    }
}

impl LanguagesConfig {
    /// Runtime for a language
    pub fn runtime(&self, language: Language) -> &RuntimeConfig {
        match language {
            Language::Python => &self.python,
            Language::Node => &self.node,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Record every run
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// History file (default: `<data dir>/codebox/history.jsonl`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Characters of source kept per record
    #[serde(default = "default_history_code_chars")]
    pub max_code_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_code_chars: default_history_code_chars(),
        }
    }
}

impl HistoryConfig {
    /// Resolved history file path, if one can be determined
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| {
            dirs::data_local_dir().map(|dir| dir.join("codebox").join("history.jsonl"))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_code_chars() -> usize {
    5000
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_memory() -> String {
    "128m".to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_pids_limit() -> i64 {
    64
}

fn default_max_workers() -> usize {
    5
}

fn default_max_batch() -> usize {
    50
}

fn default_mount_point() -> String {
    "/app".to_string()
}

fn default_python_runtime() -> RuntimeConfig {
    RuntimeConfig {
        image: "python:3.11-slim".to_string(),
        interpreter: "python".to_string(),
    }
}

fn default_node_runtime() -> RuntimeConfig {
    RuntimeConfig {
        image: "node:20-slim".to_string(),
        interpreter: "node".to_string(),
    }
}

fn default_history_code_chars() -> usize {
    2000
}

impl Config {
    /// Load configuration from `codebox.toml` in `dir`, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_file(&dir.join(CONFIG_FILE), false)
    }

    /// Load configuration from an explicit path; the file must exist
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_file(path, true)
    }

    fn load_file(config_path: &Path, required: bool) -> Result<Self> {
        if !required && !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config
            .check()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn check(&self) -> Result<()> {
        if self.pool.max_workers == 0 {
            anyhow::bail!("pool.max_workers must be at least 1");
        }
        if self.pool.max_batch == 0 {
            anyhow::bail!("pool.max_batch must be at least 1");
        }
        if self.limits.timeout_secs == 0 {
            anyhow::bail!("limits.timeout_secs must be at least 1");
        }
        let memory = parse_memory_limit(&self.limits.memory)?;
        if memory <= 0 {
            anyhow::bail!("limits.memory must be positive");
        }
        if !self.sandbox.mount_point.starts_with('/') {
            anyhow::bail!("sandbox.mount_point must be an absolute path");
        }
        Ok(())
    }

    /// Task limits derived from the `[limits]` table
    pub fn task_limits(&self) -> Result<Limits> {
        Ok(Limits {
            max_code_chars: self.limits.max_code_chars,
            timeout: Duration::from_secs(self.limits.timeout_secs),
            memory_bytes: parse_memory_limit(&self.limits.memory)?,
        })
    }
}

/// Parse memory limit string (e.g., "1g", "128m") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        let kilos: i64 = num.parse().context("Invalid memory limit")?;
        Ok(kilos * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.limits.max_code_chars, 5000);
        assert_eq!(config.limits.timeout_secs, 10);
        assert_eq!(config.limits.memory, "128m");
        assert_eq!(config.pool.max_workers, 5);
        assert_eq!(config.sandbox.mount_point, "/app");
        assert_eq!(config.languages.python.image, "python:3.11-slim");
        assert_eq!(config.languages.node.interpreter, "node");
        assert!(config.history.enabled);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[limits]
timeout_secs = 3
memory = "256m"

[pool]
max_workers = 2

[languages.python]
image = "python:3.12-alpine"
interpreter = "python3"

[history]
enabled = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.limits.timeout_secs, 3);
        assert_eq!(config.limits.max_code_chars, 5000);
        assert_eq!(config.pool.max_workers, 2);
        assert_eq!(config.pool.max_batch, 50);
        assert_eq!(config.languages.python.interpreter, "python3");
        assert_eq!(config.languages.node.image, "node:20-slim");
        assert!(!config.history.enabled);

        let limits = config.task_limits().unwrap();
        assert_eq!(limits.timeout, Duration::from_secs(3));
        assert_eq!(limits.memory_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_runtime_lookup() {
        let config = Config::default();
        assert_eq!(config.languages.runtime(Language::Python).interpreter, "python");
        assert_eq!(config.languages.runtime(Language::Node).image, "node:20-slim");
    }

    #[test]
    fn test_check_rejects_zero_workers() {
        let mut config = Config::default();
        config.pool.max_workers = 0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_check_rejects_bad_memory() {
        let mut config = Config::default();
        config.limits.memory = "lots".to_string();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.pool.max_workers, 5);
    }

    #[test]
    fn test_load_from_requires_file() {
        let dir = tempdir().unwrap();
        let result = Config::load_from(&dir.path().join("missing.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_file_has_path_context() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[pool]\nmax_workers = 0\n").unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("codebox.toml"));
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("128m").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_memory_limit("128M").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1_048_576);
        assert!(parse_memory_limit("abc").is_err());
    }

    #[test]
    fn test_history_path_override() {
        let config = HistoryConfig {
            path: Some(PathBuf::from("/tmp/runs.jsonl")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_path(),
            Some(PathBuf::from("/tmp/runs.jsonl"))
        );
    }
}
