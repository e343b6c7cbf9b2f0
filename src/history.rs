//! Run history.
//!
//! Every finished task can be appended to a JSON-lines file: one object per
//! line with the timestamp, language, a truncated copy of the source and
//! the result. Recording is best effort and never fails a run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::outcome::{ExecutionResult, Termination};

/// One recorded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub language: String,
    pub code: String,
    pub output: String,
    pub error: String,
    pub exit_code: i64,
    pub status: Termination,
}

impl HistoryRecord {
    /// Build a record, keeping at most `max_code_chars` of the source.
    pub fn new(
        language: &str,
        code: &str,
        result: &ExecutionResult,
        max_code_chars: usize,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            language: language.to_string(),
            code: code.chars().take(max_code_chars).collect(),
            output: result.output.clone(),
            error: result.error.clone(),
            exit_code: result.exit_code,
            status: result.status,
        }
    }
}

/// Destination for run records.
pub(crate) trait HistoryStore: Send + Sync {
    /// Append one record.
    fn record(&self, record: &HistoryRecord) -> Result<()>;
}

/// Discards everything. Used when history is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NoopHistory;

impl HistoryStore for NoopHistory {
    fn record(&self, _record: &HistoryRecord) -> Result<()> {
        Ok(())
    }
}

/// Append-only JSON-lines history file.
#[derive(Debug)]
pub(crate) struct JsonlHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Up to `limit` records, newest first. A missing file is an empty history.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read history file: {}", self.path.display()))?;

        let mut records: Vec<HistoryRecord> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping unreadable history line: {}", e);
                    None
                }
            })
            .collect();

        records.reverse();
        records.truncate(limit);
        Ok(records)
    }
}

impl HistoryStore for JsonlHistory {
    fn record(&self, record: &HistoryRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize history record")?;
        line.push('\n');

        // One writer at a time so concurrent tasks never interleave lines
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("History lock poisoned"))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open history file: {}", self.path.display()))?;

        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write history file: {}", self.path.display()))?;

        Ok(())
    }
}
