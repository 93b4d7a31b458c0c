//! Diagnostics for the recognition pipeline
//!
//! Backend failures are appended to a local JSON-lines log keyed by a generated
//! id, and the most recent ones are kept in memory for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::backoff::AttemptStats;
use crate::error::ErrorKind;

/// Maximum number of errors to retain in memory
const MAX_ERROR_HISTORY: usize = 20;

const ERROR_LOG_FILE_NAME: &str = "errors.jsonl";

/// Counters published alongside the state streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub stats: AttemptStats,
    /// Times the backend instance was torn down and rebuilt
    pub reinit_count: u64,
    /// Current start/stop generation
    pub generation: u64,
}

/// One line of the error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub id: Uuid,
    pub error_type: ErrorKind,
    pub error_details: String,
    pub timestamp: DateTime<Utc>,
    pub attempt_count: u32,
    pub success_count: u32,
    pub platform_info: String,
}

impl ErrorEntry {
    pub fn new(kind: ErrorKind, details: impl Into<String>, attempts: u32, successes: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_type: kind,
            error_details: details.into(),
            timestamp: Utc::now(),
            attempt_count: attempts,
            success_count: successes,
            platform_info: platform_info(),
        }
    }
}

pub fn platform_info() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[derive(Debug, Error)]
pub enum ErrorLogError {
    #[error("serialize error entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("append to {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only error log.
///
/// With no path the log is memory-only.
pub struct ErrorLog {
    path: Option<PathBuf>,
    /// Newest first
    recent: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            recent: Mutex::new(VecDeque::with_capacity(MAX_ERROR_HISTORY)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// `<data dir>/lark-voice/errors.jsonl`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("lark-voice").join(ERROR_LOG_FILE_NAME))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an entry in memory and, if configured, on disk.
    pub fn append(&self, entry: ErrorEntry) -> Result<(), ErrorLogError> {
        if let Ok(mut recent) = self.recent.lock() {
            recent.push_front(entry.clone());
            while recent.len() > MAX_ERROR_HISTORY {
                recent.pop_back();
            }
        }

        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let io_err = |source| ErrorLogError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)
    }

    /// Most recent entries, newest first.
    pub fn recent(&self) -> Vec<ErrorEntry> {
        self.recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Read every entry back from disk, skipping lines that fail to parse.
    pub fn read_all(&self) -> Vec<ErrorEntry> {
        let Some(path) = &self.path else {
            return Vec::new();
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| match serde_json::from_str(line) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        log::warn!("Error log: skipping bad line in {:?}: {}", path, e);
                        None
                    }
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join(ERROR_LOG_FILE_NAME);
        let log = ErrorLog::new(Some(path.clone()));

        log.append(ErrorEntry::new(ErrorKind::NetworkError, "reset", 1, 4))
            .unwrap();
        log.append(ErrorEntry::new(ErrorKind::DeviceBusy, "in use", 2, 4))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let first: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        for field in [
            "id",
            "error_type",
            "error_details",
            "timestamp",
            "attempt_count",
            "success_count",
            "platform_info",
        ] {
            assert!(first.get(field).is_some(), "missing {field}");
        }
        assert_eq!(first["error_type"], "network_error");
        assert_eq!(first["success_count"], 4);
    }

    #[test]
    fn read_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(Some(dir.path().join(ERROR_LOG_FILE_NAME)));
        let entry = ErrorEntry::new(ErrorKind::Unknown, "engine wedged", 3, 0);
        log.append(entry.clone()).unwrap();
        assert_eq!(log.read_all(), vec![entry]);
    }

    #[test]
    fn recent_history_is_bounded() {
        let log = ErrorLog::in_memory();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            log.append(ErrorEntry::new(ErrorKind::Aborted, format!("#{i}"), 1, 0))
                .unwrap();
        }
        let recent = log.recent();
        assert_eq!(recent.len(), MAX_ERROR_HISTORY);
        assert_eq!(recent[0].error_details, format!("#{}", MAX_ERROR_HISTORY + 4));
    }
}
