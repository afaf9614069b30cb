//! Session and Run Stores
//!
//! Contracts for the collaborators that locate session logs and keep a
//! record of run outcomes. Implementations live outside the core
//! (see `tether-storage-fs`).

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, SessionId};

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Summary of a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Locates (and creates) the log file backing each session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new, empty session.
    async fn create(&self) -> Result<(SessionId, PathBuf)>;

    /// Path of an existing session, creating an empty one if it is missing.
    async fn ensure(&self, id: &SessionId) -> Result<PathBuf>;

    /// All sessions, most recently modified first.
    async fn list(&self) -> Result<Vec<SessionInfo>>;
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status transition of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub status: RunStatus,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: RunId, session_id: Option<SessionId>, status: RunStatus) -> Self {
        Self {
            run_id,
            session_id,
            status,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Append-only record of run status transitions.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn record(&self, record: RunRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_record_serializes_compactly() {
        let record = RunRecord::new(RunId::from("run_1"), None, RunStatus::Cancelled);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["run_id"], "run_1");
        assert_eq!(value["status"], "cancelled");
        assert!(value.get("ts").is_some());
        assert!(value.get("session_id").is_none());
        assert!(value.get("error").is_none());

        let failed = RunRecord::new(RunId::from("run_2"), Some(SessionId::from("sess_1")), RunStatus::Failed)
            .with_error("boom");
        let back: RunRecord = serde_json::from_str(&serde_json::to_string(&failed).unwrap()).unwrap();
        assert_eq!(back, failed);
    }
}
