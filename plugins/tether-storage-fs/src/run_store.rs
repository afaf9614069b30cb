//! Filesystem implementation of `RunStore`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tether_core::ids::RunId;
use tether_core::session::{RunRecord, RunStore};

/// Appends run status records to `<data_dir>/runs.jsonl`.
pub struct FsRunStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FsRunStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
        Ok(Self {
            path: data_dir.join("runs.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored record, oldest first. Unreadable lines are skipped.
    pub async fn load(&self) -> Result<Vec<RunRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read runs: {}", self.path.display()))
            }
        };

        let records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping malformed run record");
                    None
                }
            })
            .collect();
        Ok(records)
    }

    /// Records for one run, in the order they were written.
    pub async fn history(&self, run_id: &RunId) -> Result<Vec<RunRecord>> {
        let mut records = self.load().await?;
        records.retain(|r| &r.run_id == run_id);
        Ok(records)
    }
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn record(&self, record: RunRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open runs: {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(run_id = %record.run_id, status = %record.status, "recorded run status");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
