//! Filesystem implementation of `SessionStore`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use tether_core::ids::SessionId;
use tether_core::session::{SessionInfo, SessionStore};

const LOG_EXTENSION: &str = "jsonl";

// ---------------------------------------------------------------------------
// FsSessionStore
// ---------------------------------------------------------------------------

/// Filesystem-backed session store.
///
/// Each session is a single `sessions/<id>.jsonl` log file.
pub struct FsSessionStore {
    sessions_dir: PathBuf,
}

impl FsSessionStore {
    /// Create a new store rooted at `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let sessions_dir = data_dir.join("sessions");
        std::fs::create_dir_all(&sessions_dir)
            .with_context(|| format!("failed to create sessions dir: {}", sessions_dir.display()))?;
        Ok(Self { sessions_dir })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn session_path(&self, id: &SessionId) -> Result<PathBuf> {
        let raw = id.as_str();
        if raw.is_empty() || raw.starts_with('.') || raw.contains(['/', '\\']) {
            bail!("invalid session id: {raw:?}");
        }
        Ok(self.sessions_dir.join(format!("{raw}.{LOG_EXTENSION}")))
    }
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn create(&self) -> Result<(SessionId, PathBuf)> {
        let id = SessionId::new();
        let path = self.session_path(&id)?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to create session: {}", path.display()))?;
        info!(session_id = %id, "created session");
        Ok((id, path))
    }

    async fn ensure(&self, id: &SessionId) -> Result<PathBuf> {
        let path = self.session_path(id)?;
        tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open session: {}", path.display()))?;
        debug!(session_id = %id, "session ready");
        Ok(path)
    }

    async fn list(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        if !self.sessions_dir.exists() {
            return Ok(sessions);
        }

        let mut entries = tokio::fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());

            sessions.push(SessionInfo {
                id: SessionId::from(stem),
                path: path.clone(),
                size_bytes: meta.len(),
                modified,
            });
        }

        sessions.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.id.cmp(&a.id)));
        Ok(sessions)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
