//! Session Log
//!
//! Append-only JSONL file holding one session's messages, one per line.
//! History is loaded from the end of the file backward so a long session
//! only costs as much I/O as the token budget allows.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

use crate::types::Message;

/// Bytes read per step when scanning the log backward.
pub const TAIL_CHUNK_SIZE: u64 = 8 * 1024;

/// One session's message log.
///
/// Appends through the same `SessionLog` are serialized; share one instance
/// (behind an `Arc`) between every run writing to the same session.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one message as a single JSON line.
    pub fn append(&self, msg: &Message) -> Result<()> {
        let mut line = serde_json::to_vec(msg).context("failed to serialize message")?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open session log: {}", self.path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("failed to append to session log: {}", self.path.display()))?;
        Ok(())
    }

    /// Load the newest messages whose token counts fit in `budget`, oldest
    /// first.
    ///
    /// The most recent message is always returned, even when it alone
    /// exceeds the budget. Scanning stops at the first message that would
    /// overflow it. Blank and malformed lines are skipped. A missing file is
    /// an empty history.
    pub fn load_tail(&self, budget: usize) -> Result<Vec<Message>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open session log: {}", self.path.display())
                })
            }
        };

        let mut pos = file
            .metadata()
            .with_context(|| format!("failed to stat session log: {}", self.path.display()))?
            .len();

        let mut newest_first: Vec<Message> = Vec::new();
        let mut used = 0usize;
        // Bytes of a line whose beginning lies in an earlier chunk.
        let mut carry: Vec<u8> = Vec::new();

        'scan: while pos > 0 {
            let step = TAIL_CHUNK_SIZE.min(pos);
            pos -= step;

            let mut chunk = vec![0u8; step as usize];
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut chunk)
                .with_context(|| format!("failed to read session log: {}", self.path.display()))?;
            chunk.extend_from_slice(&carry);
            carry.clear();

            let mut lines: Vec<&[u8]> = chunk.split(|b| *b == b'\n').collect();
            if pos > 0 {
                // The first piece may start mid-line; finish it with the next chunk.
                carry = lines.remove(0).to_vec();
            }

            for line in lines.into_iter().rev() {
                let Some(msg) = parse_line(line) else {
                    continue;
                };
                // An overflowing sum never fits, whatever the budget.
                let next = used.checked_add(msg.tokens);
                if !newest_first.is_empty() && !next.is_some_and(|n| n <= budget) {
                    break 'scan;
                }
                used = next.unwrap_or(usize::MAX);
                newest_first.push(msg);
            }
        }

        debug!(
            path = %self.path.display(),
            budget,
            loaded = newest_first.len(),
            tokens = used,
            "loaded session tail"
        );

        newest_first.reverse();
        Ok(newest_first)
    }

    /// Load every message in the log, oldest first.
    pub fn load_all(&self) -> Result<Vec<Message>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read session log: {}", self.path.display())
                })
            }
        };
        Ok(raw.split(|b| *b == b'\n').filter_map(parse_line).collect())
    }
}

fn parse_line(line: &[u8]) -> Option<Message> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => {
            debug!(err = %e, "skipping non-UTF-8 session log line");
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(err = %e, "skipping malformed session log line");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
