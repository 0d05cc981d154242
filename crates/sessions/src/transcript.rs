//! Append-only JSONL turn log.
//!
//! Each session gets a `<stem>.jsonl` file under the sessions directory.
//! Every turn is appended as one JSON line and synced before the append
//! returns. Reads skip lines that fail to parse instead of rejecting the
//! whole file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use na_domain::error::{Error, Result};
use na_domain::tool::Turn;
use serde::{Deserialize, Serialize};

use crate::session_key::file_stem;

/// One persisted turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub ts: DateTime<Utc>,
    /// Position of the turn within its session, starting at 0.
    pub seq: u64,
    pub turn: Turn,
}

/// Result of reading a session file back.
#[derive(Debug, Default)]
pub struct LoadedTranscript {
    pub records: Vec<TurnRecord>,
    /// Lines that could not be parsed and were skipped.
    pub skipped: usize,
}

pub struct TurnLog {
    base_dir: PathBuf,
}

impl TurnLog {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, session_key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.jsonl", file_stem(session_key)))
    }

    /// Append one record durably.
    ///
    /// Uses `spawn_blocking` to avoid blocking the tokio runtime during file I/O.
    pub async fn append(&self, session_key: &str, record: &TurnRecord) -> Result<()> {
        let mut buf = serde_json::to_string(record)?;
        buf.push('\n');
        let path = self.path_for(session_key);

        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(buf.as_bytes())?;
            file.sync_data()?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
    }

    /// Read a session's records from disk (async).
    pub async fn read(&self, session_key: &str) -> Result<LoadedTranscript> {
        let path = self.path_for(session_key);
        let key = session_key.to_owned();
        tokio::task::spawn_blocking(move || read_jsonl_file(&path, &key))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
    }

    /// Move an expired session's file aside so it is never reloaded.
    ///
    /// Returns the new path, or `None` if the session had no file.
    pub async fn retire(&self, session_key: &str, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
        let path = self.path_for(session_key);
        tokio::task::spawn_blocking(move || -> Result<Option<PathBuf>> {
            if !path.exists() {
                return Ok(None);
            }
            let retired = path.with_extension(format!("jsonl.expired-{}", now.timestamp()));
            std::fs::rename(&path, &retired)?;
            Ok(Some(retired))
        })
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
    }
}

/// Read and parse a JSONL session file.
fn read_jsonl_file(path: &Path, session_key: &str) -> Result<LoadedTranscript> {
    if !path.exists() {
        return Ok(LoadedTranscript::default());
    }

    // Lossy decode: a record with invalid UTF-8 only spoils its own line.
    let bytes = std::fs::read(path)?;
    let raw = String::from_utf8_lossy(&bytes);

    let mut out = LoadedTranscript::default();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TurnRecord>(line) {
            Ok(rec) => out.records.push(rec),
            Err(e) => {
                out.skipped += 1;
                tracing::warn!(
                    session_key = session_key,
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed turn record"
                );
            }
        }
    }
    out.records.sort_by_key(|r| r.seq);
    Ok(out)
}
