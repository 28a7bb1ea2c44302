//! On-disk spool for reports the backend could not receive.
//!
//! A JSON array at `logs/offline_attacks.json`: appended when a send fails
//! (or when running offline), rewritten after each replay pass with only the
//! still-pending entries. The file is cleared on process start so a long
//! outage does not replay stale attacks; see DESIGN.md for the rationale.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::classify::AttackRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEntry {
    #[serde(flatten)]
    pub record: AttackRecord,
    pub stored_at: DateTime<Utc>,
    pub pending_upload: bool,
    #[serde(default)]
    pub throttled: bool,
}

/// Serialized access to the spool file. All mutation happens under one
/// async lock; the send path and the replay task never interleave writes.
pub struct OfflineSpool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OfflineSpool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop whatever a previous run left behind.
    pub async fn clear(&self) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, b"[]").await?;
        debug!("spool cleared at {}", self.path.display());
        Ok(())
    }

    /// Append one record, marked pending.
    pub async fn append(&self, record: &AttackRecord, throttled: bool) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await;
        entries.push(SpoolEntry {
            record: record.clone(),
            stored_at: Utc::now(),
            pending_upload: true,
            throttled,
        });
        self.write_entries(&entries).await
    }

    /// All entries still awaiting upload.
    pub async fn pending(&self) -> Vec<SpoolEntry> {
        let _guard = self.lock.lock().await;
        self.read_entries()
            .await
            .into_iter()
            .filter(|e| e.pending_upload)
            .collect()
    }

    pub async fn all(&self) -> Vec<SpoolEntry> {
        let _guard = self.lock.lock().await;
        self.read_entries().await
    }

    /// Replace the file content with the given entries.
    pub async fn rewrite(&self, entries: &[SpoolEntry]) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        self.write_entries(entries).await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending().await.len()
    }

    async fn read_entries(&self) -> Vec<SpoolEntry> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        "spool file {} is unreadable ({err}); starting over",
                        self.path.display()
                    );
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!("failed to read spool {}: {err}", self.path.display());
                Vec::new()
            }
        }
    }

    async fn write_entries(&self, entries: &[SpoolEntry]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.path, body).await
    }
}
