//! NDJSON attack log: one line per classified event, written locally
//! regardless of what the backend accepts. Rotation is left to the host.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use log::warn;
use parking_lot::Mutex;
use serde_json::json;

use crate::classify::AttackRecord;

const ATTACK_LOG_FILE: &str = "attacks.ndjson";

pub struct AttackLog {
    writer: Option<Mutex<BufWriter<File>>>,
}

impl AttackLog {
    /// Open (or create) the attack log under the given log directory.
    pub fn open(log_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(ATTACK_LOG_FILE))?;
        Ok(Self {
            writer: Some(Mutex::new(BufWriter::new(file))),
        })
    }

    /// A no-op log for tests and disabled configurations.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Append one record; write errors are logged, never propagated into
    /// the reporting path.
    pub fn append(&self, record: &AttackRecord, admitted: bool) {
        let Some(writer) = &self.writer else {
            return;
        };
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "ip_address": record.ip_address.to_string(),
            "attack_type": record.attack_type,
            "category": record.category.as_str(),
            "severity": record.severity,
            "base_score": record.base_score,
            "description": record.description,
            "evidence": record.evidence,
            "original_type": record.metadata.original_type,
            "admitted": admitted,
        });
        let mut guard = writer.lock();
        if let Err(err) = writeln!(guard, "{line}").and_then(|_| guard.flush()) {
            warn!("attack log write failed: {err}");
        }
    }
}
