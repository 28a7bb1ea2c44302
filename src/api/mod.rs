//! Backend API client: heartbeats, attack reports, ping probe, and the
//! offline spool with replay.
//!
//! Send failures never propagate as process faults. A report that cannot be
//! delivered is spooled and the error surfaced to the caller; heartbeat
//! failures only move the diagnostics counters.

pub mod diagnostics;
pub mod spool;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::classify::AttackRecord;
use diagnostics::DiagnosticsRecord;
use spool::OfflineSpool;

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Replay cadence while reports are failing.
const REPLAY_INTERVAL: Duration = Duration::from_secs(300);
/// Delay before the first heartbeat after startup.
const STARTUP_HEARTBEAT_DELAY: Duration = Duration::from_secs(5);
/// Failure streak that triggers the connectivity probe.
const PING_PROBE_STREAK: u32 = 3;
/// How much of an error body is kept for diagnostics.
const BODY_SNIPPET_LIMIT: usize = 2048;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("spool i/o: {0}")]
    Spool(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub honeypot_id: String,
    pub offline_mode: bool,
    pub debug_mode: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_retry_count: u32,
    pub heartbeat_retry_delay: Duration,
    pub spool_path: PathBuf,
}

/// Outcome of the ping probe; structured for diagnostics, never an error.
#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    pub success: bool,
    pub status: Option<u16>,
    pub message: String,
}

/// Outcome of one spool replay pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub uploaded: usize,
    pub remaining: usize,
}

pub struct ApiClient {
    http: reqwest::Client,
    config: ApiClientConfig,
    pub diagnostics: DiagnosticsRecord,
    pub spool: OfflineSpool,
    report_failures: AtomicU32,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    honeypot_id: &'a str,
}

#[derive(Serialize)]
struct ReportBody<'a> {
    ip_address: String,
    attack_type: &'a str,
    description: &'a str,
    evidence: Vec<String>,
    severity: u8,
    category: &'a str,
    source: &'static str,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("servicetrap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let spool = OfflineSpool::new(config.spool_path.clone());
        Ok(Self {
            http,
            config,
            diagnostics: DiagnosticsRecord::new(),
            spool,
            report_failures: AtomicU32::new(0),
        })
    }

    /// Startup housekeeping: drop whatever spool content a previous run
    /// left behind so stale attacks are not replayed after downtime.
    pub async fn init(&self) -> Result<(), ApiError> {
        self.spool.clear().await?;
        Ok(())
    }

    pub fn offline(&self) -> bool {
        self.config.offline_mode
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn report_failures(&self) -> u32 {
        self.report_failures.load(Ordering::Relaxed)
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}?api_key={}",
            self.config.endpoint.trim_end_matches('/'),
            path,
            self.config.api_key
        )
    }

    // ── Heartbeat ────────────────────────────────────────────────────────

    /// One heartbeat send with diagnostics bookkeeping. At a failure streak
    /// of three the connectivity probe runs fire-and-forget.
    pub async fn send_heartbeat(self: &Arc<Self>) -> Result<(), ApiError> {
        let url = self.url("/honeypot/heartbeat");
        let body = HeartbeatBody {
            honeypot_id: &self.config.honeypot_id,
        };
        let body_json = serde_json::to_string(&body).unwrap_or_default();
        self.diagnostics.record_request(&url, "POST", &body_json);

        let result = self
            .http
            .post(&url)
            .timeout(HEARTBEAT_TIMEOUT)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                let text = snippet(response.text().await.unwrap_or_default());
                let previous = self.diagnostics.record_success(status, text);
                if previous > 0 {
                    info!("heartbeat recovered after {previous} failures");
                } else {
                    debug!("heartbeat ok ({status})");
                }
                Ok(())
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let text = snippet(response.text().await.unwrap_or_default());
                let streak = self.diagnostics.record_failure(
                    format!("heartbeat rejected with HTTP {status}"),
                    Some(status),
                    Some(text.clone()),
                );
                warn!("heartbeat failed with HTTP {status} (streak {streak})");
                self.maybe_probe(streak);
                Err(ApiError::Status { status, body: text })
            }
            Err(err) => {
                let streak = self
                    .diagnostics
                    .record_failure(format!("heartbeat transport error: {err}"), None, None);
                warn!("heartbeat transport error (streak {streak}): {err}");
                self.maybe_probe(streak);
                Err(ApiError::Transport(err))
            }
        }
    }

    fn maybe_probe(self: &Arc<Self>, streak: u32) {
        if streak == PING_PROBE_STREAK {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                let result = client.ping().await;
                info!(
                    "connectivity probe after {PING_PROBE_STREAK} heartbeat failures: {}",
                    result.message
                );
            });
        }
    }

    /// Heartbeat plus the debug-mode retry pass.
    pub async fn heartbeat_cycle(self: &Arc<Self>) -> Result<(), ApiError> {
        match self.send_heartbeat().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let streak = self.diagnostics.consecutive_failures();
                if self.config.debug_mode && streak <= self.config.heartbeat_retry_count {
                    debug!(
                        "retrying heartbeat in {}s (streak {streak})",
                        self.config.heartbeat_retry_delay.as_secs()
                    );
                    tokio::time::sleep(self.config.heartbeat_retry_delay).await;
                    return self.send_heartbeat().await;
                }
                Err(err)
            }
        }
    }

    // ── Reports ──────────────────────────────────────────────────────────

    /// Deliver an admitted record, or spool it. Offline mode spools without
    /// touching the network. The returned error is informational; the
    /// record is never lost.
    pub async fn report(self: &Arc<Self>, record: &AttackRecord) -> Result<(), ApiError> {
        if self.config.offline_mode {
            self.spool.append(record, false).await?;
            debug!(
                "offline mode: spooled {} from {}",
                record.attack_type, record.ip_address
            );
            return Ok(());
        }

        match self.transmit(record).await {
            Ok(()) => {
                self.report_failures.store(0, Ordering::Relaxed);
                info!(
                    "reported {} from {} (severity {})",
                    record.attack_type, record.ip_address, record.severity
                );
                Ok(())
            }
            Err(err) => {
                if let ApiError::Status { status: 403, .. } = err {
                    warn!(
                        "backend rejected report with 403; check that the api key has reporting permissions"
                    );
                }
                error!(
                    "report of {} from {} failed: {err}; spooling",
                    record.attack_type, record.ip_address
                );
                self.report_failures.fetch_add(1, Ordering::Relaxed);
                self.spool.append(record, false).await?;
                Err(err)
            }
        }
    }

    /// Store a throttled record for later inspection without transmitting.
    pub async fn spool_throttled(&self, record: &AttackRecord) -> Result<(), ApiError> {
        self.spool.append(record, true).await?;
        Ok(())
    }

    /// Raw send, no spool interaction.
    async fn transmit(&self, record: &AttackRecord) -> Result<(), ApiError> {
        let url = self.url("/honeypot/report-ip");
        let evidence = normalize_evidence(serde_json::to_value(&record.evidence).unwrap_or_default());
        let body = ReportBody {
            ip_address: record.ip_address.to_string(),
            attack_type: &record.attack_type,
            description: &record.description,
            evidence,
            severity: record.severity,
            category: record.category.as_str(),
            source: "honeypot",
        };

        let response = self
            .http
            .post(&url)
            .timeout(REPORT_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = snippet(response.text().await.unwrap_or_default());
            Err(ApiError::Status { status, body })
        }
    }

    // ── Ping probe ───────────────────────────────────────────────────────

    /// Connectivity check for diagnostics; failures are folded into the
    /// result, never raised.
    pub async fn ping(&self) -> PingResult {
        let url = self.url("/ping");
        match self.http.get(&url).timeout(PING_TIMEOUT).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                PingResult {
                    success: response.status().is_success(),
                    status: Some(status),
                    message: format!("backend answered HTTP {status}"),
                }
            }
            Err(err) => PingResult {
                success: false,
                status: None,
                message: format!("backend unreachable: {err}"),
            },
        }
    }

    /// Backend score lookup for one address; diagnostics only.
    pub async fn lookup_ip(&self, ip: &str) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}&ip={ip}", self.url("/get"));
        let response = self.http.get(&url).timeout(PING_TIMEOUT).send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let status = response.status().as_u16();
            let body = snippet(response.text().await.unwrap_or_default());
            Err(ApiError::Status { status, body })
        }
    }

    // ── Spool replay ─────────────────────────────────────────────────────

    /// Try to upload every pending spool entry; the file is rewritten with
    /// only the entries that are still pending afterwards.
    pub async fn replay_spool(&self) -> Result<ReplaySummary, ApiError> {
        let pending = self.spool.pending().await;
        if pending.is_empty() {
            return Ok(ReplaySummary::default());
        }

        let mut summary = ReplaySummary {
            attempted: pending.len(),
            ..Default::default()
        };
        let mut remaining = Vec::new();
        for entry in pending {
            match self.transmit(&entry.record).await {
                Ok(()) => {
                    summary.uploaded += 1;
                    debug!(
                        "replayed spooled {} from {}",
                        entry.record.attack_type, entry.record.ip_address
                    );
                }
                Err(err) => {
                    debug!("replay still failing: {err}");
                    remaining.push(entry);
                }
            }
        }
        summary.remaining = remaining.len();
        self.spool.rewrite(&remaining).await?;

        if summary.remaining == 0 {
            self.report_failures.store(0, Ordering::Relaxed);
        }
        info!(
            "spool replay: {}/{} uploaded, {} remaining",
            summary.uploaded, summary.attempted, summary.remaining
        );
        Ok(summary)
    }
}

/// Force evidence into the wire shape: an ordered sequence of strings.
/// Scalars become a singleton; arrays keep order with non-string items
/// JSON-serialized in place; anything else is serialized and wrapped.
pub fn normalize_evidence(value: serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        serde_json::Value::String(s) => vec![s],
        serde_json::Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

/// Heartbeat scheduler: one send shortly after startup, then every
/// configured interval. Not started in offline mode.
pub fn spawn_heartbeat(client: Arc<ApiClient>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(STARTUP_HEARTBEAT_DELAY).await;
        let _ = client.heartbeat_cycle().await;

        let mut ticker = tokio::time::interval(client.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let _ = client.heartbeat_cycle().await;
        }
    })
}

/// Replay scheduler: every five minutes, and only while the report path is
/// actually failing.
pub fn spawn_replay(client: Arc<ApiClient>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REPLAY_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if client.report_failures() == 0 {
                continue;
            }
            if let Err(err) = client.replay_spool().await {
                warn!("spool replay pass failed: {err}");
            }
        }
    })
}

fn snippet(body: String) -> String {
    if body.len() > BODY_SNIPPET_LIMIT {
        let mut end = BODY_SNIPPET_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    } else {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evidence_arrays_pass_through_in_order() {
        let out = normalize_evidence(json!(["first", "second", "third"]));
        assert_eq!(out, vec!["first", "second", "third"]);
    }

    #[test]
    fn scalar_evidence_becomes_singleton() {
        assert_eq!(normalize_evidence(json!("lone fact")), vec!["lone fact"]);
    }

    #[test]
    fn structured_evidence_is_serialized_and_wrapped() {
        let out = normalize_evidence(json!({"attempts": 4}));
        assert_eq!(out, vec![r#"{"attempts":4}"#]);

        let mixed = normalize_evidence(json!(["plain", {"n": 1}, 7]));
        assert_eq!(mixed, vec!["plain".to_string(), r#"{"n":1}"#.to_string(), "7".to_string()]);
    }

    #[test]
    fn null_evidence_is_empty() {
        assert!(normalize_evidence(serde_json::Value::Null).is_empty());
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let long = "é".repeat(2000);
        let cut = snippet(long);
        assert!(cut.len() <= BODY_SNIPPET_LIMIT);
    }

    #[test]
    fn report_body_serializes_with_honeypot_source() {
        let body = ReportBody {
            ip_address: "1.2.3.4".into(),
            attack_type: "sqli_attempt",
            description: "injection probe",
            evidence: vec!["q=' OR 1=1--".into()],
            severity: 4,
            category: "injection",
            source: "honeypot",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["source"], "honeypot");
        assert_eq!(json["attack_type"], "sqli_attempt");
        assert!(json["evidence"].as_array().unwrap().iter().all(|v| v.is_string()));
    }
}
