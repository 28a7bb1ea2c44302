//! Session detection rules shared by every listener.
//!
//! The engine owns the per-source trackers and turns rule hits into raw
//! observation events; protocol modules stay in charge of wire handling and
//! call in at the three common seams: connection accept, failed auth, and
//! session close. Content rules (token sets) live in [`patterns`].

pub mod patterns;
pub mod trackers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::events::{evidence_json, ObservationEvent, Protocol};
use trackers::Trackers;

/// Sessions shorter than this with no meaningful interaction are scans.
pub const SCAN_DURATION: Duration = Duration::from_millis(500);

/// Delay before answering any auth attempt, to make enumeration costly.
pub const AUTH_FAIL_DELAY: Duration = Duration::from_secs(1);

/// What a session looked like when it closed; inputs to the port-scan rule.
#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    pub started: Instant,
    pub meaningful_commands: u32,
    pub auth_attempts: u32,
}

impl SessionStats {
    pub fn begin() -> Self {
        Self {
            started: Instant::now(),
            meaningful_commands: 0,
            auth_attempts: 0,
        }
    }

    pub fn command(&mut self) {
        self.meaningful_commands += 1;
    }

    pub fn auth_attempt(&mut self) {
        self.auth_attempts += 1;
    }
}

pub struct DetectionEngine {
    trackers: Arc<Trackers>,
}

impl DetectionEngine {
    pub fn new(trackers: Arc<Trackers>) -> Self {
        Self { trackers }
    }

    pub fn trackers(&self) -> &Trackers {
        &self.trackers
    }

    /// Rapid-connection rule, applied on every accept.
    pub fn on_connection(&self, proto: Protocol, peer: SocketAddr) -> Option<ObservationEvent> {
        let hit = self.trackers.connections.record_connection(peer.ip())?;
        Some(ObservationEvent::new(
            peer.ip(),
            peer.port(),
            proto,
            format!("{proto}_bruteforce_scan"),
            format!(
                "{} connections from {} within one minute on {proto}",
                hit.connections,
                peer.ip()
            ),
            vec![evidence_json(&json!({
                "connections": hit.connections,
                "window_seconds": 60,
            }))],
        ))
    }

    /// Bruteforce rule, applied on every failed auth attempt.
    pub fn on_auth_failure(
        &self,
        proto: Protocol,
        peer: SocketAddr,
        username: &str,
    ) -> Option<ObservationEvent> {
        let hit = self.trackers.auth.record_attempt(peer.ip(), username)?;
        Some(ObservationEvent::new(
            peer.ip(),
            peer.port(),
            proto,
            format!("{proto}_bruteforce"),
            format!(
                "{} failed {proto} auth attempts from {} ({} usernames)",
                hit.attempts,
                peer.ip(),
                hit.usernames.len()
            ),
            vec![evidence_json(&json!({
                "attempts": hit.attempts,
                "usernames": hit.usernames,
            }))],
        ))
    }

    /// Port-scan rule, applied when a session closes: short-lived sessions
    /// with at most one meaningful command and no auth traffic read as
    /// connect-and-leave probes.
    pub fn on_session_close(
        &self,
        proto: Protocol,
        peer: SocketAddr,
        stats: &SessionStats,
    ) -> Option<ObservationEvent> {
        let duration = stats.started.elapsed();
        if duration >= SCAN_DURATION
            || stats.meaningful_commands > 1
            || stats.auth_attempts > 0
        {
            return None;
        }
        Some(ObservationEvent::new(
            peer.ip(),
            peer.port(),
            proto,
            format!("{proto}_scan"),
            format!(
                "{proto} probe from {} closed after {}ms",
                peer.ip(),
                duration.as_millis()
            ),
            vec![evidence_json(&json!({
                "duration_ms": duration.as_millis() as u64,
                "commands": stats.meaningful_commands,
            }))],
        ))
    }

    /// Excessive-404 rule for the HTTP listener.
    pub fn on_http_miss(&self, peer: SocketAddr, path: &str) -> Option<ObservationEvent> {
        let hit = self.trackers.not_found.record_miss(peer.ip(), path)?;
        Some(ObservationEvent::new(
            peer.ip(),
            peer.port(),
            Protocol::Http,
            "excessive_404",
            format!(
                "{} missing-path requests from {} in five minutes",
                hit.count,
                peer.ip()
            ),
            vec![evidence_json(&json!({
                "count": hit.count,
                "paths": hit.paths,
                "frequency": hit.count,
            }))],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DetectionEngine {
        DetectionEngine::new(Arc::new(Trackers::new()))
    }

    fn peer() -> SocketAddr {
        "203.0.113.9:50000".parse().unwrap()
    }

    #[test]
    fn short_idle_session_reads_as_scan() {
        let engine = engine();
        let stats = SessionStats::begin();
        let event = engine
            .on_session_close(Protocol::Ftp, peer(), &stats)
            .expect("fresh silent session is a scan");
        assert_eq!(event.kind, "ftp_scan");
    }

    #[test]
    fn session_with_auth_traffic_is_not_a_scan() {
        let engine = engine();
        let mut stats = SessionStats::begin();
        stats.auth_attempt();
        assert!(engine.on_session_close(Protocol::Pop3, peer(), &stats).is_none());
    }

    #[test]
    fn session_with_commands_is_not_a_scan() {
        let engine = engine();
        let mut stats = SessionStats::begin();
        stats.command();
        stats.command();
        assert!(engine.on_session_close(Protocol::Smtp, peer(), &stats).is_none());
    }

    #[test]
    fn long_session_is_not_a_scan() {
        let engine = engine();
        let stats = SessionStats {
            started: Instant::now() - Duration::from_secs(2),
            meaningful_commands: 0,
            auth_attempts: 0,
        };
        assert!(engine.on_session_close(Protocol::Imap, peer(), &stats).is_none());
    }

    #[test]
    fn third_rapid_connection_emits_bruteforce_scan() {
        let engine = engine();
        assert!(engine.on_connection(Protocol::Ssh, peer()).is_none());
        assert!(engine.on_connection(Protocol::Ssh, peer()).is_none());
        let event = engine
            .on_connection(Protocol::Ssh, peer())
            .expect("third accept in a minute");
        assert_eq!(event.kind, "ssh_bruteforce_scan");
    }

    #[test]
    fn third_failed_auth_emits_bruteforce() {
        let engine = engine();
        assert!(engine.on_auth_failure(Protocol::Ftp, peer(), "root").is_none());
        assert!(engine.on_auth_failure(Protocol::Ftp, peer(), "admin").is_none());
        let event = engine
            .on_auth_failure(Protocol::Ftp, peer(), "root")
            .expect("threshold");
        assert_eq!(event.kind, "ftp_bruteforce");
        assert!(event.evidence[0].contains("admin"));
    }
}
