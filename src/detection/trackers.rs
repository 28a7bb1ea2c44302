//! Per-source-address trackers behind the protocol-independent detection
//! rules: failed-auth accumulation, connection cadence, and 404 churn.
//!
//! All tables are sharded maps keyed by source IP; every read-modify-write
//! happens under the per-key shard lock. A background sweeper purges idle
//! entries so one-off scanners do not pin memory for the process lifetime.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info};

/// Auth attempts before a source is called a bruteforcer.
const BRUTEFORCE_THRESHOLD: u32 = 3;
/// Minimum spacing between bruteforce reports for one source.
const BRUTEFORCE_REPORT_INTERVAL: Duration = Duration::from_secs(60);
/// Idle time after which an auth entry is purged.
const AUTH_ENTRY_TTL: Duration = Duration::from_secs(3600);
/// Sweep cadence for all trackers.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Window and threshold for the rapid-connection rule.
const RAPID_WINDOW: Duration = Duration::from_secs(60);
const RAPID_THRESHOLD: usize = 3;
const RAPID_REPORT_INTERVAL: Duration = Duration::from_secs(120);

/// Window and threshold for the excessive-404 rule.
const NOTFOUND_WINDOW: Duration = Duration::from_secs(300);
const NOTFOUND_THRESHOLD: usize = 10;
/// Paths kept as evidence per source.
const NOTFOUND_PATH_CAP: usize = 20;

// ── Failed-auth tracking ─────────────────────────────────────────────────

#[derive(Debug)]
struct AuthEntry {
    attempts: u32,
    usernames: HashSet<String>,
    last_attempt: Instant,
    last_report: Option<Instant>,
}

/// Fired when the bruteforce rule crosses its threshold.
#[derive(Debug, Clone)]
pub struct BruteforceHit {
    pub attempts: u32,
    pub usernames: Vec<String>,
}

#[derive(Default)]
pub struct BruteforceTracker {
    entries: DashMap<IpAddr, AuthEntry>,
}

impl BruteforceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failed auth attempt; returns a hit when the source has
    /// crossed the threshold and the previous report is at least a minute
    /// old.
    pub fn record_attempt(&self, source: IpAddr, username: &str) -> Option<BruteforceHit> {
        self.record_attempt_at(source, username, Instant::now())
    }

    pub fn record_attempt_at(
        &self,
        source: IpAddr,
        username: &str,
        now: Instant,
    ) -> Option<BruteforceHit> {
        let mut entry = self.entries.entry(source).or_insert_with(|| AuthEntry {
            attempts: 0,
            usernames: HashSet::new(),
            last_attempt: now,
            last_report: None,
        });

        entry.attempts += 1;
        entry.last_attempt = now;
        if !username.is_empty() {
            entry.usernames.insert(username.to_string());
        }

        let due = entry
            .last_report
            .map_or(true, |t| now.saturating_duration_since(t) >= BRUTEFORCE_REPORT_INTERVAL);
        if entry.attempts >= BRUTEFORCE_THRESHOLD && due {
            entry.last_report = Some(now);
            let mut usernames: Vec<String> = entry.usernames.iter().cloned().collect();
            usernames.sort();
            return Some(BruteforceHit {
                attempts: entry.attempts,
                usernames,
            });
        }
        None
    }

    pub fn sweep_at(&self, now: Instant) {
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_attempt) <= AUTH_ENTRY_TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Connection cadence ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ConnEntry {
    accepts: Vec<Instant>,
    last_report: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct RapidConnectHit {
    pub connections: usize,
}

#[derive(Default)]
pub struct ConnectionTracker {
    entries: DashMap<IpAddr, ConnEntry>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted connection; returns a hit when the source has
    /// connected at least three times within the last minute and no rapid
    /// report went out in the last two.
    pub fn record_connection(&self, source: IpAddr) -> Option<RapidConnectHit> {
        self.record_connection_at(source, Instant::now())
    }

    pub fn record_connection_at(&self, source: IpAddr, now: Instant) -> Option<RapidConnectHit> {
        let mut entry = self.entries.entry(source).or_default();
        entry
            .accepts
            .retain(|t| now.saturating_duration_since(*t) <= RAPID_WINDOW);
        entry.accepts.push(now);

        let due = entry
            .last_report
            .map_or(true, |t| now.saturating_duration_since(t) >= RAPID_REPORT_INTERVAL);
        if entry.accepts.len() >= RAPID_THRESHOLD && due {
            entry.last_report = Some(now);
            return Some(RapidConnectHit {
                connections: entry.accepts.len(),
            });
        }
        None
    }

    pub fn sweep_at(&self, now: Instant) {
        self.entries.retain(|_, e| {
            e.accepts
                .last()
                .is_some_and(|t| now.saturating_duration_since(*t) <= AUTH_ENTRY_TTL)
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── 404 churn ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct NotFoundEntry {
    hits: Vec<Instant>,
    paths: Vec<String>,
    last_report: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct NotFoundHit {
    pub count: usize,
    pub paths: Vec<String>,
}

#[derive(Default)]
pub struct NotFoundTracker {
    entries: DashMap<IpAddr, NotFoundEntry>,
}

impl NotFoundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_miss(&self, source: IpAddr, path: &str) -> Option<NotFoundHit> {
        self.record_miss_at(source, path, Instant::now())
    }

    pub fn record_miss_at(&self, source: IpAddr, path: &str, now: Instant) -> Option<NotFoundHit> {
        let mut entry = self.entries.entry(source).or_default();
        entry
            .hits
            .retain(|t| now.saturating_duration_since(*t) <= NOTFOUND_WINDOW);
        entry.hits.push(now);
        if entry.paths.len() < NOTFOUND_PATH_CAP {
            entry.paths.push(path.to_string());
        }

        let due = entry
            .last_report
            .map_or(true, |t| now.saturating_duration_since(t) >= NOTFOUND_WINDOW);
        if entry.hits.len() > NOTFOUND_THRESHOLD && due {
            entry.last_report = Some(now);
            return Some(NotFoundHit {
                count: entry.hits.len(),
                paths: entry.paths.clone(),
            });
        }
        None
    }

    pub fn sweep_at(&self, now: Instant) {
        self.entries.retain(|_, e| {
            e.hits
                .last()
                .is_some_and(|t| now.saturating_duration_since(*t) <= AUTH_ENTRY_TTL)
        });
    }
}

// ── Aggregate + sweeper ──────────────────────────────────────────────────

/// All per-source trackers, shared across listeners.
#[derive(Default)]
pub struct Trackers {
    pub auth: BruteforceTracker,
    pub connections: ConnectionTracker,
    pub not_found: NotFoundTracker,
}

impl Trackers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.auth.sweep_at(now);
        self.connections.sweep_at(now);
        self.not_found.sweep_at(now);
    }
}

pub fn spawn_sweeper(trackers: Arc<Trackers>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        info!("tracker sweeper running every {}s", SWEEP_INTERVAL.as_secs());
        loop {
            ticker.tick().await;
            trackers.sweep();
            debug!(
                "tracker sweep complete ({} auth, {} connection entries)",
                trackers.auth.len(),
                trackers.connections.len()
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn bruteforce_fires_on_third_attempt() {
        let tracker = BruteforceTracker::new();
        let now = Instant::now();
        assert!(tracker.record_attempt_at(ip(1), "root", now).is_none());
        assert!(tracker
            .record_attempt_at(ip(1), "admin", now + Duration::from_secs(1))
            .is_none());
        let hit = tracker
            .record_attempt_at(ip(1), "root", now + Duration::from_secs(2))
            .expect("third attempt crosses the threshold");
        assert_eq!(hit.attempts, 3);
        assert_eq!(hit.usernames, vec!["admin".to_string(), "root".to_string()]);
    }

    #[test]
    fn bruteforce_reports_are_spaced_a_minute_apart() {
        let tracker = BruteforceTracker::new();
        let now = Instant::now();
        for i in 0..3 {
            tracker.record_attempt_at(ip(2), "root", now + Duration::from_secs(i));
        }
        // Threshold crossed at attempt 3; the next attempts stay quiet until
        // a minute has passed since the report.
        assert!(tracker
            .record_attempt_at(ip(2), "root", now + Duration::from_secs(10))
            .is_none());
        assert!(tracker
            .record_attempt_at(ip(2), "root", now + Duration::from_secs(63))
            .is_some());
    }

    #[test]
    fn bruteforce_sweep_drops_idle_sources() {
        let tracker = BruteforceTracker::new();
        let now = Instant::now();
        tracker.record_attempt_at(ip(3), "root", now);
        tracker.sweep_at(now + Duration::from_secs(3700));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn rapid_connections_fire_at_three_in_a_minute() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        assert!(tracker.record_connection_at(ip(4), now).is_none());
        assert!(tracker
            .record_connection_at(ip(4), now + Duration::from_secs(10))
            .is_none());
        let hit = tracker
            .record_connection_at(ip(4), now + Duration::from_secs(20))
            .expect("three connects within the window");
        assert_eq!(hit.connections, 3);
    }

    #[test]
    fn rapid_connection_window_prunes_old_accepts() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        tracker.record_connection_at(ip(5), now);
        tracker.record_connection_at(ip(5), now + Duration::from_secs(10));
        // Third connect lands outside the 60s window of the first.
        assert!(tracker
            .record_connection_at(ip(5), now + Duration::from_secs(90))
            .is_none());
    }

    #[test]
    fn rapid_reports_are_spaced_two_minutes_apart() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        for i in 0..3 {
            tracker.record_connection_at(ip(6), now + Duration::from_secs(i));
        }
        // Keep connecting fast; no second report until 120s elapse.
        assert!(tracker
            .record_connection_at(ip(6), now + Duration::from_secs(30))
            .is_none());
        assert!(tracker
            .record_connection_at(ip(6), now + Duration::from_secs(125))
            .is_some());
    }

    #[test]
    fn not_found_fires_past_ten_misses() {
        let tracker = NotFoundTracker::new();
        let now = Instant::now();
        for i in 0..10 {
            assert!(tracker
                .record_miss_at(ip(7), &format!("/missing-{i}"), now + Duration::from_secs(i))
                .is_none());
        }
        let hit = tracker
            .record_miss_at(ip(7), "/missing-10", now + Duration::from_secs(11))
            .expect("eleventh miss crosses the threshold");
        assert_eq!(hit.count, 11);
        assert!(hit.paths.contains(&"/missing-0".to_string()));
    }
}
