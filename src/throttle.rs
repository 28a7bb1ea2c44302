//! Report admission control: bounds how often a single source address may
//! reach the backend within a TTL window while always letting the first
//! occurrence of each canonical kind through.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info};
use serde::Serialize;

/// Janitor sweep cadence for expired entries.
const JANITOR_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Window length; an entry older than this is logically absent.
    pub ttl: Duration,
    /// Admission cap per source within one window.
    pub max_reports_per_ip: u32,
    /// Suppress same-kind repeats outright instead of counting to the cap.
    pub unique_types_only: bool,
}

#[derive(Debug)]
struct ThrottleEntry {
    first_seen: Instant,
    kinds: HashSet<String>,
    reported_count: u32,
    last_activity: Instant,
}

impl ThrottleEntry {
    fn fresh(kind: &str, now: Instant) -> Self {
        let mut kinds = HashSet::new();
        kinds.insert(kind.to_string());
        Self {
            first_seen: now,
            kinds,
            reported_count: 1,
            last_activity: now,
        }
    }

    fn expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.first_seen) > ttl
    }
}

/// Why an event was not admitted. Suppression is a policy outcome, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    RepeatKind,
    PerSourceCap,
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressReason::RepeatKind => write!(f, "kind already reported for source"),
            SuppressReason::PerSourceCap => write!(f, "per-source report cap reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Suppress(SuppressReason),
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Counters surfaced through `/api-diagnostics`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ThrottleStats {
    pub tracked_sources: usize,
    pub admitted: u64,
    pub suppressed: u64,
}

pub struct ThrottleCache {
    config: ThrottleConfig,
    entries: DashMap<IpAddr, ThrottleEntry>,
    admitted: std::sync::atomic::AtomicU64,
    suppressed: std::sync::atomic::AtomicU64,
}

impl ThrottleCache {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            admitted: Default::default(),
            suppressed: Default::default(),
        }
    }

    /// Decide whether a canonical event from `source` may be reported now.
    pub fn admit(&self, source: IpAddr, kind: &str) -> Decision {
        self.admit_at(source, kind, Instant::now())
    }

    /// Policy, in order: absent or expired entry resets the window and
    /// admits; a kind not yet seen this window always admits; a repeated
    /// kind is suppressed under unique-types-only or once the cap is hit.
    pub fn admit_at(&self, source: IpAddr, kind: &str, now: Instant) -> Decision {
        let decision = match self.entries.entry(source) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ThrottleEntry::fresh(kind, now));
                Decision::Admit
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.expired(self.config.ttl, now) {
                    *entry = ThrottleEntry::fresh(kind, now);
                    Decision::Admit
                } else if !entry.kinds.contains(kind) {
                    entry.kinds.insert(kind.to_string());
                    entry.reported_count += 1;
                    entry.last_activity = now;
                    Decision::Admit
                } else if self.config.unique_types_only {
                    Decision::Suppress(SuppressReason::RepeatKind)
                } else if entry.reported_count >= self.config.max_reports_per_ip {
                    Decision::Suppress(SuppressReason::PerSourceCap)
                } else {
                    entry.reported_count += 1;
                    entry.last_activity = now;
                    Decision::Admit
                }
            }
        };

        match decision {
            Decision::Admit => {
                self.admitted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Decision::Suppress(reason) => {
                self.suppressed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!("throttled report from {source} ({kind}): {reason}");
            }
        }
        decision
    }

    /// Drop entries whose window has lapsed.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.expired(self.config.ttl, now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("throttle janitor removed {removed} expired entries");
        }
    }

    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            tracked_sources: self.entries.len(),
            admitted: self.admitted.load(std::sync::atomic::Ordering::Relaxed),
            suppressed: self.suppressed.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

/// Periodic cleanup so long-gone sources do not pin memory.
pub fn spawn_janitor(cache: Arc<ThrottleCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        info!("throttle janitor running every {}s", JANITOR_INTERVAL.as_secs());
        loop {
            ticker.tick().await;
            cache.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: u32, unique: bool) -> ThrottleCache {
        ThrottleCache::new(ThrottleConfig {
            ttl: Duration::from_secs(3600),
            max_reports_per_ip: max,
            unique_types_only: unique,
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn first_event_is_admitted() {
        let cache = cache(5, false);
        assert!(cache.admit(ip(1), "port_scan").is_admit());
    }

    #[test]
    fn cap_bounds_admissions_within_window() {
        let cache = cache(5, false);
        let now = Instant::now();
        let mut admitted = 0;
        for i in 0..20 {
            let at = now + Duration::from_secs(i);
            if cache.admit_at(ip(2), "port_scan", at).is_admit() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[test]
    fn novel_kind_is_always_admitted() {
        let cache = cache(2, false);
        let now = Instant::now();
        // Exhaust the cap with one kind.
        assert!(cache.admit_at(ip(3), "port_scan", now).is_admit());
        assert!(cache
            .admit_at(ip(3), "port_scan", now + Duration::from_secs(1))
            .is_admit());
        assert_eq!(
            cache.admit_at(ip(3), "port_scan", now + Duration::from_secs(2)),
            Decision::Suppress(SuppressReason::PerSourceCap)
        );
        // A kind not yet seen this window still goes through.
        assert!(cache
            .admit_at(ip(3), "sqli_attempt", now + Duration::from_secs(3))
            .is_admit());
    }

    #[test]
    fn unique_types_only_suppresses_repeats() {
        let cache = cache(5, true);
        let now = Instant::now();
        assert!(cache.admit_at(ip(4), "sqli_attempt", now).is_admit());
        assert_eq!(
            cache.admit_at(ip(4), "sqli_attempt", now + Duration::from_secs(1)),
            Decision::Suppress(SuppressReason::RepeatKind)
        );
        // Novel kinds are still novel.
        assert!(cache
            .admit_at(ip(4), "xss_attempt", now + Duration::from_secs(2))
            .is_admit());
    }

    #[test]
    fn window_expiry_resets_the_entry() {
        let cache = cache(1, false);
        let now = Instant::now();
        assert!(cache.admit_at(ip(5), "port_scan", now).is_admit());
        assert!(!cache
            .admit_at(ip(5), "port_scan", now + Duration::from_secs(10))
            .is_admit());
        // Past the TTL the next event is admitted regardless.
        let later = now + Duration::from_secs(3601);
        assert!(cache.admit_at(ip(5), "port_scan", later).is_admit());
        // And the count restarted at 1, so the cap applies afresh.
        assert!(!cache
            .admit_at(ip(5), "port_scan", later + Duration::from_secs(1))
            .is_admit());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = cache(5, false);
        let now = Instant::now();
        cache.admit_at(ip(6), "port_scan", now);
        cache.admit_at(ip(7), "port_scan", now + Duration::from_secs(3000));
        cache.sweep_at(now + Duration::from_secs(3700));
        let stats = cache.stats();
        assert_eq!(stats.tracked_sources, 1);
    }

    #[test]
    fn stats_count_both_outcomes() {
        let cache = cache(1, false);
        let now = Instant::now();
        cache.admit_at(ip(8), "port_scan", now);
        cache.admit_at(ip(8), "port_scan", now + Duration::from_secs(1));
        let stats = cache.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.suppressed, 1);
    }
}
