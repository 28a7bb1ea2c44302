//! Classification adapter: maps free-form listener vocabulary onto the
//! closed reporting taxonomy the backend scores against.
//!
//! Classification is a pure function of (internal kind, evidence). The
//! original kind is preserved in metadata and is never the reported kind.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ObservationEvent;

/// Backend scoring category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Reconnaissance,
    Abuse,
    Authentication,
    Injection,
    Dos,
    Intrusion,
    Malware,
    Anonymity,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Reconnaissance => "reconnaissance",
            Category::Abuse => "abuse",
            Category::Authentication => "authentication",
            Category::Injection => "injection",
            Category::Dos => "dos",
            Category::Intrusion => "intrusion",
            Category::Malware => "malware",
            Category::Anonymity => "anonymity",
            Category::General => "general",
        }
    }
}

/// One row of the closed taxonomy.
#[derive(Debug, Clone, Copy)]
pub struct TaxonomyEntry {
    pub kind: &'static str,
    pub base_score: u32,
    pub category: Category,
}

/// The full reporting taxonomy, ordered by base score. Every classification
/// result is drawn from this table.
pub const TAXONOMY: &[TaxonomyEntry] = &[
    TaxonomyEntry { kind: "suspicious_user_agent", base_score: 2, category: Category::Reconnaissance },
    TaxonomyEntry { kind: "directory_listing", base_score: 3, category: Category::Reconnaissance },
    TaxonomyEntry { kind: "excessive_404", base_score: 3, category: Category::Reconnaissance },
    TaxonomyEntry { kind: "suspicious_query", base_score: 4, category: Category::Reconnaissance },
    TaxonomyEntry { kind: "fake_crawler", base_score: 4, category: Category::Reconnaissance },
    TaxonomyEntry { kind: "rate_limit_breach", base_score: 6, category: Category::Abuse },
    TaxonomyEntry { kind: "api_abuse", base_score: 7, category: Category::Abuse },
    TaxonomyEntry { kind: "port_scan", base_score: 8, category: Category::Reconnaissance },
    TaxonomyEntry { kind: "comment_spam", base_score: 8, category: Category::Abuse },
    TaxonomyEntry { kind: "honeypot", base_score: 9, category: Category::General },
    TaxonomyEntry { kind: "credential_stuffing", base_score: 11, category: Category::Authentication },
    TaxonomyEntry { kind: "xss_attempt", base_score: 12, category: Category::Injection },
    TaxonomyEntry { kind: "csrf_attempt", base_score: 12, category: Category::Authentication },
    TaxonomyEntry { kind: "path_traversal", base_score: 13, category: Category::Injection },
    TaxonomyEntry { kind: "auth_breach", base_score: 15, category: Category::Authentication },
    TaxonomyEntry { kind: "sqli_attempt", base_score: 16, category: Category::Injection },
    TaxonomyEntry { kind: "ssh_bruteforce", base_score: 18, category: Category::Authentication },
    TaxonomyEntry { kind: "http_flood", base_score: 18, category: Category::Dos },
    TaxonomyEntry { kind: "mail_spam", base_score: 19, category: Category::Abuse },
    TaxonomyEntry { kind: "command_injection", base_score: 20, category: Category::Injection },
    TaxonomyEntry { kind: "http_injection", base_score: 22, category: Category::Injection },
    TaxonomyEntry { kind: "data_exfiltration", base_score: 25, category: Category::Intrusion },
    TaxonomyEntry { kind: "botnet_activity", base_score: 28, category: Category::Malware },
    TaxonomyEntry { kind: "ransomware", base_score: 35, category: Category::Malware },
    TaxonomyEntry { kind: "ddos", base_score: 40, category: Category::Dos },
    TaxonomyEntry { kind: "targeted_attack", base_score: 45, category: Category::Intrusion },
    TaxonomyEntry { kind: "manual", base_score: 15, category: Category::General },
    TaxonomyEntry { kind: "tor_exit", base_score: 10, category: Category::Anonymity },
    TaxonomyEntry { kind: "proxy_abuse", base_score: 8, category: Category::Anonymity },
    TaxonomyEntry { kind: "vpn_abuse", base_score: 7, category: Category::Anonymity },
];

const DEFAULT_KIND: &str = "honeypot";
const DEFAULT_ENTRY: TaxonomyEntry = TaxonomyEntry {
    kind: "honeypot",
    base_score: 9,
    category: Category::General,
};

/// Classified, scored event ready to send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackRecord {
    pub ip_address: IpAddr,
    pub attack_type: String,
    pub category: Category,
    pub severity: u8,
    pub base_score: u32,
    pub description: String,
    pub evidence: Vec<String>,
    pub metadata: AttackMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackMetadata {
    pub original_type: String,
    pub base_score: u32,
    pub enhanced_at: DateTime<Utc>,
}

pub fn taxonomy_entry(kind: &str) -> Option<&'static TaxonomyEntry> {
    TAXONOMY.iter().find(|e| e.kind == kind)
}

/// Classify a raw observation into a canonical attack record.
pub fn classify(event: &ObservationEvent) -> AttackRecord {
    let internal = event.kind.to_lowercase();
    let mut canonical = map_internal(&internal);

    // Evidence-aware refinement only applies to generic suspicious-query
    // labels; concrete labels already carry their own verdict.
    if canonical == "suspicious_query" {
        canonical = refine_suspicious(&event.evidence);
    }

    let entry = taxonomy_entry(canonical).unwrap_or(&DEFAULT_ENTRY);

    let severity = severity_for(entry, &event.evidence);

    AttackRecord {
        ip_address: event.source_addr,
        attack_type: entry.kind.to_string(),
        category: entry.category,
        severity,
        base_score: entry.base_score,
        description: event.description.clone(),
        evidence: event.evidence.clone(),
        metadata: AttackMetadata {
            original_type: event.kind.clone(),
            base_score: entry.base_score,
            enhanced_at: Utc::now(),
        },
    }
}

/// Resolve a listener label to a canonical kind. Unknown input falls back
/// to `honeypot` silently; listeners are free to grow their vocabulary
/// without breaking the reporting path.
fn map_internal(internal: &str) -> &'static str {
    // Labels that already name a taxonomy row map to themselves.
    if let Some(entry) = taxonomy_entry(internal) {
        return entry.kind;
    }

    match internal {
        "sql_injection" | "http_sql_injection" | "mysql_sql_injection" => "sqli_attempt",
        "http_command_injection" => "command_injection",
        "xss" | "http_xss" => "xss_attempt",
        "http_path_traversal" => "path_traversal",
        "suspicious_endpoint" | "http_suspicious_endpoint" => "suspicious_query",
        "scanner_user_agent" => "suspicious_user_agent",
        "email_harvesting" => "data_exfiltration",
        "smtp_relay_attempt" | "smtp_spam_attempt" | "smtp_open_relay" => "mail_spam",
        "malware_upload" | "ftp_upload" => "botnet_activity",
        "http_login_bruteforce" => "credential_stuffing",
        _ => map_suffixed(internal),
    }
}

/// `{proto}_scan`, `{proto}_bruteforce` and `{proto}_bruteforce_scan` are
/// produced generically by the session rules; resolve them by suffix so a
/// new listener needs no adapter change.
fn map_suffixed(internal: &str) -> &'static str {
    if internal.ends_with("_bruteforce_scan") || internal.ends_with("_bruteforce") {
        if internal.starts_with("ssh") {
            return "ssh_bruteforce";
        }
        return "credential_stuffing";
    }
    if internal.ends_with("_scan") {
        return "port_scan";
    }
    DEFAULT_KIND
}

fn refine_suspicious(evidence: &[String]) -> &'static str {
    let joined = evidence.join(" ").to_lowercase();
    if joined.contains("union select") || joined.contains("information_schema") {
        return "sqli_attempt";
    }
    if joined.contains("script") && (joined.contains("alert") || joined.contains("cookie")) {
        return "xss_attempt";
    }
    if joined.contains("../") || joined.contains("..%2f") {
        return "path_traversal";
    }
    "suspicious_query"
}

/// Severity 1-5, derived from the canonical kind and bumped by one when the
/// evidence is substantial (more than 3 entries, or a frequency hint above
/// 10 in any structured evidence entry).
fn severity_for(entry: &TaxonomyEntry, evidence: &[String]) -> u8 {
    let base = match entry.category {
        Category::Injection | Category::Dos => {
            if entry.base_score >= 35 {
                5
            } else if entry.base_score >= 16 {
                4
            } else {
                3
            }
        }
        Category::Authentication => 4,
        Category::Malware => {
            if entry.base_score >= 30 {
                5
            } else {
                4
            }
        }
        Category::Intrusion => {
            if entry.base_score >= 40 {
                5
            } else {
                4
            }
        }
        Category::Abuse => 3,
        Category::Reconnaissance | Category::General | Category::Anonymity => 2,
    };

    let bump = evidence.len() > 3 || frequency_hint(evidence) > 10;
    if bump {
        (base + 1).min(5)
    } else {
        base
    }
}

fn frequency_hint(evidence: &[String]) -> u64 {
    evidence
        .iter()
        .filter_map(|e| serde_json::from_str::<serde_json::Value>(e).ok())
        .filter_map(|v| v.get("frequency").and_then(|f| f.as_u64()))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Protocol;

    fn event(kind: &str, evidence: Vec<String>) -> ObservationEvent {
        ObservationEvent::new(
            "1.2.3.4".parse().unwrap(),
            55555,
            Protocol::Http,
            kind,
            "test event",
            evidence,
        )
    }

    #[test]
    fn unknown_kind_falls_back_to_honeypot() {
        let record = classify(&event("totally_unknown", vec![]));
        assert_eq!(record.attack_type, "honeypot");
        assert_eq!(record.base_score, 9);
        assert_eq!(record.severity, 2);
        assert_eq!(record.metadata.original_type, "totally_unknown");
    }

    #[test]
    fn classification_is_deterministic() {
        let ev = event("http_sql_injection", vec!["union select".into()]);
        let a = classify(&ev);
        let b = classify(&ev);
        assert_eq!(a.attack_type, b.attack_type);
        assert_eq!(a.category, b.category);
        assert_eq!(a.base_score, b.base_score);
        assert_eq!(a.severity, b.severity);
    }

    #[test]
    fn every_result_is_drawn_from_the_taxonomy() {
        let inputs = [
            "ssh_scan",
            "ftp_bruteforce",
            "mysql_bruteforce_scan",
            "smtp_relay_attempt",
            "email_harvesting",
            "SOMETHING_ELSE",
            "",
            "drop table users",
        ];
        for input in inputs {
            let record = classify(&event(input, vec![]));
            assert!(
                taxonomy_entry(&record.attack_type).is_some(),
                "{input} produced off-taxonomy kind {}",
                record.attack_type
            );
        }
    }

    #[test]
    fn scan_suffixes_map_to_port_scan() {
        for kind in ["http_scan", "ftp_scan", "pop3_scan", "mysql_scan"] {
            assert_eq!(classify(&event(kind, vec![])).attack_type, "port_scan");
        }
    }

    #[test]
    fn ssh_bruteforce_labels_keep_their_kind() {
        assert_eq!(classify(&event("ssh_bruteforce", vec![])).attack_type, "ssh_bruteforce");
        assert_eq!(
            classify(&event("ssh_bruteforce_scan", vec![])).attack_type,
            "ssh_bruteforce"
        );
        assert_eq!(
            classify(&event("ftp_bruteforce", vec![])).attack_type,
            "credential_stuffing"
        );
    }

    #[test]
    fn relay_attempt_maps_to_mail_spam() {
        let record = classify(&event("smtp_relay_attempt", vec![]));
        assert_eq!(record.attack_type, "mail_spam");
        assert_eq!(record.category, Category::Abuse);
    }

    #[test]
    fn suspicious_query_refines_on_evidence() {
        let sqli = classify(&event(
            "suspicious_query",
            vec![r#"{"query":"1 union select * from users"}"#.into()],
        ));
        assert_eq!(sqli.attack_type, "sqli_attempt");

        let xss = classify(&event(
            "suspicious_query",
            vec!["<script>alert(1)</script>".into()],
        ));
        assert_eq!(xss.attack_type, "xss_attempt");

        let traversal = classify(&event("suspicious_query", vec!["../../etc/passwd".into()]));
        assert_eq!(traversal.attack_type, "path_traversal");

        let plain = classify(&event("suspicious_query", vec!["?page=2".into()]));
        assert_eq!(plain.attack_type, "suspicious_query");
    }

    #[test]
    fn severity_grades_injection_by_base_score() {
        assert_eq!(classify(&event("xss", vec![])).severity, 3);
        assert_eq!(classify(&event("sql_injection", vec![])).severity, 4);
        assert_eq!(classify(&event("command_injection", vec![])).severity, 4);
        assert_eq!(classify(&event("ddos", vec![])).severity, 5);
        assert_eq!(classify(&event("ssh_bruteforce", vec![])).severity, 4);
        assert_eq!(classify(&event("port_scan", vec![])).severity, 2);
    }

    #[test]
    fn severity_bumps_on_heavy_evidence() {
        let heavy = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        assert_eq!(classify(&event("ssh_bruteforce", heavy)).severity, 5);

        let frequent = vec![r#"{"frequency":25}"#.into()];
        assert_eq!(classify(&event("port_scan", frequent)).severity, 3);

        // Cap at 5.
        let heavy = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        assert_eq!(classify(&event("ddos", heavy)).severity, 5);
    }

    #[test]
    fn sqli_single_shot_meets_reporting_floor() {
        // GET /search?q=' OR 1=1-- style observation.
        let record = classify(&event(
            "http_sql_injection",
            vec![r#"{"path":"/search","query":"q=' OR 1=1--"}"#.into()],
        ));
        assert_eq!(record.attack_type, "sqli_attempt");
        assert_eq!(record.category, Category::Injection);
        assert!(record.severity >= 3);
    }
}
