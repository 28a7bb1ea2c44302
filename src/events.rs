use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Protocol that produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Ssh,
    Ftp,
    Smtp,
    Pop3,
    Imap,
    Mysql,
}

impl Protocol {
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ssh => "ssh",
            Protocol::Ftp => "ftp",
            Protocol::Smtp => "smtp",
            Protocol::Pop3 => "pop3",
            Protocol::Imap => "imap",
            Protocol::Mysql => "mysql",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Raw detection output from a listener, before classification.
///
/// `kind` is free-form listener vocabulary (`ssh_bruteforce_scan`,
/// `http_sql_injection`, ...); the classification adapter maps it onto the
/// closed reporting taxonomy. Evidence entries are opaque strings, usually
/// JSON encodings of structured facts (commands, usernames, durations).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObservationEvent {
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub protocol: Protocol,
    pub kind: String,
    pub description: String,
    pub evidence: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl ObservationEvent {
    pub fn new(
        source_addr: IpAddr,
        source_port: u16,
        protocol: Protocol,
        kind: impl Into<String>,
        description: impl Into<String>,
        evidence: Vec<String>,
    ) -> Self {
        Self {
            source_addr,
            source_port,
            protocol,
            kind: kind.into(),
            description: description.into(),
            evidence,
            observed_at: Utc::now(),
        }
    }
}

/// JSON-encode a structured fact for the evidence list.
///
/// Serialization of these small maps cannot fail; fall back to Debug output
/// rather than dropping the fact on the floor.
pub fn evidence_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}
