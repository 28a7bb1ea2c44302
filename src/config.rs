//! Runtime configuration: documented defaults, optionally preloaded from a
//! TOML file, always overridable from the environment. The environment is
//! the primary interface; the file exists for dev setups.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub honeypot: HoneypotSettings,
    pub api: ApiSettings,
    pub listeners: ListenersSettings,
    pub throttle: ThrottleSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HoneypotSettings {
    /// Identifier sent in heartbeats and reports.
    pub id: String,
    /// Enables heartbeat retries and the debug diagnostics endpoints.
    pub debug_mode: bool,
}

impl Default for HoneypotSettings {
    fn default() -> Self {
        Self {
            id: "test".to_string(),
            debug_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiSettings {
    pub key: String,
    pub endpoint: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_retry_count: u32,
    pub heartbeat_retry_delay_ms: u64,
    /// Skip heartbeats and spool every admitted report.
    pub offline_mode: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            key: String::new(),
            endpoint: "http://localhost:3000/api".to_string(),
            heartbeat_interval_ms: 60_000,
            heartbeat_retry_count: 3,
            heartbeat_retry_delay_ms: 5_000,
            offline_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MailSettings {
    /// One switch for the whole mail surface (SMTP, submission, POP3, IMAP).
    pub enabled: bool,
    pub smtp_port: u16,
    pub submission_port: u16,
    pub pop3_port: u16,
    pub imap_port: u16,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            smtp_port: 25,
            submission_port: 587,
            pop3_port: 110,
            imap_port: 143,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenersSettings {
    pub listen_ip: IpAddr,
    pub http: ListenerSettings,
    pub https: ListenerSettings,
    pub ssh: ListenerSettings,
    pub ftp: ListenerSettings,
    pub mail: MailSettings,
    pub mysql: ListenerSettings,
}

impl Default for ListenersSettings {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            http: ListenerSettings { enabled: true, port: 8080 },
            https: ListenerSettings { enabled: false, port: 8443 },
            ssh: ListenerSettings { enabled: true, port: 2222 },
            ftp: ListenerSettings { enabled: true, port: 21 },
            mail: MailSettings::default(),
            mysql: ListenerSettings { enabled: true, port: 3306 },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub max_reports_per_ip: u32,
    pub ip_cache_ttl_ms: u64,
    pub store_throttled_attacks: bool,
    pub report_unique_types_only: bool,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            max_reports_per_ip: 5,
            ip_cache_ttl_ms: 3_600_000,
            store_throttled_attacks: false,
            report_unique_types_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;
                toml::from_str(&contents).with_context(|| "failed to parse config file")?
            }
            _ => Config::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay the documented environment variables onto this config.
    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) {
        set_string(&get, "HONEYPOT_ID", &mut self.honeypot.id);
        set_bool(&get, "DEBUG_MODE", &mut self.honeypot.debug_mode);

        set_string(&get, "API_KEY", &mut self.api.key);
        set_string(&get, "API_ENDPOINT", &mut self.api.endpoint);
        set_parsed(&get, "HEARTBEAT_INTERVAL", &mut self.api.heartbeat_interval_ms);
        set_parsed(&get, "HEARTBEAT_RETRY_COUNT", &mut self.api.heartbeat_retry_count);
        set_parsed(&get, "HEARTBEAT_RETRY_DELAY", &mut self.api.heartbeat_retry_delay_ms);
        set_bool(&get, "OFFLINE_MODE", &mut self.api.offline_mode);

        set_parsed(&get, "HTTP_PORT", &mut self.listeners.http.port);
        set_parsed(&get, "HTTPS_PORT", &mut self.listeners.https.port);
        set_parsed(&get, "SSH_PORT", &mut self.listeners.ssh.port);
        set_parsed(&get, "FTP_PORT", &mut self.listeners.ftp.port);
        set_parsed(&get, "SMTP_PORT", &mut self.listeners.mail.smtp_port);
        set_parsed(&get, "SMTP_SUBMISSION_PORT", &mut self.listeners.mail.submission_port);
        set_parsed(&get, "POP3_PORT", &mut self.listeners.mail.pop3_port);
        set_parsed(&get, "IMAP_PORT", &mut self.listeners.mail.imap_port);
        set_parsed(&get, "MYSQL_PORT", &mut self.listeners.mysql.port);

        set_bool(&get, "ENABLE_HTTP", &mut self.listeners.http.enabled);
        set_bool(&get, "ENABLE_HTTPS", &mut self.listeners.https.enabled);
        set_bool(&get, "ENABLE_SSH", &mut self.listeners.ssh.enabled);
        set_bool(&get, "ENABLE_FTP", &mut self.listeners.ftp.enabled);
        set_bool(&get, "ENABLE_MAIL", &mut self.listeners.mail.enabled);
        set_bool(&get, "ENABLE_MYSQL", &mut self.listeners.mysql.enabled);

        if let Some(ip) = get("LISTEN_IP") {
            match ip.parse() {
                Ok(parsed) => self.listeners.listen_ip = parsed,
                Err(_) => warn!("ignoring unparseable LISTEN_IP value: {ip}"),
            }
        }

        set_parsed(&get, "MAX_REPORTS_PER_IP", &mut self.throttle.max_reports_per_ip);
        set_parsed(&get, "IP_CACHE_TTL", &mut self.throttle.ip_cache_ttl_ms);
        set_bool(&get, "STORE_THROTTLED_ATTACKS", &mut self.throttle.store_throttled_attacks);
        set_bool(&get, "REPORT_UNIQUE_TYPES_ONLY", &mut self.throttle.report_unique_types_only);

        if let Some(dir) = get("LOG_DIR") {
            self.logging.dir = PathBuf::from(dir);
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.api.heartbeat_interval_ms)
    }

    pub fn heartbeat_retry_delay(&self) -> Duration {
        Duration::from_millis(self.api.heartbeat_retry_delay_ms)
    }

    pub fn ip_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.throttle.ip_cache_ttl_ms)
    }

    pub fn spool_path(&self) -> PathBuf {
        self.logging.dir.join("offline_attacks.json")
    }

    /// True when at least one listener is configured to start.
    pub fn any_listener_enabled(&self) -> bool {
        let l = &self.listeners;
        l.http.enabled
            || l.https.enabled
            || l.ssh.enabled
            || l.ftp.enabled
            || l.mail.enabled
            || l.mysql.enabled
    }
}

fn set_string(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(value) = get(key) {
        *target = value;
    }
}

fn set_bool(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(value) = get(key) {
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            other => warn!("ignoring unparseable boolean {key}={other}"),
        }
    }
}

fn set_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(value) = get(key) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("ignoring unparseable value {key}={value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documentation() {
        let config = Config::default();
        assert_eq!(config.honeypot.id, "test");
        assert_eq!(config.api.endpoint, "http://localhost:3000/api");
        assert_eq!(config.api.heartbeat_interval_ms, 60_000);
        assert_eq!(config.listeners.http.port, 8080);
        assert_eq!(config.listeners.https.port, 8443);
        assert_eq!(config.listeners.ssh.port, 2222);
        assert_eq!(config.listeners.ftp.port, 21);
        assert_eq!(config.listeners.mail.smtp_port, 25);
        assert_eq!(config.listeners.mail.submission_port, 587);
        assert_eq!(config.listeners.mail.pop3_port, 110);
        assert_eq!(config.listeners.mail.imap_port, 143);
        assert_eq!(config.listeners.mysql.port, 3306);
        assert_eq!(config.throttle.max_reports_per_ip, 5);
        assert_eq!(config.throttle.ip_cache_ttl_ms, 3_600_000);
        assert!(!config.throttle.store_throttled_attacks);
        assert!(!config.throttle.report_unique_types_only);
        assert!(!config.api.offline_mode);
        assert_eq!(config.logging.dir, PathBuf::from("logs"));
    }

    #[test]
    fn environment_overrides_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HONEYPOT_ID", "hp-edge-1"),
            ("API_KEY", "k-123"),
            ("API_ENDPOINT", "https://scoring.example/api"),
            ("HEARTBEAT_INTERVAL", "30000"),
            ("HTTP_PORT", "9090"),
            ("ENABLE_MYSQL", "false"),
            ("OFFLINE_MODE", "true"),
            ("MAX_REPORTS_PER_IP", "2"),
            ("REPORT_UNIQUE_TYPES_ONLY", "1"),
        ]);
        let mut config = Config::default();
        config.apply_env_with(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.honeypot.id, "hp-edge-1");
        assert_eq!(config.api.key, "k-123");
        assert_eq!(config.api.endpoint, "https://scoring.example/api");
        assert_eq!(config.api.heartbeat_interval_ms, 30_000);
        assert_eq!(config.listeners.http.port, 9090);
        assert!(!config.listeners.mysql.enabled);
        assert!(config.api.offline_mode);
        assert_eq!(config.throttle.max_reports_per_ip, 2);
        assert!(config.throttle.report_unique_types_only);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HTTP_PORT", "not-a-port"),
            ("ENABLE_SSH", "maybe"),
            ("HEARTBEAT_INTERVAL", "-5"),
        ]);
        let mut config = Config::default();
        config.apply_env_with(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.listeners.http.port, 8080);
        assert!(config.listeners.ssh.enabled);
        assert_eq!(config.api.heartbeat_interval_ms, 60_000);
    }

    #[test]
    fn toml_file_round_trips() {
        let config = Config::default();
        let encoded = toml::to_string(&config).unwrap();
        let decoded: Config = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.listeners.mail.imap_port, config.listeners.mail.imap_port);
    }

    #[test]
    fn any_listener_enabled_reflects_flags() {
        let mut config = Config::default();
        assert!(config.any_listener_enabled());
        config.listeners.http.enabled = false;
        config.listeners.https.enabled = false;
        config.listeners.ssh.enabled = false;
        config.listeners.ftp.enabled = false;
        config.listeners.mail.enabled = false;
        config.listeners.mysql.enabled = false;
        assert!(!config.any_listener_enabled());
    }
}
