//! Heartbeat diagnostics: one process-wide record of the most recent
//! backend exchange, surfaced through `/api-diagnostics` and `/monitor`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub url: String,
    pub method: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    pub status: Option<u16>,
    pub body: Option<String>,
}

/// Snapshot of heartbeat health. `consecutive_failures` is zero exactly
/// when the last send completed with a 2xx.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatDiagnostics {
    pub last_request: Option<RequestInfo>,
    pub last_response: Option<ResponseInfo>,
    pub last_error: Option<ErrorInfo>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Default)]
pub struct DiagnosticsRecord {
    inner: Mutex<HeartbeatDiagnostics>,
}

impl DiagnosticsRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, url: &str, method: &str, body: &str) {
        let mut inner = self.inner.lock();
        inner.last_request = Some(RequestInfo {
            url: redact_key(url),
            method: method.to_string(),
            body: body.to_string(),
        });
    }

    /// Returns the failure streak as it stood before this success reset it.
    pub fn record_success(&self, status: u16, body: String) -> u32 {
        let mut inner = self.inner.lock();
        let previous = inner.consecutive_failures;
        inner.last_response = Some(ResponseInfo { status, body });
        inner.last_error = None;
        inner.last_success = Some(Utc::now());
        inner.consecutive_failures = 0;
        previous
    }

    /// Returns the failure streak including this failure.
    pub fn record_failure(&self, message: String, status: Option<u16>, body: Option<String>) -> u32 {
        let mut inner = self.inner.lock();
        if let (Some(status), Some(body)) = (status, body.as_ref()) {
            inner.last_response = Some(ResponseInfo {
                status,
                body: body.clone(),
            });
        }
        inner.last_error = Some(ErrorInfo {
            message,
            status,
            body,
        });
        inner.consecutive_failures += 1;
        inner.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_success
    }

    pub fn snapshot(&self) -> HeartbeatDiagnostics {
        self.inner.lock().clone()
    }
}

/// Mask the api_key query value so diagnostics output never leaks the
/// credential.
pub fn redact_key(url: &str) -> String {
    match url.find("api_key=") {
        Some(idx) => {
            let start = idx + "api_key=".len();
            let end = url[start..]
                .find('&')
                .map(|off| start + off)
                .unwrap_or(url.len());
            format!("{}***{}", &url[..start], &url[end..])
        }
        None => url.to_string(),
    }
}
