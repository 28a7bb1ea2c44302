//! HTTP listener: serves a small lure site, runs the request detection
//! rules, and hosts the diagnostics surface on the same port.
//!
//! The diagnostics paths are excluded from detection and from the 404
//! handler so operator traffic never produces observation events.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::detection::{patterns, SessionStats, AUTH_FAIL_DELAY};
use crate::events::{evidence_json, ObservationEvent, Protocol};

use super::{ListenerContext, ProtocolService};

/// Operator endpoints; never inspected, never 404-tracked.
const SYSTEM_PATHS: &[&str] = &[
    "/monitor",
    "/api-diagnostics",
    "/test-heartbeat",
    "/debug",
    "/offline-attacks",
    "/upload-offline-attacks",
];

/// Paths that answer with a real auth prompt and always reject.
const LOGIN_PATHS: &[&str] = &["/login", "/admin", "/wp-login.php"];

const MAX_HEAD_BYTES: u64 = 8 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;
/// Requests served per connection before the socket is closed.
const MAX_REQUESTS_PER_CONN: u32 = 100;

pub struct HttpService {
    ctx: ListenerContext,
}

impl HttpService {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ProtocolService for HttpService {
    async fn start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.listeners.listen_ip, self.ctx.config.listeners.http.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("http listener on {addr}");

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut shutdown = ctx.shutdown.clone();
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer, Protocol::Http).await {
                                    debug!("http session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("http accept error: {err}"),
                    }
                }
            }
        });

        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.http.port
    }
}

/// A parsed request, just deep enough for detection and routing.
#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub keep_alive: bool,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }
}

pub fn is_system_path(path: &str) -> bool {
    SYSTEM_PATHS.iter().any(|p| path == *p || path.starts_with(&format!("{p}/")))
}

/// Run the content rules in their fixed order and return the internal kind
/// plus the matched token. System paths must be filtered before calling.
pub fn inspect_request(req: &Request) -> Option<(&'static str, &'static str)> {
    let target = &req.target;
    let body = &req.body;

    if let Some(token) = patterns::match_suspicious_endpoint(&req.path) {
        return Some(("http_suspicious_endpoint", token));
    }
    if let Some(token) = patterns::match_sqli(target).or_else(|| patterns::match_sqli(body)) {
        return Some(("http_sql_injection", token));
    }
    if let Some(token) =
        patterns::match_command_injection(target).or_else(|| patterns::match_command_injection(body))
    {
        return Some(("http_command_injection", token));
    }
    if let Some(token) = patterns::match_xss(target).or_else(|| patterns::match_xss(body)) {
        return Some(("http_xss", token));
    }
    if let Some(token) = patterns::match_traversal(target) {
        return Some(("http_path_traversal", token));
    }
    if let Some(token) = patterns::match_scanner_agent(req.user_agent()) {
        return Some(("suspicious_user_agent", token));
    }
    None
}

pub async fn handle_session(
    ctx: ListenerContext,
    stream: TcpStream,
    peer: SocketAddr,
    proto: Protocol,
) -> Result<()> {
    let mut stats = SessionStats::begin();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    for _ in 0..MAX_REQUESTS_PER_CONN {
        let Some(request) = read_request(&mut reader).await? else {
            break;
        };
        stats.command();

        if is_system_path(&request.path) {
            let (status, body) = diagnostics_response(&ctx, &request).await;
            write_response(&mut write_half, status, "application/json", &body, false).await?;
            // Operator connections never reach the close-time scan rule.
            return Ok(());
        }

        detect(&ctx, &request, peer, proto);

        let is_login_post = request.method == "POST"
            && LOGIN_PATHS.iter().any(|p| request.path.starts_with(p));
        if is_login_post {
            stats.auth_attempt();
            let form = parse_form(&request.body);
            let username = form.get("username").or_else(|| form.get("user")).cloned();
            record_login_failure(&ctx, peer, username.as_deref().unwrap_or(""), &request.path);
            tokio::time::sleep(AUTH_FAIL_DELAY).await;
            write_response(
                &mut write_half,
                401,
                "text/html",
                pages::LOGIN_FAILED,
                request.keep_alive,
            )
            .await?;
            continue;
        }

        match pages::render(&request.path) {
            Some((status, content_type, body)) => {
                write_response(&mut write_half, status, content_type, body, request.keep_alive)
                    .await?;
            }
            None => {
                if let Some(event) = ctx.detection.on_http_miss(peer, &request.path) {
                    ctx.pipeline.dispatch(event);
                }
                write_response(&mut write_half, 404, "text/html", pages::NOT_FOUND, request.keep_alive)
                    .await?;
            }
        }

        if !request.keep_alive {
            break;
        }
    }

    if let Some(event) = ctx.detection.on_session_close(proto, peer, &stats) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

fn detect(ctx: &ListenerContext, request: &Request, peer: SocketAddr, proto: Protocol) {
    if let Some((kind, token)) = inspect_request(request) {
        let event = ObservationEvent::new(
            peer.ip(),
            peer.port(),
            proto,
            kind,
            format!("{} {} matched '{token}'", request.method, request.target),
            vec![evidence_json(&json!({
                "method": request.method,
                "path": request.path,
                "query": request.query,
                "user_agent": request.user_agent(),
                "matched": token,
            }))],
        );
        ctx.pipeline.dispatch(event);
    }
}

fn record_login_failure(ctx: &ListenerContext, peer: SocketAddr, username: &str, path: &str) {
    debug!("http login attempt for '{username}' at {path} from {peer}");
    if let Some(event) = ctx.detection.on_auth_failure(Protocol::Http, peer, username) {
        ctx.pipeline.dispatch(event);
    }
}

/// Read one request; `None` on a cleanly closed connection.
pub async fn read_request<R>(reader: &mut BufReader<R>) -> Result<Option<Request>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut limited = reader.take(MAX_HEAD_BYTES);

    let mut line = String::new();
    if limited.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_uppercase();
    let target = parts.next().unwrap_or("/").to_string();
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();
    if method.is_empty() {
        return Ok(None);
    }

    let mut headers = Vec::new();
    loop {
        let mut header_line = String::new();
        if limited.read_line(&mut header_line).await? == 0 {
            break;
        }
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.clone(), String::new()),
    };

    let mut request = Request {
        method,
        target,
        path,
        query,
        headers,
        body: String::new(),
        keep_alive: false,
    };

    let content_length = request
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_BODY_BYTES);
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        limited.get_mut().read_exact(&mut body).await?;
        request.body = String::from_utf8_lossy(&body).into_owned();
    }

    let connection = request.header("connection").unwrap_or("").to_lowercase();
    request.keep_alive = match version.as_str() {
        "HTTP/1.1" => connection != "close",
        _ => connection == "keep-alive",
    };

    Ok(Some(request))
}

async fn write_response<W>(
    writer: &mut W,
    status: u16,
    content_type: &str,
    body: &str,
    keep_alive: bool,
) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let connection = if keep_alive { "keep-alive" } else { "close" };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nServer: Apache/2.4.54 (Ubuntu)\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: {connection}\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((
                patterns::percent_decode(k).to_lowercase(),
                patterns::percent_decode(v),
            ))
        })
        .collect()
}

// ── Diagnostics surface ──────────────────────────────────────────────────

async fn diagnostics_response(ctx: &ListenerContext, request: &Request) -> (u16, String) {
    let debug_mode = ctx.config.honeypot.debug_mode;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/monitor") => (200, monitor_body(ctx)),
        ("GET", "/test-heartbeat") => {
            let result = ctx.api.send_heartbeat().await;
            let body = json!({
                "success": result.is_ok(),
                "error": result.err().map(|e| e.to_string()),
                "consecutiveFailures": ctx.api.diagnostics.consecutive_failures(),
            });
            (200, body.to_string())
        }
        ("GET", "/api-diagnostics") if debug_mode => {
            let mut body = json!({
                "config": {
                    "honeypotId": ctx.config.honeypot.id,
                    "endpoint": ctx.api.endpoint(),
                    "offlineMode": ctx.api.offline(),
                    "debugMode": debug_mode,
                    "heartbeatIntervalMs": ctx.config.api.heartbeat_interval_ms,
                },
                "heartbeat": ctx.api.diagnostics.snapshot(),
                "cache": ctx.throttle.stats(),
                "reportFailures": ctx.api.report_failures(),
            });
            // `?ip=A` folds the backend's score for that address into the
            // response.
            if let Some(ip) = parse_form(&request.query).get("ip") {
                body["lookup"] = match ctx.api.lookup_ip(ip).await {
                    Ok(value) => value,
                    Err(err) => json!({ "error": err.to_string() }),
                };
            }
            (200, body.to_string())
        }
        ("GET", "/offline-attacks") if debug_mode => {
            let entries = ctx.api.spool.all().await;
            let body = json!({ "count": entries.len(), "attacks": entries });
            (200, body.to_string())
        }
        ("POST", "/upload-offline-attacks") if debug_mode => match ctx.api.replay_spool().await {
            Ok(summary) => (200, serde_json::to_string(&summary).unwrap_or_default()),
            Err(err) => (500, json!({ "error": err.to_string() }).to_string()),
        },
        ("GET", "/debug") if debug_mode => {
            let body = json!({
                "uptimeSeconds": ctx.started_at.elapsed().as_secs(),
                "modules": ctx.statuses.read().clone(),
            });
            (200, body.to_string())
        }
        (_, "/api-diagnostics" | "/offline-attacks" | "/upload-offline-attacks" | "/debug") => {
            (403, json!({ "error": "debug mode disabled" }).to_string())
        }
        _ => (405, json!({ "error": "method not allowed" }).to_string()),
    }
}

fn monitor_body(ctx: &ListenerContext) -> String {
    json!({
        "honeypot": {
            "id": ctx.config.honeypot.id,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": ctx.started_at.elapsed().as_secs(),
            "api": {
                "endpoint": ctx.api.endpoint(),
                "lastHeartbeat": ctx.api.diagnostics.last_success().map(|t| t.to_rfc3339()),
                "offlineMode": ctx.api.offline(),
            },
            "modules": ctx.statuses.read().clone(),
        }
    })
    .to_string()
}

// ── Lure content ─────────────────────────────────────────────────────────

mod pages {
    pub const INDEX: &str = "<!DOCTYPE html>\n<html><head><title>Acme Intranet Portal</title></head>\n<body><h1>Acme Intranet Portal</h1>\n<p>Welcome. Please <a href=\"/login\">sign in</a> to continue.</p>\n</body></html>\n";

    pub const LOGIN: &str = "<!DOCTYPE html>\n<html><head><title>Sign in</title></head>\n<body><h1>Sign in</h1>\n<form method=\"POST\" action=\"/login\">\n<input name=\"username\" placeholder=\"Username\">\n<input name=\"password\" type=\"password\" placeholder=\"Password\">\n<button type=\"submit\">Sign in</button>\n</form></body></html>\n";

    pub const LOGIN_FAILED: &str = "<!DOCTYPE html>\n<html><head><title>Sign in</title></head>\n<body><h1>Sign in</h1><p>Invalid username or password.</p></body></html>\n";

    pub const NOT_FOUND: &str = "<!DOCTYPE html>\n<html><head><title>404 Not Found</title></head>\n<body><h1>Not Found</h1><p>The requested URL was not found on this server.</p>\n<hr><address>Apache/2.4.54 (Ubuntu) Server</address></body></html>\n";

    pub const ROBOTS: &str = "User-agent: *\nDisallow: /admin\nDisallow: /backup\nDisallow: /internal\n";

    pub fn render(path: &str) -> Option<(u16, &'static str, &'static str)> {
        match path {
            "/" | "/index.html" => Some((200, "text/html", INDEX)),
            "/login" | "/admin" | "/wp-login.php" => Some((200, "text/html", LOGIN)),
            "/robots.txt" => Some((200, "text/plain", ROBOTS)),
            "/favicon.ico" => Some((200, "image/x-icon", "")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, target: &str, ua: &str, body: &str) -> Request {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.to_string(), String::new()),
        };
        Request {
            method: method.to_string(),
            target: target.to_string(),
            path,
            query,
            headers: vec![("User-Agent".to_string(), ua.to_string())],
            body: body.to_string(),
            keep_alive: false,
        }
    }

    #[tokio::test]
    async fn parses_request_line_headers_and_body() {
        let raw = "POST /login HTTP/1.1\r\nHost: trap\r\nContent-Length: 27\r\nUser-Agent: test\r\n\r\nusername=root&password=toor";
        let mut reader = BufReader::new(raw.as_bytes());
        let req = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/login");
        assert_eq!(req.body, "username=root&password=toor");
        assert_eq!(req.user_agent(), "test");
        assert!(req.keep_alive);
    }

    #[tokio::test]
    async fn closed_socket_reads_as_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn sqli_in_query_is_flagged() {
        let req = request("GET", "/search?q=' OR 1=1--", "Mozilla/5.0", "");
        let (kind, _) = inspect_request(&req).unwrap();
        assert_eq!(kind, "http_sql_injection");
    }

    #[test]
    fn endpoint_probe_outranks_other_rules() {
        // A request that matches both the endpoint list and the SQLi list
        // reports the endpoint; matching order is fixed.
        let req = request("GET", "/wp-admin/?q=union select", "Mozilla/5.0", "");
        let (kind, token) = inspect_request(&req).unwrap();
        assert_eq!(kind, "http_suspicious_endpoint");
        assert_eq!(token, "/wp-admin");
    }

    #[test]
    fn scanner_agent_is_the_last_resort() {
        let req = request("GET", "/products", "sqlmap/1.7", "");
        let (kind, token) = inspect_request(&req).unwrap();
        assert_eq!(kind, "suspicious_user_agent");
        assert_eq!(token, "sqlmap");
    }

    #[test]
    fn clean_request_produces_nothing() {
        let req = request("GET", "/index.html", "Mozilla/5.0 (X11; Linux)", "");
        assert!(inspect_request(&req).is_none());
    }

    #[test]
    fn traversal_in_path_is_flagged() {
        let req = request("GET", "/static/..%2f..%2fetc/passwd", "Mozilla/5.0", "");
        let (kind, _) = inspect_request(&req).unwrap();
        assert_eq!(kind, "http_path_traversal");
    }

    #[test]
    fn system_paths_are_recognized() {
        assert!(is_system_path("/monitor"));
        assert!(is_system_path("/api-diagnostics"));
        assert!(is_system_path("/test-heartbeat"));
        assert!(is_system_path("/debug"));
        assert!(!is_system_path("/monitoring"));
        assert!(!is_system_path("/admin"));
    }

    #[test]
    fn form_bodies_decode() {
        let form = parse_form("username=admin&password=p%40ss+word");
        assert_eq!(form["username"], "admin");
        assert_eq!(form["password"], "p@ss word");
    }

    #[test]
    fn lure_pages_cover_login_paths() {
        assert!(pages::render("/").is_some());
        assert!(pages::render("/login").is_some());
        assert!(pages::render("/wp-login.php").is_some());
        assert!(pages::render("/definitely-missing").is_none());
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::protocols::testutil::{offline_context, wait_for_pending};
    use tokio::net::TcpListener;

    async fn serve_once(ctx: ListenerContext) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = handle_session(ctx, stream, peer, Protocol::Http).await;
        });
        addr
    }

    async fn roundtrip(addr: std::net::SocketAddr, request: &str) -> String {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn injection_request_lands_in_the_spool() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = offline_context(&dir);
        ctx.api.init().await.unwrap();
        let api = ctx.api.clone();
        let addr = serve_once(ctx).await;

        let response = roundtrip(
            addr,
            "GET /search?q=%27%20OR%201%3D1-- HTTP/1.1\r\nHost: trap\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"));

        let pending = wait_for_pending(&api, 1).await;
        let sqli = pending
            .iter()
            .find(|e| e.record.attack_type == "sqli_attempt")
            .expect("sqli report spooled");
        assert_eq!(sqli.record.category.as_str(), "injection");
        assert!(sqli.record.severity >= 4);
    }

    #[tokio::test]
    async fn monitor_endpoint_answers_and_stays_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = offline_context(&dir);
        ctx.api.init().await.unwrap();
        let api = ctx.api.clone();
        let addr = serve_once(ctx).await;

        let response = roundtrip(
            addr,
            "GET /monitor HTTP/1.1\r\nHost: trap\r\nUser-Agent: sqlmap/1.7\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["honeypot"]["id"], "test");
        assert!(json["honeypot"]["api"]["offlineMode"].as_bool().unwrap());

        // Even with a scanner user-agent, a system path emits nothing.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(api.spool.pending().await.len(), 0);
    }

    #[tokio::test]
    async fn debug_endpoints_refuse_without_debug_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = offline_context(&dir);
        ctx.api.init().await.unwrap();
        let addr = serve_once(ctx).await;

        let response = roundtrip(
            addr,
            "GET /api-diagnostics HTTP/1.1\r\nHost: trap\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 403"));
    }
}
