//! SMTP listener on the relay and submission ports. Accepts envelopes and
//! message data without ever delivering, rejects every AUTH, and judges the
//! whole session at close: harvesting, relay probing, and spam content.

use std::collections::HashSet;
use std::net::SocketAddr;

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::detection::patterns::match_spam;
use crate::detection::{SessionStats, AUTH_FAIL_DELAY};
use crate::events::{evidence_json, ObservationEvent, Protocol};

use super::{ListenerContext, ProtocolService};

const BANNER: &str = "220 mail.acme-corp.example ESMTP Postfix (Ubuntu)";

/// Recipient count past which a session reads as address harvesting.
const HARVEST_RCPT_LIMIT: usize = 10;
/// VRFY/EXPN count past which a session reads as address harvesting.
const HARVEST_PROBE_LIMIT: u32 = 5;
/// Recipients and distinct domains that mark a relay attempt.
const RELAY_RCPT_LIMIT: usize = 5;
const RELAY_DOMAIN_LIMIT: usize = 3;
/// DATA body retention cap.
const DATA_CAP: usize = 256 * 1024;

pub struct SmtpService {
    ctx: ListenerContext,
}

impl SmtpService {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }

    async fn bind_and_serve(ctx: ListenerContext, port: u16) -> Result<()> {
        let addr = format!("{}:{}", ctx.config.listeners.listen_ip, port);
        let listener = TcpListener::bind(&addr).await?;
        info!("smtp listener on {addr}");

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
                            if let Some(event) = ctx.detection.on_connection(Protocol::Smtp, peer) {
                                ctx.pipeline.dispatch(event);
                            }
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer).await {
                                    debug!("smtp session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("smtp accept error: {err}"),
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProtocolService for SmtpService {
    async fn start(&mut self) -> Result<()> {
        let mail = &self.ctx.config.listeners.mail;
        Self::bind_and_serve(self.ctx.clone(), mail.smtp_port).await?;
        // The submission port is best-effort; port 25 is the module.
        if let Err(err) = Self::bind_and_serve(self.ctx.clone(), mail.submission_port).await {
            warn!("smtp submission port {} failed to bind: {err}", mail.submission_port);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.mail.smtp_port
    }
}

/// Everything the close rules need to know about one session.
#[derive(Debug, Default)]
pub struct SmtpSession {
    pub helo: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub vrfy_expn_count: u32,
    pub data_body: String,
}

impl SmtpSession {
    pub fn distinct_domains(&self) -> usize {
        self.rcpt_to
            .iter()
            .filter_map(|addr| addr.split_once('@').map(|(_, d)| d.to_lowercase()))
            .collect::<HashSet<_>>()
            .len()
    }
}

/// The three close-time verdicts, in rule order. More than one can hold.
pub fn close_verdicts(session: &SmtpSession) -> Vec<(&'static str, String)> {
    let mut verdicts = Vec::new();

    if session.rcpt_to.len() > HARVEST_RCPT_LIMIT
        || session.vrfy_expn_count > HARVEST_PROBE_LIMIT
    {
        verdicts.push((
            "email_harvesting",
            format!(
                "{} recipients and {} VRFY/EXPN probes in one session",
                session.rcpt_to.len(),
                session.vrfy_expn_count
            ),
        ));
    }

    if session.rcpt_to.len() > RELAY_RCPT_LIMIT
        && session.distinct_domains() > RELAY_DOMAIN_LIMIT
    {
        verdicts.push((
            "smtp_relay_attempt",
            format!(
                "{} recipients across {} domains",
                session.rcpt_to.len(),
                session.distinct_domains()
            ),
        ));
    }

    if !session.data_body.is_empty() {
        if let Some(indicator) = match_spam(&session.data_body) {
            verdicts.push(("smtp_spam_attempt", format!("message body: {indicator}")));
        }
    }

    verdicts
}

async fn handle_session(ctx: ListenerContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut stats = SessionStats::begin();
    let mut session = SmtpSession::default();
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(format!("{BANNER}\r\n").as_bytes()).await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let input = line.trim_end().to_string();
        let upper = input.to_uppercase();
        debug!("smtp {peer}: {input}");

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            stats.command();
            session.helo = input.split_whitespace().nth(1).unwrap_or("").to_string();
            writer
                .write_all(
                    b"250-mail.acme-corp.example\r\n250-SIZE 10240000\r\n250-VRFY\r\n250-AUTH LOGIN PLAIN\r\n250 8BITMIME\r\n",
                )
                .await?;
        } else if upper.starts_with("MAIL FROM") {
            stats.command();
            session.mail_from = parse_address(&input);
            writer.write_all(b"250 2.1.0 Ok\r\n").await?;
        } else if upper.starts_with("RCPT TO") {
            stats.command();
            session.rcpt_to.push(parse_address(&input));
            writer.write_all(b"250 2.1.5 Ok\r\n").await?;
        } else if upper == "DATA" {
            stats.command();
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;
            read_data(&mut reader, &mut session.data_body).await?;
            writer.write_all(b"250 2.0.0 Ok: queued as 4F1B2C3D4E\r\n").await?;
        } else if upper.starts_with("VRFY") || upper.starts_with("EXPN") {
            stats.command();
            session.vrfy_expn_count += 1;
            writer
                .write_all(b"252 2.0.0 Cannot VRFY user, but will accept message\r\n")
                .await?;
        } else if upper.starts_with("AUTH LOGIN") {
            stats.auth_attempt();
            handle_auth_login(&ctx, &mut reader, &mut writer, peer).await?;
        } else if upper.starts_with("AUTH PLAIN") {
            stats.auth_attempt();
            let blob = input.split_whitespace().nth(2).unwrap_or("").to_string();
            let username = decode_plain_auth(&blob).unwrap_or_default();
            reject_auth(&ctx, &mut writer, peer, &username).await?;
        } else if upper == "NOOP" {
            writer.write_all(b"250 2.0.0 Ok\r\n").await?;
        } else if upper == "RSET" {
            stats.command();
            session.mail_from.clear();
            session.rcpt_to.clear();
            session.data_body.clear();
            writer.write_all(b"250 2.0.0 Ok\r\n").await?;
        } else if upper == "QUIT" {
            writer.write_all(b"221 2.0.0 Bye\r\n").await?;
            break;
        } else if input.is_empty() {
            // keep reading
        } else {
            writer
                .write_all(b"502 5.5.2 Error: command not recognized\r\n")
                .await?;
        }
    }

    for (kind, description) in close_verdicts(&session) {
        ctx.pipeline.dispatch(ObservationEvent::new(
            peer.ip(),
            peer.port(),
            Protocol::Smtp,
            kind,
            description,
            vec![evidence_json(&json!({
                "helo": session.helo,
                "mail_from": session.mail_from,
                "recipients": session.rcpt_to,
                "distinct_domains": session.distinct_domains(),
                "vrfy_expn": session.vrfy_expn_count,
                "data_bytes": session.data_body.len(),
            }))],
        ));
    }

    if let Some(event) = ctx.detection.on_session_close(Protocol::Smtp, peer, &stats) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

async fn handle_auth_login<R, W>(
    ctx: &ListenerContext,
    reader: &mut BufReader<R>,
    writer: &mut W,
    peer: SocketAddr,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWriteExt + Unpin,
{
    // "Username:" / "Password:" prompts, base64 per RFC 4954.
    writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
    let mut user_line = String::new();
    if reader.read_line(&mut user_line).await? == 0 {
        return Ok(());
    }
    let username = decode_base64(user_line.trim()).unwrap_or_default();

    writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
    let mut pass_line = String::new();
    if reader.read_line(&mut pass_line).await? == 0 {
        return Ok(());
    }

    reject_auth(ctx, writer, peer, &username).await
}

async fn reject_auth<W>(
    ctx: &ListenerContext,
    writer: &mut W,
    peer: SocketAddr,
    username: &str,
) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    tokio::time::sleep(AUTH_FAIL_DELAY).await;
    writer
        .write_all(b"535 5.7.8 Error: authentication failed\r\n")
        .await?;
    if let Some(event) = ctx.detection.on_auth_failure(Protocol::Smtp, peer, username) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

/// Collect DATA lines until the lone-dot terminator, retaining at most
/// [`DATA_CAP`] bytes.
async fn read_data<R>(reader: &mut BufReader<R>, body: &mut String) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed == "." {
            break;
        }
        if body.len() < DATA_CAP {
            body.push_str(trimmed);
            body.push('\n');
        }
    }
    Ok(())
}

/// Address out of `MAIL FROM:<a@b>` / `RCPT TO:<a@b>` style lines.
pub fn parse_address(line: &str) -> String {
    if let (Some(start), Some(end)) = (line.find('<'), line.rfind('>')) {
        if start < end {
            return line[start + 1..end].to_string();
        }
    }
    line.split_once(':')
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default()
}

/// AUTH PLAIN blob: base64 of `authzid \0 authcid \0 password`; returns the
/// authcid.
fn decode_plain_auth(blob: &str) -> Option<String> {
    let decoded = decode_base64(blob)?;
    let mut parts = decoded.split('\0');
    parts.next()?;
    parts.next().map(|s| s.to_string())
}

/// Minimal base64 decoder for the two AUTH exchanges; tolerates missing
/// padding, rejects anything outside the standard alphabet.
pub fn decode_base64(input: &str) -> Option<String> {
    fn value(byte: u8) -> Option<u32> {
        match byte {
            b'A'..=b'Z' => Some((byte - b'A') as u32),
            b'a'..=b'z' => Some((byte - b'a' + 26) as u32),
            b'0'..=b'9' => Some((byte - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let trimmed = input.trim_end_matches('=');
    let mut out = Vec::new();
    let mut acc: u32 = 0;
    let mut bits = 0;
    for byte in trimmed.bytes() {
        let v = value(byte)?;
        acc = (acc << 6) | v;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_from_angle_brackets() {
        assert_eq!(parse_address("MAIL FROM:<spam@evil.example>"), "spam@evil.example");
        assert_eq!(parse_address("RCPT TO: <a@b.example>"), "a@b.example");
        assert_eq!(parse_address("RCPT TO: c@d.example"), "c@d.example");
    }

    #[test]
    fn base64_decodes_auth_tokens() {
        assert_eq!(decode_base64("cm9vdA=="), Some("root".to_string()));
        assert_eq!(decode_base64("cm9vdA"), Some("root".to_string()));
        assert_eq!(decode_base64("!!!"), None);
        assert_eq!(
            decode_plain_auth("AGFkbWluAHNlY3JldA=="),
            Some("admin".to_string())
        );
    }

    fn session_with_rcpts(addresses: &[&str]) -> SmtpSession {
        SmtpSession {
            rcpt_to: addresses.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn relay_rule_needs_recipients_and_domains() {
        // Six recipients over four domains: the S3 scenario.
        let session = session_with_rcpts(&[
            "a@one.example",
            "b@two.example",
            "c@three.example",
            "d@four.example",
            "e@one.example",
            "f@two.example",
        ]);
        let verdicts = close_verdicts(&session);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].0, "smtp_relay_attempt");
    }

    #[test]
    fn relay_rule_ignores_single_domain_blasts() {
        let addresses: Vec<String> = (0..8).map(|i| format!("user{i}@same.example")).collect();
        let refs: Vec<&str> = addresses.iter().map(|s| s.as_str()).collect();
        let session = session_with_rcpts(&refs);
        assert!(close_verdicts(&session).is_empty());
    }

    #[test]
    fn harvesting_rule_counts_recipients_or_probes() {
        let addresses: Vec<String> = (0..11).map(|i| format!("u{i}@x{i}.example")).collect();
        let refs: Vec<&str> = addresses.iter().map(|s| s.as_str()).collect();
        let session = session_with_rcpts(&refs);
        let kinds: Vec<_> = close_verdicts(&session).into_iter().map(|(k, _)| k).collect();
        assert!(kinds.contains(&"email_harvesting"));

        let probing = SmtpSession {
            vrfy_expn_count: 6,
            ..Default::default()
        };
        let kinds: Vec<_> = close_verdicts(&probing).into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["email_harvesting"]);
    }

    #[test]
    fn spam_rule_judges_data_body() {
        let session = SmtpSession {
            data_body: "limited time offer, act now".to_string(),
            ..Default::default()
        };
        let kinds: Vec<_> = close_verdicts(&session).into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["smtp_spam_attempt"]);
    }

    #[test]
    fn quiet_sessions_produce_no_verdicts() {
        let session = session_with_rcpts(&["a@one.example"]);
        assert!(close_verdicts(&session).is_empty());
    }

    #[tokio::test]
    async fn data_reader_stops_at_lone_dot() {
        let raw = "line one\r\nline two\r\n.\r\nMAIL FROM:<x@y>\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let mut body = String::new();
        read_data(&mut reader, &mut body).await.unwrap();
        assert_eq!(body, "line one\nline two\n");
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::protocols::testutil::{offline_context, wait_for_pending};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn relay_probe_session_is_reported_as_mail_spam() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = offline_context(&dir);
        ctx.api.init().await.unwrap();
        let api = ctx.api.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = handle_session(ctx, stream, peer).await;
        });

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let script = "EHLO spammer.example\r\n\
                      MAIL FROM:<bulk@spammer.example>\r\n\
                      RCPT TO:<a@one.example>\r\n\
                      RCPT TO:<b@two.example>\r\n\
                      RCPT TO:<c@three.example>\r\n\
                      RCPT TO:<d@four.example>\r\n\
                      RCPT TO:<e@one.example>\r\n\
                      RCPT TO:<f@two.example>\r\n\
                      QUIT\r\n";
        conn.write_all(script.as_bytes()).await.unwrap();
        let mut sink = Vec::new();
        let _ = conn.read_to_end(&mut sink).await;

        let pending = wait_for_pending(&api, 1).await;
        let relay = pending
            .iter()
            .find(|e| e.record.attack_type == "mail_spam")
            .expect("relay attempt classified as mail_spam");
        assert_eq!(relay.record.metadata.original_type, "smtp_relay_attempt");
        assert!(relay.record.evidence[0].contains("four.example"));
    }
}
