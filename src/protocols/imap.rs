//! IMAP listener: tagged-command parsing, always-failing LOGIN and
//! AUTHENTICATE, nothing past the auth wall.

use std::net::SocketAddr;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::detection::{SessionStats, AUTH_FAIL_DELAY};
use crate::events::Protocol;

use super::smtp::decode_base64;
use super::{ListenerContext, ProtocolService};

const BANNER: &str = "* OK [CAPABILITY IMAP4rev1 LITERAL+ SASL-IR AUTH=PLAIN AUTH=LOGIN] Dovecot (Ubuntu) ready.";

pub struct ImapService {
    ctx: ListenerContext,
}

impl ImapService {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ProtocolService for ImapService {
    async fn start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.listeners.listen_ip, self.ctx.config.listeners.mail.imap_port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("imap listener on {addr}");

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
                            if let Some(event) = ctx.detection.on_connection(Protocol::Imap, peer) {
                                ctx.pipeline.dispatch(event);
                            }
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer).await {
                                    debug!("imap session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("imap accept error: {err}"),
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
        "imap"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.mail.imap_port
    }
}

/// `tag COMMAND [args]`; the tag is echoed on every completion line.
pub fn parse_command(input: &str) -> Option<(&str, String, &str)> {
    let mut parts = input.splitn(3, ' ');
    let tag = parts.next().filter(|t| !t.is_empty())?;
    let command = parts.next()?.to_uppercase();
    let rest = parts.next().unwrap_or("").trim();
    Some((tag, command, rest))
}

async fn handle_session(ctx: ListenerContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut stats = SessionStats::begin();
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(format!("{BANNER}\r\n").as_bytes()).await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let input = line.trim_end();
        let Some((tag, command, rest)) = parse_command(input) else {
            writer.write_all(b"* BAD Invalid command\r\n").await?;
            continue;
        };
        debug!("imap {peer}: {tag} {command}");

        match command.as_str() {
            "CAPABILITY" => {
                stats.command();
                writer
                    .write_all(b"* CAPABILITY IMAP4rev1 LITERAL+ SASL-IR AUTH=PLAIN AUTH=LOGIN\r\n")
                    .await?;
                writer
                    .write_all(format!("{tag} OK Capability completed.\r\n").as_bytes())
                    .await?;
            }
            "LOGIN" => {
                stats.auth_attempt();
                let username = rest
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .trim_matches('"');
                tokio::time::sleep(AUTH_FAIL_DELAY).await;
                writer
                    .write_all(
                        format!("{tag} NO [AUTHENTICATIONFAILED] Authentication failed.\r\n")
                            .as_bytes(),
                    )
                    .await?;
                if let Some(event) = ctx.detection.on_auth_failure(Protocol::Imap, peer, username) {
                    ctx.pipeline.dispatch(event);
                }
            }
            "AUTHENTICATE" => {
                stats.auth_attempt();
                // Continuation request, then one base64 response line.
                writer.write_all(b"+ \r\n").await?;
                let mut blob = String::new();
                if reader.read_line(&mut blob).await? == 0 {
                    break;
                }
                let username = decode_base64(blob.trim())
                    .and_then(|d| d.split('\0').nth(1).map(|s| s.to_string()))
                    .unwrap_or_default();
                tokio::time::sleep(AUTH_FAIL_DELAY).await;
                writer
                    .write_all(
                        format!("{tag} NO [AUTHENTICATIONFAILED] Authentication failed.\r\n")
                            .as_bytes(),
                    )
                    .await?;
                if let Some(event) = ctx.detection.on_auth_failure(Protocol::Imap, peer, &username) {
                    ctx.pipeline.dispatch(event);
                }
            }
            "NOOP" => {
                writer
                    .write_all(format!("{tag} OK NOOP completed.\r\n").as_bytes())
                    .await?;
            }
            "LOGOUT" => {
                writer.write_all(b"* BYE Logging out\r\n").await?;
                writer
                    .write_all(format!("{tag} OK Logout completed.\r\n").as_bytes())
                    .await?;
                break;
            }
            "LIST" | "SELECT" | "EXAMINE" | "FETCH" | "STATUS" => {
                stats.command();
                writer
                    .write_all(format!("{tag} NO Please authenticate first.\r\n").as_bytes())
                    .await?;
            }
            _ => {
                writer
                    .write_all(format!("{tag} BAD Unknown command.\r\n").as_bytes())
                    .await?;
            }
        }
    }

    if let Some(event) = ctx.detection.on_session_close(Protocol::Imap, peer, &stats) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}
