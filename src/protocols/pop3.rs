//! POP3 listener: credential collection on a mailbox that never opens.

use std::net::SocketAddr;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::detection::{SessionStats, AUTH_FAIL_DELAY};
use crate::events::Protocol;

use super::{ListenerContext, ProtocolService};

const BANNER: &str = "+OK Dovecot (Ubuntu) ready.";

pub struct Pop3Service {
    ctx: ListenerContext,
}

impl Pop3Service {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ProtocolService for Pop3Service {
    async fn start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.listeners.listen_ip, self.ctx.config.listeners.mail.pop3_port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("pop3 listener on {addr}");

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
                            if let Some(event) = ctx.detection.on_connection(Protocol::Pop3, peer) {
                                ctx.pipeline.dispatch(event);
                            }
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer).await {
                                    debug!("pop3 session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("pop3 accept error: {err}"),
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
        "pop3"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.mail.pop3_port
    }
}

async fn handle_session(ctx: ListenerContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut stats = SessionStats::begin();
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(format!("{BANNER}\r\n").as_bytes()).await?;

    let mut username = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let input = line.trim_end();
        let (command, argument) = split_command(input);
        debug!("pop3 {peer}: {command}");

        match command.as_str() {
            "USER" => {
                stats.command();
                username = argument.to_string();
                writer.write_all(b"+OK\r\n").await?;
            }
            "PASS" => {
                stats.auth_attempt();
                tokio::time::sleep(AUTH_FAIL_DELAY).await;
                writer
                    .write_all(b"-ERR [AUTH] Authentication failed.\r\n")
                    .await?;
                if let Some(event) = ctx.detection.on_auth_failure(Protocol::Pop3, peer, &username) {
                    ctx.pipeline.dispatch(event);
                }
            }
            "CAPA" => {
                stats.command();
                writer
                    .write_all(b"+OK\r\nUSER\r\nUIDL\r\nTOP\r\n.\r\n")
                    .await?;
            }
            "APOP" => {
                stats.auth_attempt();
                tokio::time::sleep(AUTH_FAIL_DELAY).await;
                writer
                    .write_all(b"-ERR [AUTH] Authentication failed.\r\n")
                    .await?;
                if let Some(event) =
                    ctx.detection.on_auth_failure(Protocol::Pop3, peer, apop_username(argument))
                {
                    ctx.pipeline.dispatch(event);
                }
            }
            "STAT" | "LIST" | "RETR" | "DELE" | "UIDL" | "TOP" => {
                stats.command();
                writer
                    .write_all(b"-ERR [AUTH] Command requires authentication.\r\n")
                    .await?;
            }
            "NOOP" => {
                writer.write_all(b"+OK\r\n").await?;
            }
            "QUIT" => {
                writer.write_all(b"+OK Logging out.\r\n").await?;
                break;
            }
            "" => {}
            _ => {
                writer.write_all(b"-ERR Unknown command.\r\n").await?;
            }
        }
    }

    if let Some(event) = ctx.detection.on_session_close(Protocol::Pop3, peer, &stats) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

fn split_command(input: &str) -> (String, &str) {
    match input.split_once(' ') {
        Some((command, argument)) => (command.to_uppercase(), argument.trim()),
        None => (input.to_uppercase(), ""),
    }
}

/// APOP takes `name digest`; only the name feeds the auth tracker.
fn apop_username(argument: &str) -> &str {
    argument.split_whitespace().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_split_case_insensitively() {
        assert_eq!(split_command("user root"), ("USER".to_string(), "root"));
        assert_eq!(split_command("PASS  hunter2 "), ("PASS".to_string(), "hunter2"));
        assert_eq!(split_command("quit"), ("QUIT".to_string(), ""));
        assert_eq!(split_command(""), (String::new(), ""));
    }

    #[test]
    fn apop_argument_yields_only_the_name() {
        assert_eq!(apop_username("root c4c9334bac560ecc979e58001b3e22fb"), "root");
        assert_eq!(apop_username("root"), "root");
        assert_eq!(apop_username(""), "");
    }
}
