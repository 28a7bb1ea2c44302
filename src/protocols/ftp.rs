//! FTP listener: a vsftpd-looking control channel that rejects every login
//! and accepts one capped passive-mode upload per session so drop tools
//! reveal their payloads.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::detection::{SessionStats, AUTH_FAIL_DELAY};
use crate::events::{evidence_json, ObservationEvent, Protocol};

use super::{ListenerContext, ProtocolService};

const BANNER: &str = "220 (vsFTPd 3.0.5)";

/// Upload slurp cap; enough to fingerprint a dropper, too little to be
/// useful as free storage.
const UPLOAD_CAP: usize = 1024;

/// How long a passive data connection may take to arrive.
const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FtpService {
    ctx: ListenerContext,
}

impl FtpService {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ProtocolService for FtpService {
    async fn start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.listeners.listen_ip, self.ctx.config.listeners.ftp.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("ftp listener on {addr}");

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
                            if let Some(event) = ctx.detection.on_connection(Protocol::Ftp, peer) {
                                ctx.pipeline.dispatch(event);
                            }
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer).await {
                                    debug!("ftp session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("ftp accept error: {err}"),
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
        "ftp"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.ftp.port
    }
}

async fn handle_session(ctx: ListenerContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut stats = SessionStats::begin();
    let local_ip = stream.local_addr().map(|a| a.ip()).unwrap_or(IpAddr::from([127, 0, 0, 1]));
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(format!("{BANNER}\r\n").as_bytes()).await?;

    let mut username = String::new();
    let mut data_listener: Option<TcpListener> = None;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let input = line.trim_end();
        let (command, argument) = split_command(input);
        debug!("ftp {peer}: {command} {argument}");

        match command.as_str() {
            "USER" => {
                stats.command();
                username = argument.to_string();
                writer
                    .write_all(b"331 Please specify the password.\r\n")
                    .await?;
            }
            "PASS" => {
                stats.auth_attempt();
                tokio::time::sleep(AUTH_FAIL_DELAY).await;
                writer.write_all(b"530 Login incorrect.\r\n").await?;
                if let Some(event) = ctx.detection.on_auth_failure(Protocol::Ftp, peer, &username) {
                    ctx.pipeline.dispatch(event);
                }
            }
            "SYST" => {
                stats.command();
                writer.write_all(b"215 UNIX Type: L8\r\n").await?;
            }
            "FEAT" => {
                stats.command();
                writer
                    .write_all(b"211-Features:\r\n PASV\r\n SIZE\r\n UTF8\r\n211 End\r\n")
                    .await?;
            }
            "PWD" => {
                stats.command();
                writer.write_all(b"257 \"/\" is the current directory\r\n").await?;
            }
            "TYPE" => {
                stats.command();
                writer.write_all(b"200 Switching to Binary mode.\r\n").await?;
            }
            "CWD" => {
                stats.command();
                writer.write_all(b"250 Directory successfully changed.\r\n").await?;
            }
            "PASV" => {
                stats.command();
                match open_data_listener(local_ip).await {
                    Ok((listener, reply)) => {
                        data_listener = Some(listener);
                        writer.write_all(reply.as_bytes()).await?;
                    }
                    Err(err) => {
                        debug!("ftp passive listener failed: {err}");
                        writer.write_all(b"425 Can't open data connection.\r\n").await?;
                    }
                }
            }
            "STOR" => {
                stats.command();
                match data_listener.take() {
                    Some(listener) => {
                        writer
                            .write_all(b"150 Ok to send data.\r\n")
                            .await?;
                        match receive_upload(listener).await {
                            Ok((size, preview)) => {
                                writer.write_all(b"226 Transfer complete.\r\n").await?;
                                ctx.pipeline.dispatch(upload_event(peer, argument, size, &preview));
                            }
                            Err(err) => {
                                debug!("ftp upload from {peer} failed: {err}");
                                writer.write_all(b"426 Connection closed; transfer aborted.\r\n").await?;
                            }
                        }
                    }
                    None => {
                        writer.write_all(b"425 Use PASV first.\r\n").await?;
                    }
                }
            }
            "LIST" | "NLST" => {
                stats.command();
                writer.write_all(b"425 Use PASV first.\r\n").await?;
            }
            "RETR" => {
                stats.command();
                writer.write_all(b"550 Failed to open file.\r\n").await?;
            }
            "QUIT" => {
                writer.write_all(b"221 Goodbye.\r\n").await?;
                break;
            }
            "" => {}
            _ => {
                writer.write_all(b"500 Unknown command.\r\n").await?;
            }
        }
    }

    if let Some(event) = ctx.detection.on_session_close(Protocol::Ftp, peer, &stats) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

fn split_command(input: &str) -> (String, &str) {
    match input.split_once(' ') {
        Some((cmd, arg)) => (cmd.to_uppercase(), arg.trim()),
        None => (input.to_uppercase(), ""),
    }
}

/// Bind an ephemeral port and format the 227 reply for it.
async fn open_data_listener(local_ip: IpAddr) -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind((local_ip, 0)).await?;
    let port = listener.local_addr()?.port();
    let octets = match local_ip {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => [127, 0, 0, 1],
    };
    let reply = format!(
        "227 Entering Passive Mode ({},{},{},{},{},{}).\r\n",
        octets[0],
        octets[1],
        octets[2],
        octets[3],
        port / 256,
        port % 256
    );
    Ok((listener, reply))
}

/// Accept one data connection and slurp at most [`UPLOAD_CAP`] bytes.
async fn receive_upload(listener: TcpListener) -> Result<(usize, String)> {
    let (mut conn, _) =
        tokio::time::timeout(DATA_ACCEPT_TIMEOUT, listener.accept()).await??;
    let mut data = vec![0u8; UPLOAD_CAP];
    let mut total = 0;
    while total < UPLOAD_CAP {
        let n = conn.read(&mut data[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    data.truncate(total);
    let preview = String::from_utf8_lossy(&data)
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .take(256)
        .collect();
    Ok((total, preview))
}

fn upload_event(peer: SocketAddr, filename: &str, size: usize, preview: &str) -> ObservationEvent {
    ObservationEvent::new(
        peer.ip(),
        peer.port(),
        Protocol::Ftp,
        "malware_upload",
        format!("ftp upload '{filename}' from {} ({size} bytes captured)", peer.ip()),
        vec![evidence_json(&json!({
            "filename": filename,
            "bytes_captured": size,
            "preview": preview,
        }))],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_split_case_insensitively() {
        assert_eq!(split_command("user root"), ("USER".to_string(), "root"));
        assert_eq!(split_command("QUIT"), ("QUIT".to_string(), ""));
        assert_eq!(split_command("stor  evil.sh "), ("STOR".to_string(), "evil.sh"));
    }

    #[tokio::test]
    async fn passive_reply_encodes_port() {
        let (listener, reply) = open_data_listener(IpAddr::from([127, 0, 0, 1])).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(reply.starts_with("227 Entering Passive Mode (127,0,0,1,"));
        assert!(reply.contains(&format!("{},{}", port / 256, port % 256)));
    }

    #[tokio::test]
    async fn uploads_are_capped() {
        let (listener, _) = open_data_listener(IpAddr::from([127, 0, 0, 1])).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sender = tokio::spawn(async move {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(&vec![b'A'; 4096]).await.unwrap();
        });

        let (size, preview) = receive_upload(listener).await.unwrap();
        sender.await.unwrap();
        assert_eq!(size, UPLOAD_CAP);
        assert!(preview.starts_with("AAAA"));
        assert!(preview.len() <= 256);
    }

    #[test]
    fn upload_event_is_malware_labelled() {
        let peer: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        let event = upload_event(peer, "bot.bin", 512, "MZ...");
        assert_eq!(event.kind, "malware_upload");
        assert!(event.evidence[0].contains("bot.bin"));
    }
}
