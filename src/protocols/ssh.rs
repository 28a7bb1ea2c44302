//! SSH listener: version exchange and key-exchange negotiation, far enough
//! to fingerprint the client and time its behavior. Every session dies at
//! the DH step, so bruteforce tooling burns one TCP connect per attempt and
//! the rapid-connection rule picks up the cadence.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use rand::RngCore;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::detection::SessionStats;
use crate::events::{evidence_json, ObservationEvent, Protocol};
use crate::detection::patterns::match_ssh_scanner;

use super::{ListenerContext, ProtocolService};

const SERVER_IDENT: &str = "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6";

/// Single-shot timer: a peer that connects and never talks is a scanner.
const PORT_SCAN_TIMER: Duration = Duration::from_secs(5);

const SSH_MSG_DISCONNECT: u8 = 1;
const SSH_MSG_KEXINIT: u8 = 20;

pub struct SshService {
    ctx: ListenerContext,
}

impl SshService {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ProtocolService for SshService {
    async fn start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.listeners.listen_ip, self.ctx.config.listeners.ssh.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("ssh listener on {addr}");

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
                            if let Some(event) = ctx.detection.on_connection(Protocol::Ssh, peer) {
                                ctx.pipeline.dispatch(event);
                            }
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer).await {
                                    debug!("ssh session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("ssh accept error: {err}"),
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
        "ssh"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.ssh.port
    }
}

async fn handle_session(ctx: ListenerContext, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut stats = SessionStats::begin();

    stream
        .write_all(format!("{SERVER_IDENT}\r\n").as_bytes())
        .await?;

    let scan_timer = tokio::time::sleep(PORT_SCAN_TIMER);
    tokio::pin!(scan_timer);
    let mut timer_armed = true;

    let mut buf = vec![0u8; 4096];
    let mut client_ident: Option<String> = None;
    let mut kexinit_sent = false;

    loop {
        tokio::select! {
            // Single-shot timer. Auth arrival below and session close both
            // disarm it inside this one task, so cancellation cannot race
            // the firing.
            _ = &mut scan_timer, if timer_armed => {
                timer_armed = false;
                if stats.auth_attempts == 0 {
                    ctx.pipeline.dispatch(timer_scan_event(peer, client_ident.as_deref()));
                }
            }
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!("ssh read error from {peer}: {err}");
                        break;
                    }
                };
                let data = &buf[..n];

                if client_ident.is_none() {
                    let Some(ident) = parse_ident(data) else {
                        // Garbage before an identification string; not SSH.
                        break;
                    };
                    debug!("ssh client ident from {peer}: {ident}");
                    stats.command();
                    client_ident = Some(ident);
                    stream.write_all(&build_kexinit()).await?;
                    kexinit_sent = true;
                } else if kexinit_sent {
                    stats.command();
                    // One read may carry several framed packets. The first
                    // message past KEXINIT is the client pushing toward
                    // authentication; that arrival cancels the scan timer.
                    // No DH is performed, so the session ends here.
                    if contains_post_kex_msg(data) {
                        stats.auth_attempt();
                        timer_armed = false;
                        let _ = stream.write_all(&build_disconnect()).await;
                        break;
                    }
                }
            }
        }
    }

    // A session the timer already reported ran well past the scan-duration
    // cutoff, so the close rule cannot double-report it.
    if let Some(event) = ctx.detection.on_session_close(Protocol::Ssh, peer, &stats) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

fn timer_scan_event(peer: SocketAddr, ident: Option<&str>) -> ObservationEvent {
    let scanner = ident.and_then(match_ssh_scanner);
    ObservationEvent::new(
        peer.ip(),
        peer.port(),
        Protocol::Ssh,
        "port_scan",
        format!(
            "ssh session from {} idle past {}s with no authentication",
            peer.ip(),
            PORT_SCAN_TIMER.as_secs()
        ),
        vec![evidence_json(&json!({
            "client_ident": ident,
            "scanner": scanner,
            "timer_seconds": PORT_SCAN_TIMER.as_secs(),
        }))],
    )
}

/// First line of the version exchange, if the peer sent one.
fn parse_ident(data: &[u8]) -> Option<String> {
    let line = data.split(|b| *b == b'\n').next()?;
    let text = String::from_utf8_lossy(line).trim_end_matches('\r').trim().to_string();
    if text.starts_with("SSH-") {
        Some(text)
    } else {
        None
    }
}

/// Walk the framed packets in one read (uint32 length, padding byte,
/// payload) and report whether any message other than KEXINIT arrived.
fn contains_post_kex_msg(data: &[u8]) -> bool {
    let mut rest = data;
    while rest.len() > 5 {
        if rest[5] != SSH_MSG_KEXINIT {
            return true;
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len == 0 || rest.len() <= 4 + len {
            return false;
        }
        rest = &rest[4 + len..];
    }
    false
}

/// A plausible KEXINIT: cookie plus the algorithm lists of a stock server.
fn build_kexinit() -> Vec<u8> {
    let mut payload = Vec::with_capacity(512);
    payload.push(SSH_MSG_KEXINIT);

    let mut cookie = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    payload.extend_from_slice(&cookie);

    let name_lists = [
        "curve25519-sha256,diffie-hellman-group14-sha256,diffie-hellman-group16-sha512",
        "rsa-sha2-512,rsa-sha2-256,ssh-ed25519",
        "chacha20-poly1305@openssh.com,aes128-ctr,aes256-ctr",
        "chacha20-poly1305@openssh.com,aes128-ctr,aes256-ctr",
        "hmac-sha2-256,hmac-sha2-512",
        "hmac-sha2-256,hmac-sha2-512",
        "none",
        "none",
        "",
        "",
    ];
    for list in name_lists {
        payload.extend_from_slice(&(list.len() as u32).to_be_bytes());
        payload.extend_from_slice(list.as_bytes());
    }
    payload.push(0); // first_kex_packet_follows
    payload.extend_from_slice(&0u32.to_be_bytes()); // reserved

    wrap_packet(payload)
}

fn build_disconnect() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(SSH_MSG_DISCONNECT);
    payload.extend_from_slice(&2u32.to_be_bytes()); // SSH_DISCONNECT_PROTOCOL_ERROR
    let message = b"protocol error";
    payload.extend_from_slice(&(message.len() as u32).to_be_bytes());
    payload.extend_from_slice(message);
    payload.extend_from_slice(&0u32.to_be_bytes()); // language tag
    wrap_packet(payload)
}

/// Binary packet framing: uint32 length, padding length byte, payload,
/// random padding to an 8-byte multiple (minimum 4 bytes of padding).
fn wrap_packet(payload: Vec<u8>) -> Vec<u8> {
    let mut padding_len = 8 - ((payload.len() + 5) % 8);
    if padding_len < 4 {
        padding_len += 8;
    }
    let mut padding = vec![0u8; padding_len];
    rand::thread_rng().fill_bytes(&mut padding);

    let packet_len = (payload.len() + padding_len + 1) as u32;
    let mut packet = Vec::with_capacity(packet_len as usize + 4);
    packet.extend_from_slice(&packet_len.to_be_bytes());
    packet.push(padding_len as u8);
    packet.extend_from_slice(&payload);
    packet.extend_from_slice(&padding);
    packet
}


#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::protocols::testutil::offline_context;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn client_reaching_the_auth_phase_is_not_a_scan() {
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

        // Server ident arrives first.
        let mut buf = vec![0u8; 4096];
        let n = conn.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"SSH-2.0-"));

        conn.write_all(b"SSH-2.0-OpenSSH_9.0\r\n").await.unwrap();
        // Server answers with its KEXINIT; mirror one back, then push a
        // KEXDH_INIT to open the auth phase.
        let _ = conn.read(&mut buf).await.unwrap();
        conn.write_all(&build_kexinit()).await.unwrap();
        conn.write_all(&wrap_packet(vec![30])).await.unwrap();

        // The session dies with a DISCONNECT instead of a DH reply.
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 5);
        assert_eq!(buf[5], SSH_MSG_DISCONNECT);
        drop(conn);

        // Auth arrival cancelled the scan timer and suppressed the
        // close-time scan rule; nothing lands in the spool.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let kinds: Vec<String> = api
            .spool
            .pending()
            .await
            .into_iter()
            .map(|e| e.record.metadata.original_type)
            .collect();
        assert!(kinds.is_empty(), "unexpected events: {kinds:?}");
    }
}
