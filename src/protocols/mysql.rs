//! MySQL listener: a protocol-10 handshake with a random salt, an access
//! denial for every login, and best-effort query sniffing for clients that
//! push a COM_QUERY anyway. The session never reaches an authenticated
//! state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use log::{debug, info, warn};
use rand::Rng;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::detection::patterns::match_sqli;
use crate::detection::{SessionStats, AUTH_FAIL_DELAY};
use crate::events::{evidence_json, ObservationEvent, Protocol};

use super::{ListenerContext, ProtocolService};

const SERVER_VERSION: &str = "8.0.32-0ubuntu0.22.04.2";
const PROTOCOL_VERSION: u8 = 0x0a;
const AUTH_PLUGIN: &[u8] = b"mysql_native_password";

const ERR_ACCESS_DENIED: u16 = 1045;
const SQLSTATE_ACCESS_DENIED: &str = "28000";

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;

/// Payload cap for a single client packet.
const MAX_PACKET: usize = 16 * 1024;

static CONNECTION_ID: AtomicU32 = AtomicU32::new(100);

pub struct MysqlService {
    ctx: ListenerContext,
}

impl MysqlService {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ProtocolService for MysqlService {
    async fn start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.listeners.listen_ip, self.ctx.config.listeners.mysql.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("mysql listener on {addr}");

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
                            if let Some(event) = ctx.detection.on_connection(Protocol::Mysql, peer) {
                                ctx.pipeline.dispatch(event);
                            }
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer).await {
                                    debug!("mysql session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("mysql accept error: {err}"),
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
        "mysql"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.mysql.port
    }
}

async fn handle_session(ctx: ListenerContext, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut stats = SessionStats::begin();

    let connection_id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let salt = random_salt();
    stream.write_all(&build_handshake(connection_id, &salt)).await?;

    // Handshake response carries the username in cleartext.
    if let Some((_, payload)) = read_packet(&mut stream).await? {
        stats.auth_attempt();
        let username = parse_username(&payload).unwrap_or_default();
        debug!("mysql auth attempt from {peer} as '{username}'");

        tokio::time::sleep(AUTH_FAIL_DELAY).await;
        let message = format!(
            "Access denied for user '{username}'@'{}' (using password: YES)",
            peer.ip()
        );
        stream
            .write_all(&build_err(2, ERR_ACCESS_DENIED, SQLSTATE_ACCESS_DENIED, &message))
            .await?;

        if let Some(event) = ctx.detection.on_auth_failure(Protocol::Mysql, peer, &username) {
            ctx.pipeline.dispatch(event);
        }

        // Some tooling fires a query without caring about the denial. The
        // session is still unauthenticated; we only sniff and deny.
        while let Some((seq, payload)) = read_packet(&mut stream).await? {
            match payload.first().copied() {
                Some(COM_QUERY) if payload.len() > 1 => {
                    stats.command();
                    let query = String::from_utf8_lossy(&payload[1..]).into_owned();
                    if let Some(token) = match_sqli(&query) {
                        ctx.pipeline.dispatch(query_event(peer, &query, token));
                    }
                    stream
                        .write_all(&build_err(
                            seq.wrapping_add(1),
                            ERR_ACCESS_DENIED,
                            SQLSTATE_ACCESS_DENIED,
                            "Access denied; please authenticate",
                        ))
                        .await?;
                }
                Some(COM_QUIT) => break,
                _ => {
                    stream
                        .write_all(&build_err(
                            seq.wrapping_add(1),
                            ERR_ACCESS_DENIED,
                            SQLSTATE_ACCESS_DENIED,
                            "Access denied; please authenticate",
                        ))
                        .await?;
                }
            }
        }
    }

    if let Some(event) = ctx.detection.on_session_close(Protocol::Mysql, peer, &stats) {
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

fn query_event(peer: SocketAddr, query: &str, token: &str) -> ObservationEvent {
    ObservationEvent::new(
        peer.ip(),
        peer.port(),
        Protocol::Mysql,
        "mysql_sql_injection",
        format!("mysql query from {} matched '{token}'", peer.ip()),
        vec![evidence_json(&json!({
            "query": query.chars().take(512).collect::<String>(),
            "matched": token,
        }))],
    )
}

/// 20 salt bytes in the 1..=127 range MySQL uses, never NUL.
fn random_salt() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 20];
    for byte in &mut salt {
        *byte = rng.gen_range(1..=127);
    }
    salt
}

/// Protocol-10 handshake: version, null-terminated server version,
/// connection id, split salt, capability/charset/status words, plugin
/// length, ten reserved zeros, and the auth plugin name.
pub fn build_handshake(connection_id: u32, salt: &[u8; 20]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    payload.push(PROTOCOL_VERSION);
    payload.extend_from_slice(SERVER_VERSION.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&connection_id.to_le_bytes());
    payload.extend_from_slice(&salt[..8]);
    payload.push(0);
    payload.extend_from_slice(&0xf7feu16.to_le_bytes()); // capabilities (lower)
    payload.push(0x21); // utf8_general_ci
    payload.extend_from_slice(&0x0002u16.to_le_bytes()); // autocommit
    payload.extend_from_slice(&0x81ffu16.to_le_bytes()); // capabilities (upper)
    payload.push(21); // auth plugin data length
    payload.extend_from_slice(&[0u8; 10]);
    payload.extend_from_slice(&salt[8..]);
    payload.push(0);
    payload.extend_from_slice(AUTH_PLUGIN);
    payload.push(0);
    frame(0, &payload)
}

/// ERR packet: 0xFF marker, error code, `#`, five-char SQL state, message.
pub fn build_err(seq: u8, code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(message.len() + 9);
    payload.push(0xff);
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(sqlstate.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    frame(seq, &payload)
}

/// Wire framing: 3-byte little-endian length plus a sequence byte.
fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut packet = Vec::with_capacity(len + 4);
    packet.push((len & 0xff) as u8);
    packet.push(((len >> 8) & 0xff) as u8);
    packet.push(((len >> 16) & 0xff) as u8);
    packet.push(seq);
    packet.extend_from_slice(payload);
    packet
}

/// One framed packet, or `None` at EOF.
async fn read_packet(stream: &mut TcpStream) -> Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    if len == 0 || len > MAX_PACKET {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    match stream.read_exact(&mut payload).await {
        Ok(_) => Ok(Some((header[3], payload))),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Handshake response 41: 4 bytes client flags, 4 bytes max packet size,
/// one charset byte, 23 reserved bytes, then the null-terminated username.
pub fn parse_username(payload: &[u8]) -> Option<String> {
    const FIXED_PREFIX: usize = 4 + 4 + 1 + 23;
    let rest = payload.get(FIXED_PREFIX..)?;
    let end = rest.iter().position(|b| *b == 0)?;
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}


#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::protocols::testutil::offline_context;
    use tokio::net::TcpListener;

    fn auth_packet(username: &str) -> Vec<u8> {
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(username.as_bytes());
        payload.push(0);
        payload.push(0); // empty auth response
        frame(1, &payload)
    }

    #[tokio::test]
    async fn login_attempt_is_denied_with_1045() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = offline_context(&dir);
        ctx.api.init().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = handle_session(ctx, stream, peer).await;
        });

        let mut conn = TcpStream::connect(addr).await.unwrap();

        // Server greeting first.
        let mut header = [0u8; 4];
        conn.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut greeting = vec![0u8; len];
        conn.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[0], PROTOCOL_VERSION);

        conn.write_all(&auth_packet("probe")).await.unwrap();

        conn.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut err = vec![0u8; len];
        conn.read_exact(&mut err).await.unwrap();
        assert_eq!(err[0], 0xff);
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), ERR_ACCESS_DENIED);
        assert_eq!(&err[4..9], b"28000");
        let message = String::from_utf8_lossy(&err[9..]);
        assert!(message.contains("probe"));
    }
}
