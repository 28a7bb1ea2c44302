//! HTTPS listener: accepts TLS connections and reads just the ClientHello.
//! Certificates and termination belong to the deployment, not this module;
//! what detection needs is the connection cadence and the SNI the scanner
//! asked for.

use std::net::SocketAddr;

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::detection::SessionStats;
use crate::events::{evidence_json, Protocol};

use super::{ListenerContext, ProtocolService};

const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0;

pub struct HttpsService {
    ctx: ListenerContext,
}

impl HttpsService {
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ProtocolService for HttpsService {
    async fn start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.listeners.listen_ip, self.ctx.config.listeners.https.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("https listener on {addr}");

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
                            if let Some(event) = ctx.detection.on_connection(Protocol::Https, peer) {
                                ctx.pipeline.dispatch(event);
                            }
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_session(ctx, stream, peer).await {
                                    debug!("https session from {peer} ended with error: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("https accept error: {err}"),
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
        "https"
    }

    fn port(&self) -> u16 {
        self.ctx.config.listeners.https.port
    }
}

async fn handle_session(ctx: ListenerContext, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let stats = SessionStats::begin();

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap_or(0);
    let sni = parse_sni(&buf[..n]);
    if let Some(name) = &sni {
        debug!("https clienthello from {peer} with sni '{name}'");
    }
    // No certificate to offer; the handshake dies here.
    drop(stream);

    if let Some(mut event) = ctx.detection.on_session_close(Protocol::Https, peer, &stats) {
        if let Some(name) = sni {
            event.evidence.push(evidence_json(&json!({ "sni": name })));
        }
        ctx.pipeline.dispatch(event);
    }
    Ok(())
}

/// Pull the server_name extension out of a raw ClientHello, if present.
pub fn parse_sni(data: &[u8]) -> Option<String> {
    // TLS record header: type, version (2), length (2).
    if data.len() < 5 || data[0] != TLS_HANDSHAKE {
        return None;
    }
    let record = data.get(5..5 + u16::from_be_bytes([data[3], data[4]]) as usize)?;

    // Handshake header: type, length (3).
    if record.len() < 4 || record[0] != CLIENT_HELLO {
        return None;
    }
    let mut pos = 4;

    // client_version + random
    pos += 2 + 32;
    // session_id
    let session_len = *record.get(pos)? as usize;
    pos += 1 + session_len;
    // cipher_suites
    let cipher_len = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
    pos += 2 + cipher_len;
    // compression_methods
    let compression_len = *record.get(pos)? as usize;
    pos += 1 + compression_len;
    // extensions
    let ext_total = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
    pos += 2;
    let extensions = record.get(pos..pos + ext_total)?;

    let mut cursor = 0;
    while cursor + 4 <= extensions.len() {
        let ext_type = u16::from_be_bytes([extensions[cursor], extensions[cursor + 1]]);
        let ext_len =
            u16::from_be_bytes([extensions[cursor + 2], extensions[cursor + 3]]) as usize;
        cursor += 4;
        let body = extensions.get(cursor..cursor + ext_len)?;
        if ext_type == SNI_EXTENSION && body.len() >= 5 {
            // server_name_list: length (2), type (1), name length (2), name.
            let name_len = u16::from_be_bytes([body[3], body[4]]) as usize;
            let name = body.get(5..5 + name_len)?;
            return Some(String::from_utf8_lossy(name).into_owned());
        }
        cursor += ext_len;
    }
    None
}
