//! Protocol listeners. One self-contained module per emulated service; the
//! manager owns enablement, per-module status, and shutdown signalling.

pub mod ftp;
pub mod http;
pub mod https;
pub mod imap;
pub mod mysql;
pub mod pop3;
pub mod smtp;
pub mod ssh;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::api::ApiClient;
use crate::config::Config;
use crate::detection::DetectionEngine;
use crate::pipeline::Pipeline;
use crate::throttle::ThrottleCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Running,
    Disabled,
    Error,
}

/// Per-module health, surfaced through `/monitor`.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub name: &'static str,
    pub port: u16,
    pub status: ModuleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a listener needs: configuration, the report pipeline, the
/// shared detection engine, and the shutdown signal. Cheap to clone.
#[derive(Clone)]
pub struct ListenerContext {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub detection: Arc<DetectionEngine>,
    pub api: Arc<ApiClient>,
    pub throttle: Arc<ThrottleCache>,
    pub statuses: Arc<RwLock<Vec<ModuleStatus>>>,
    pub started_at: Instant,
    pub shutdown: watch::Receiver<bool>,
}

#[async_trait::async_trait]
pub trait ProtocolService: Send + Sync {
    /// Bind the port and spawn the accept loop.
    async fn start(&mut self) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
    fn name(&self) -> &'static str;
    fn port(&self) -> u16;
}

pub struct ProtocolManager {
    services: Vec<Box<dyn ProtocolService>>,
    statuses: Arc<RwLock<Vec<ModuleStatus>>>,
}

impl ProtocolManager {
    /// Build and start every enabled listener. A single failed bind is
    /// recorded as a module error; startup only fails when nothing could
    /// be started at all.
    pub async fn new(ctx: &ListenerContext) -> Result<Self> {
        let config = &ctx.config.listeners;
        let mut services: Vec<Box<dyn ProtocolService>> = Vec::new();

        if config.http.enabled {
            services.push(Box::new(http::HttpService::new(ctx.clone())));
        }
        if config.https.enabled {
            services.push(Box::new(https::HttpsService::new(ctx.clone())));
        }
        if config.ssh.enabled {
            services.push(Box::new(ssh::SshService::new(ctx.clone())));
        }
        if config.ftp.enabled {
            services.push(Box::new(ftp::FtpService::new(ctx.clone())));
        }
        if config.mail.enabled {
            services.push(Box::new(smtp::SmtpService::new(ctx.clone())));
            services.push(Box::new(pop3::Pop3Service::new(ctx.clone())));
            services.push(Box::new(imap::ImapService::new(ctx.clone())));
        }
        if config.mysql.enabled {
            services.push(Box::new(mysql::MysqlService::new(ctx.clone())));
        }

        if services.is_empty() {
            bail!("no listeners enabled; refusing to start");
        }

        let statuses = ctx.statuses.clone();
        let mut running = 0usize;
        for service in &mut services {
            match service.start().await {
                Ok(()) => {
                    running += 1;
                    statuses.write().push(ModuleStatus {
                        name: service.name(),
                        port: service.port(),
                        status: ModuleState::Running,
                        error: None,
                    });
                }
                Err(err) => {
                    log::error!("{} listener failed to start: {err}", service.name());
                    statuses.write().push(ModuleStatus {
                        name: service.name(),
                        port: service.port(),
                        status: ModuleState::Error,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        if running == 0 {
            bail!("every enabled listener failed to start");
        }

        Ok(Self { services, statuses })
    }

    pub fn statuses(&self) -> Vec<ModuleStatus> {
        self.statuses.read().clone()
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        for service in &mut self.services {
            log::info!("shutting down {} listener", service.name());
            service.shutdown().await?;
        }
        Ok(())
    }
}
