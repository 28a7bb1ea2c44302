mod api;
mod attack_log;
mod classify;
mod config;
mod detection;
mod events;
mod pipeline;
mod protocols;
mod throttle;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use log::{info, warn};
use parking_lot::RwLock;
use tokio::sync::watch;

use api::{ApiClient, ApiClientConfig};
use attack_log::AttackLog;
use config::Config;
use detection::trackers::{self, Trackers};
use detection::DetectionEngine;
use pipeline::Pipeline;
use protocols::{ListenerContext, ProtocolManager};
use throttle::{ThrottleCache, ThrottleConfig};

/// Grace period for in-flight sessions after the stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about = "ServiceTrap - multi-protocol service honeypot", long_about = None)]
struct Args {
    /// Optional TOML configuration file; the environment always overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("servicetrap v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load(args.config.as_deref())?);
    if !config.any_listener_enabled() {
        bail!("no listeners enabled; set at least one ENABLE_* variable");
    }
    if config.api.key.is_empty() && !config.api.offline_mode {
        warn!("API_KEY is not set; reports will be rejected by the backend");
    }

    // Reporting chain: classification is pure, throttling and the API
    // client are shared by every listener.
    let api = Arc::new(ApiClient::new(ApiClientConfig {
        endpoint: config.api.endpoint.clone(),
        api_key: config.api.key.clone(),
        honeypot_id: config.honeypot.id.clone(),
        offline_mode: config.api.offline_mode,
        debug_mode: config.honeypot.debug_mode,
        heartbeat_interval: config.heartbeat_interval(),
        heartbeat_retry_count: config.api.heartbeat_retry_count,
        heartbeat_retry_delay: config.heartbeat_retry_delay(),
        spool_path: config.spool_path(),
    })?);
    api.init().await?;

    let throttle = Arc::new(ThrottleCache::new(ThrottleConfig {
        ttl: config.ip_cache_ttl(),
        max_reports_per_ip: config.throttle.max_reports_per_ip,
        unique_types_only: config.throttle.report_unique_types_only,
    }));
    let shared_trackers = Arc::new(Trackers::new());
    let detection = Arc::new(DetectionEngine::new(shared_trackers.clone()));

    let attack_log = match AttackLog::open(&config.logging.dir) {
        Ok(log) => log,
        Err(err) => {
            warn!("attack log unavailable ({err}); continuing without it");
            AttackLog::disabled()
        }
    };
    let pipeline = Arc::new(Pipeline::new(
        throttle.clone(),
        api.clone(),
        attack_log,
        config.throttle.store_throttled_attacks,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ListenerContext {
        config: config.clone(),
        pipeline,
        detection,
        api: api.clone(),
        throttle: throttle.clone(),
        statuses: Arc::new(RwLock::new(Vec::new())),
        started_at: Instant::now(),
        shutdown: shutdown_rx,
    };

    let mut manager = ProtocolManager::new(&ctx).await?;
    for module in manager.statuses() {
        info!("module {} on port {}: {:?}", module.name, module.port, module.status);
    }

    let heartbeat = if api.offline() {
        info!(
            "offline mode: heartbeats disabled, reports spool to {}",
            config.spool_path().display()
        );
        None
    } else {
        Some(api::spawn_heartbeat(api.clone()))
    };
    let replay = api::spawn_replay(api.clone());
    let janitor = throttle::spawn_janitor(throttle.clone());
    let sweeper = trackers::spawn_sweeper(shared_trackers);

    info!(
        "servicetrap is running as '{}' against {}",
        config.honeypot.id, config.api.endpoint
    );

    wait_for_stop_signal().await?;
    info!("shutting down servicetrap...");

    // Stop the schedulers first, then refuse new connections and give
    // in-flight sessions a moment to drain.
    if let Some(task) = heartbeat {
        task.abort();
    }
    replay.abort();
    janitor.abort();
    sweeper.abort();

    let _ = shutdown_tx.send(true);
    manager.shutdown().await?;
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("servicetrap stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
