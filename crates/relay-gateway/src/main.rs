mod cli;
mod config;
mod loopback;
mod status;

use std::sync::Arc;
use std::time::Duration;

use access_control::{PermissionCache, SystemClock};
use anyhow::{Context, Result};
use clap::Parser;
use relay_proxy::{
    AuthorizationInspector, HeaderLogger, HeartbeatInspector, HttpLifecycleClient,
    InspectionPipeline, RelayPipeline, RelayTransport, RequestInspector,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::Config;
use crate::loopback::LoopbackRelay;
use crate::status::StatusSource;

/// Timeout for calls to the lifecycle service.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Inspector chain
// ---------------------------------------------------------------------------

/// Build the ordered inspector chain: header logger, authorization,
/// heartbeat, each only when enabled.
fn build_inspectors(cfg: &Config) -> Result<Vec<Arc<dyn RequestInspector>>> {
    let mut inspectors: Vec<Arc<dyn RequestInspector>> = Vec::new();
    let clock = Arc::new(SystemClock);

    if cfg.logging.log_headers {
        inspectors.push(Arc::new(HeaderLogger));
    }

    if cfg.auth.enabled {
        let cache = PermissionCache::from_config(&cfg.auth, clock.clone())
            .context("failed to build permission cache")?;
        inspectors.push(Arc::new(AuthorizationInspector::new(
            Arc::new(cache),
            cfg.auth.cookie_name.clone(),
        )));
        info!(
            resource_type = %cfg.auth.resource_type,
            resource_id = %cfg.auth.resource_id,
            action = %cfg.auth.action,
            "authorization enabled"
        );
    }

    if cfg.heartbeat.enabled {
        let client = HttpLifecycleClient::new(&cfg.heartbeat.endpoint, HEARTBEAT_TIMEOUT)
            .context("failed to build lifecycle client")?;
        inspectors.push(Arc::new(HeartbeatInspector::new(
            &cfg.heartbeat,
            cfg.relay.connection_name.clone(),
            Arc::new(client),
            clock,
        )));
        info!(window_secs = cfg.heartbeat.window_secs, "heartbeat enabled");
    }

    Ok(inspectors)
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;
    cfg.apply_overrides(&cli);

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    cfg.validate().context("invalid configuration")?;
    let listen_addr = cfg.listen_addr()?;
    let status_addr = cfg.status_addr()?;

    info!(
        config_file = %cli.config.display(),
        connection = %cfg.relay.connection_name,
        listen = %listen_addr,
        status = %status_addr,
        default_target = %cfg.target.default_host,
        routes = cfg.target.routes.len(),
        "relay-gateway starting"
    );

    // 4. Build inspector chain.
    let inspectors = build_inspectors(&cfg)?;
    if inspectors.is_empty() {
        warn!("inspector chain is empty; every request and upgrade will be rejected");
    }
    info!(count = inspectors.len(), "inspector chain built");

    // 5. Build the relay pipeline.
    let pipeline = RelayPipeline::from_config(
        &cfg.relay.connection_name,
        &cfg.target,
        cfg.cors.clone(),
        InspectionPipeline::new(inspectors),
        cfg.relay.max_concurrent_requests,
    )
    .context("failed to build relay pipeline")?;

    // 6. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx_signal.send(());
    });

    // 7. Start the status probe.
    let transport = Arc::new(LoopbackRelay::new(
        cfg.relay.connection_name.clone(),
        listen_addr,
    ));
    let status_listener = TcpListener::bind(status_addr)
        .await
        .with_context(|| format!("failed to bind status probe on {status_addr}"))?;
    let status_source = StatusSource::new(
        Arc::clone(&transport) as Arc<dyn RelayTransport>,
        pipeline.clone(),
    );
    let status_task = tokio::spawn(status::serve(
        status_listener,
        status_source,
        shutdown_tx.subscribe(),
    ));

    // 8. Run the relay until shutdown.
    let result = pipeline
        .run(transport.as_ref(), shutdown_tx.subscribe())
        .await
        .context("relay pipeline failed");

    // 9. Stop the status probe as well.
    let _ = shutdown_tx.send(());
    let _ = status_task.await;

    info!("relay-gateway shut down");
    result
}

/// Resolve on SIGINT, or on SIGTERM where supported.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}
