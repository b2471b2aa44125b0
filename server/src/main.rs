//! Strand relay node
//!
//! Bootstraps one node: configuration, identity key material, the relay
//! context, WebSocket ingress, outward gateway keepers, background
//! schedulers and signal-driven graceful shutdown.

mod app;
mod auth;
mod schedulers;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_config::{NodeRole, RelayConfig};
use strand_protocol::NodeKeyPair;
use strand_relay_core::{
    run_keeper, InMemoryRegistry, NullEventBus, RelayContext, RelayMetrics, Shutdown,
};

#[derive(Debug, Parser)]
#[command(name = "strand-server", about = "Strand relay fabric node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RelayConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    init_logging(&config, args.log_level.as_deref());

    let keys = match config.private_key_pem()? {
        Some(pem) => Arc::new(
            NodeKeyPair::from_pkcs8_pem(&pem).context("parsing the configured private key")?,
        ),
        None => {
            warn!("no private key configured, generating an ephemeral identity");
            Arc::new(NodeKeyPair::generate().context("generating an identity key")?)
        }
    };
    info!(
        instance_id = %config.instance_id,
        role = %config.role,
        public_key_hash = %keys.fingerprint(),
        "starting strand node"
    );

    let registry = Arc::new(InMemoryRegistry::with_windows(
        config.limits.client_inactivity_timeout(),
        config.limits.connection_retention(),
    ));
    let validator = Arc::new(auth::StaticTokenValidator::new(config.auth.tokens.clone()));
    let metrics = Arc::new(RelayMetrics::new().map_err(|e| anyhow::anyhow!("{e}"))?);
    let shutdown = Shutdown::new();
    let config = Arc::new(config);

    let ctx = RelayContext::new(
        config.clone(),
        keys,
        registry,
        validator,
        Arc::new(NullEventBus),
        metrics,
        shutdown.clone(),
    );

    // Outward gateway keepers, Service role only
    if config.role == NodeRole::Service {
        for url in &config.gateway.servers {
            tokio::spawn(run_keeper(ctx.clone(), url.clone()));
        }
    }
    tokio::spawn(schedulers::run_purge_scheduler(ctx.clone()));
    tokio::spawn(schedulers::run_key_announcer(ctx.clone()));

    // Signals fan out through the shutdown watch to every loop and worker
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.trigger();
    });

    let addr = SocketAddr::new(config.network.bind_address, config.network.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    let router = app::build_router(ctx.clone());
    let mut serve_shutdown = shutdown.listener();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        serve_shutdown.wait().await;
    })
    .await
    .context("serving")?;

    info!("strand node stopped");
    Ok(())
}

fn init_logging(config: &RelayConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
