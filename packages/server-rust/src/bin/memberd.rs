//! The membership daemon.
//!
//! Resolves configuration (database snapshot, environment overrides,
//! defaults), joins the group transport, opens the local client endpoints
//! and runs the cluster core until it leaves the cluster.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use memberd_server::client::{self, EndpointConfig};
use memberd_server::config::{self, ClusterDatabase, ConfigSource, EnvOverrides};
use memberd_server::core::ClusterCore;
use memberd_server::transport::LoopbackHub;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "memberd", about = "cluster membership daemon")]
struct Args {
    /// Path to a JSON snapshot of the cluster configuration database.
    #[arg(long, env = "MEMBERD_CONFIG")]
    config: Option<PathBuf>,

    /// Client endpoint path (mode 0660).
    #[arg(long, default_value = "/var/run/memberd_client")]
    client_sock: PathBuf,

    /// Admin endpoint path (mode 0600).
    #[arg(long, default_value = "/var/run/memberd_admin")]
    admin_sock: PathBuf,

    /// Per-connection outbound queue depth.
    #[arg(long, default_value_t = 64)]
    outbound_queue: usize,
}

fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "localhost".to_string()
}

fn load_source(args: &Args, env: &EnvOverrides) -> Result<ConfigSource> {
    if env.no_config {
        info!("configuration database disabled, using defaults and overrides");
        return Ok(ConfigSource::Defaults);
    }
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading configuration {}", path.display()))?;
            let db: ClusterDatabase = serde_json::from_str(&raw)
                .with_context(|| format!("parsing configuration {}", path.display()))?;
            Ok(ConfigSource::Database(db))
        }
        None => {
            warn!("no configuration database given, using defaults and overrides");
            Ok(ConfigSource::Defaults)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let env = EnvOverrides::capture();
    let source = load_source(&args, &env)?;
    let cfg = config::resolve(&source, &env, &local_hostname())?;

    // The production group transport is an external collaborator bound in
    // through `GroupTransport`; this binary ships with the in-process hub,
    // which is sufficient for a single-host cluster.
    let hub = LoopbackHub::new();
    let local_addr = cfg
        .interfaces
        .first()
        .cloned()
        .unwrap_or_else(|| memberd_core::NodeAddress::new(vec![2, 0, 127, 0, 0, 2]));
    let (transport, transport_rx) = hub.join(local_addr);

    let core = ClusterCore::new(cfg, Arc::new(transport), transport_rx);
    let connections = core.connections();
    let input_tx = core.client_input_sender();
    let shutdown = core.shutdown_controller();

    let endpoints = EndpointConfig {
        client_path: args.client_sock,
        admin_path: args.admin_sock,
        outbound_queue: args.outbound_queue,
    };
    let listener = tokio::spawn(client::serve(
        endpoints,
        connections,
        input_tx,
        shutdown.shutdown_receiver(),
    ));

    // SIGINT/SIGTERM commit to a clean LEAVE.
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("signal handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            info!("shutdown signal received");
            shutdown.force();
        });
    }

    core.run().await;

    if let Err(e) = listener.await.context("listener task")? {
        warn!(error = %e, "listener exited with an error");
    }
    info!("memberd stopped");
    Ok(())
}
