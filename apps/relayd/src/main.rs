//! relayd - MCP Relay gateway daemon
//!
//! Thin shell over the gateway runtime: parses flags, initializes logging,
//! wires the collaborators, and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mcprelay_core::{FileConfigurator, KeyringCredentialStore};
use mcprelay_gateway::{DockerCli, Gateway, GatewayConfig, TransportMode};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Aggregating MCP gateway", version)]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "mcprelay.json")]
    config: PathBuf,

    /// Watch the configuration file and reconcile on change
    #[arg(long)]
    watch: bool,

    /// Transport to expose: stdio, sse, or streaming
    #[arg(long, default_value = "streaming")]
    transport: String,

    /// Listen port for network transports
    #[arg(long, default_value_t = 8811)]
    port: u16,

    /// Listen host for network transports
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Interceptors, comma-separated, applied in order
    #[arg(long, default_value = mcprelay_gateway::interceptor::DEFAULT_CHAIN)]
    interceptors: String,

    /// Reconcile once and exit without serving
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let transport: TransportMode = args
        .transport
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let config = GatewayConfig {
        transport,
        host: args.host,
        port: args.port,
        interceptors: args.interceptors,
        dry_run: args.dry_run,
        ..Default::default()
    };

    let in_container = std::env::var("DOCKER_MCP_IN_CONTAINER").is_ok();
    let gateway = Gateway::new(
        config,
        Arc::new(FileConfigurator::new(args.config).with_watch(args.watch)),
        Arc::new(DockerCli::new(in_container)?),
        Arc::new(KeyringCredentialStore::new("mcprelay")),
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[relayd] Interrupt received, shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    gateway.run(cancel).await
}
