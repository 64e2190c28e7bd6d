//! netplot-server CLI entry point.

mod ci;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use netplot_server::config::DEFAULT_CONFIG_FILE;
use netplot_server::{NetplotError, NetplotServer, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "netplot-server",
    version,
    about = "Receives plot data over TCP and persists panels as JSON for a polling viewer"
)]
struct Args {
    /// Path to a netplot.toml file (defaults to ./netplot.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,
    /// First TCP port; its connection resets the session.
    #[arg(long = "base-port", visible_alias = "bp")]
    base_port: Option<u16>,
    /// Number of ports (and panel slots) to listen on.
    #[arg(long = "port-count", visible_alias = "pc")]
    port_count: Option<u16>,
    /// Directory the JSON documents are written to.
    #[arg(long)]
    path: Option<PathBuf>,
    /// Quiet period before pending documents are written.
    #[arg(long)]
    debounce_ms: Option<u64>,
    /// Upper bound on how long a pending mutation may wait for a flush.
    #[arg(long)]
    max_flush_delay_ms: Option<u64>,
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("error: {err:#}");
        std::process::exit(ci::classify_error(&err));
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args)?;
    init_tracing(&config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;
    runtime.block_on(serve(config))
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::load_optional(DEFAULT_CONFIG_FILE)?,
    };
    if let Some(host) = &args.host {
        config.listen_host = host.as_str().into();
    }
    if let Some(base_port) = args.base_port {
        config.base_port = base_port;
    }
    if let Some(port_count) = args.port_count {
        config.port_count = port_count;
    }
    if let Some(path) = &args.path {
        config.output_dir.clone_from(path);
    }
    if let Some(debounce_ms) = args.debounce_ms {
        config.persistence.debounce = Duration::from_millis(debounce_ms);
    }
    if let Some(max_ms) = args.max_flush_delay_ms {
        config.persistence.max_flush_delay = Some(Duration::from_millis(max_ms));
    }
    if args.debug {
        config.debug = true;
    }
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins, then the debug toggle, then the configured level.
fn init_tracing(config: &ServerConfig) -> anyhow::Result<()> {
    let fallback = if config.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback).map_err(|err| {
            NetplotError::InvalidConfig(format!("log.level '{fallback}': {err}").into())
        })?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let server = NetplotServer::start(&config)
        .await
        .context("start netplot server")?;
    info!(
        "writing documents to {} ({} panel slots)",
        server.output_dir().display(),
        config.max_panels()
    );
    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown requested");
    let report = server.shutdown().await.context("final flush")?;
    if !report.is_clean() {
        warn!(failed = report.failed.len(), "final flush left documents unwritten");
    }
    Ok(())
}
