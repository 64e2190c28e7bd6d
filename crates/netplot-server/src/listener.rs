//! Listener pool: one TCP listener per panel slot.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::NetplotError;
use crate::metrics::{MetricsSnapshot, ServerMetrics, SharedMetrics};
use crate::panel::{GlobalConfig, SharedGlobalConfig};
use crate::persistence::{FlushReport, PersistenceHandle, PersistenceService};
use crate::session::{serve_connection, SessionContext};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Running server. Dropping the handle leaves the tasks running until the
/// runtime stops; call [`ServerHandle::shutdown`] to flush pending state.
#[derive(Debug)]
pub struct ServerHandle {
    base_port: u16,
    local_addrs: Vec<SocketAddr>,
    output_dir: PathBuf,
    metrics: SharedMetrics,
    global: SharedGlobalConfig,
    persistence: PersistenceHandle,
    accept_tasks: Vec<JoinHandle<()>>,
    persistence_task: JoinHandle<()>,
}

pub struct NetplotServer;

impl NetplotServer {
    /// Binds every port in the configured range, sweeps stale documents, then
    /// starts accepting. Binding is all-or-nothing.
    pub async fn start(config: &ServerConfig) -> Result<ServerHandle, NetplotError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|err| {
                NetplotError::Persistence(
                    format!("create {}: {err}", config.output_dir.display()).into(),
                )
            })?;

        let mut listeners = Vec::with_capacity(config.max_panels());
        for port in config.base_port..=config.last_port() {
            let listener = TcpListener::bind((config.listen_host.as_str(), port))
                .await
                .map_err(|source| NetplotError::Bind { port, source })?;
            listeners.push(listener);
        }
        let local_addrs = listeners
            .iter()
            .map(TcpListener::local_addr)
            .collect::<Result<Vec<_>, _>>()?;

        let metrics = ServerMetrics::shared();
        let global = GlobalConfig::shared();
        let (persistence, persistence_task) = PersistenceService::spawn(
            config.output_dir.clone(),
            config.persistence,
            metrics.clone(),
        );
        let sweep = persistence.purge_session_documents().await?;
        info!(
            removed = sweep.removed_files.len(),
            "startup sweep of {}",
            config.output_dir.display()
        );

        let accept_tasks = listeners
            .into_iter()
            .enumerate()
            .map(|(slot_index, listener)| {
                let ctx = SessionContext {
                    slot_index,
                    max_panels: config.max_panels(),
                    ack_default: config.ack_default,
                    global: global.clone(),
                    persistence: persistence.clone(),
                    metrics: metrics.clone(),
                };
                tokio::spawn(accept_loop(listener, ctx))
            })
            .collect();
        info!(
            "netplot server on {}:{}-{}",
            config.listen_host,
            config.base_port,
            config.last_port()
        );

        Ok(ServerHandle {
            base_port: config.base_port,
            local_addrs,
            output_dir: config.output_dir.clone(),
            metrics,
            global,
            persistence,
            accept_tasks,
            persistence_task,
        })
    }
}

async fn accept_loop(listener: TcpListener, ctx: SessionContext) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!("set_nodelay for {peer}: {err}");
                }
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let peer = peer.to_string();
                    // Outcome is logged by the session itself.
                    let _ = serve_connection(stream, &peer, ctx).await;
                });
            }
            Err(err) => {
                warn!(slot = ctx.slot_index, "accept failed: {err}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

impl ServerHandle {
    #[must_use]
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    #[must_use]
    pub fn output_dir(&self) -> &std::path::Path {
        &self.output_dir
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    #[must_use]
    pub fn global_config(&self) -> GlobalConfig {
        self.global.lock().clone()
    }

    #[must_use]
    pub fn persistence(&self) -> &PersistenceHandle {
        &self.persistence
    }

    /// Writes all pending documents immediately.
    pub async fn force_flush(&self) -> Result<FlushReport, NetplotError> {
        self.persistence.force_flush().await
    }

    /// Stops accepting, then flushes so no pending mutation is lost.
    pub async fn shutdown(self) -> Result<FlushReport, NetplotError> {
        for task in &self.accept_tasks {
            task.abort();
        }
        let report = self.persistence.force_flush().await?;
        let snapshot = self.metrics.lock().snapshot();
        info!(
            connections = snapshot.connections,
            lines = snapshot.lines,
            faults = snapshot.faults,
            flushes = snapshot.flushes,
            documents_written = snapshot.documents_written,
            avg_flush_ms = snapshot.avg_flush_ms,
            purge_failures = snapshot.purge_failures,
            "netplot server stopped"
        );
        self.persistence_task.abort();
        Ok(report)
    }
}
