//! Per-connection session loop.

#![allow(missing_docs)]

use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tracing::{debug, info, warn};

use crate::error::NetplotError;
use crate::metrics::SharedMetrics;
use crate::panel::SharedGlobalConfig;
use crate::persistence::PersistenceHandle;
use crate::protocol::{greeting, LineOutcome, LineProcessor, LineSplitter, ACK};

const READ_CHUNK: usize = 4096;

/// Shared resources and slot identity handed to each accepted connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub slot_index: usize,
    pub max_panels: usize,
    pub ack_default: bool,
    pub global: SharedGlobalConfig,
    pub persistence: PersistenceHandle,
    pub metrics: SharedMetrics,
}

impl SessionContext {
    /// The base-port slot resets the shared session state on connect.
    #[must_use]
    pub fn resets_session(&self) -> bool {
        self.slot_index == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    Faulted { message: SmolStr },
}

/// Serves one client until it disconnects or commits a fatal fault.
pub async fn serve_connection<S>(
    stream: S,
    peer: &str,
    ctx: SessionContext,
) -> Result<SessionEnd, NetplotError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ctx.metrics.lock().session_opened();
    info!(slot = ctx.slot_index, "CONNECTED: {peer}");
    let result = drive(stream, &ctx).await;
    ctx.metrics.lock().session_closed();
    match &result {
        Ok(SessionEnd::Disconnected) => info!(slot = ctx.slot_index, "DISCONNECTED: {peer}"),
        Ok(SessionEnd::Faulted { message }) => {
            warn!(slot = ctx.slot_index, "closed {peer} after fault: {message}");
        }
        Err(err) => warn!(slot = ctx.slot_index, "session {peer} ended: {err}"),
    }
    result
}

async fn drive<S>(stream: S, ctx: &SessionContext) -> Result<SessionEnd, NetplotError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    writer.write_all(greeting().as_bytes()).await?;

    if ctx.resets_session() {
        ctx.global.lock().reset();
        match ctx.persistence.purge_session_documents().await {
            Ok(report) => debug!(
                removed = report.removed_files.len(),
                forgotten = report.forgotten.len(),
                "session reset"
            ),
            Err(NetplotError::ServiceStopped) => return Err(NetplotError::ServiceStopped),
            // Disk faults stay on the persistence side; the session carries on.
            Err(err) => {
                ctx.metrics.lock().purge_failures += 1;
                warn!(slot = ctx.slot_index, "session reset purge failed: {err}");
            }
        }
    }

    let mut processor = LineProcessor::new(
        ctx.slot_index,
        ctx.max_panels,
        ctx.global.clone(),
        ctx.persistence.clone(),
    )
    .with_acks(ctx.ack_default);
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let read = reader.read(&mut buf).await?;
        let lines = if read == 0 {
            splitter.finish().into_iter().collect()
        } else {
            match splitter.push(&buf[..read]) {
                Ok(lines) => lines,
                Err(err) => return fault(&mut writer, ctx, &err).await,
            }
        };
        for line in lines {
            ctx.metrics.lock().lines += 1;
            let outcome = match processor.process_line(&line) {
                Ok(outcome) => outcome,
                Err(err) if err.is_fatal() => return fault(&mut writer, ctx, &err).await,
                Err(err) => return Err(err),
            };
            if let LineOutcome::Ignored { reason } = &outcome {
                ctx.metrics.lock().ignored_lines += 1;
                warn!(slot = ctx.slot_index, "ignored line: {reason}");
            }
            if processor.acks_enabled() || outcome == LineOutcome::StatusToggled {
                writer.write_all(format!("{ACK}\n").as_bytes()).await?;
            }
        }
        if read == 0 {
            return Ok(SessionEnd::Disconnected);
        }
    }
}

async fn fault<S>(
    writer: &mut WriteHalf<S>,
    ctx: &SessionContext,
    err: &NetplotError,
) -> Result<SessionEnd, NetplotError>
where
    S: AsyncRead + AsyncWrite,
{
    ctx.metrics.lock().faults += 1;
    let message = SmolStr::new(err.to_string());
    // The peer may already be gone; the fault is still reported in the log.
    let _ = writer
        .write_all(format!("ERROR: {message}\n").as_bytes())
        .await;
    let _ = writer.shutdown().await;
    Ok(SessionEnd::Faulted { message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::metrics::ServerMetrics;
    use crate::panel::GlobalConfig;
    use crate::persistence::{Document, PersistenceCommand};

    fn context(slot_index: usize) -> (SessionContext, UnboundedReceiver<PersistenceCommand>) {
        let (persistence, rx) = PersistenceHandle::detached();
        let ctx = SessionContext {
            slot_index,
            max_panels: 4,
            ack_default: true,
            global: GlobalConfig::shared(),
            persistence,
            metrics: ServerMetrics::shared(),
        };
        (ctx, rx)
    }

    async fn exchange(ctx: SessionContext, input: &[u8]) -> (Result<SessionEnd, NetplotError>, String) {
        let (mut client, server): (DuplexStream, DuplexStream) = duplex(64 * 1024);
        let session = tokio::spawn(async move { serve_connection(server, "test", ctx).await });
        client.write_all(input).await.expect("send input");
        client.shutdown().await.expect("half close");
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.expect("read reply");
        let result = session.await.expect("session task");
        (result, reply)
    }

    #[tokio::test]
    async fn acknowledges_every_line_after_greeting() {
        let (ctx, _rx) = context(3);
        let metrics = ctx.metrics.clone();
        let (result, reply) = exchange(ctx, b"set graph=xy\n# note\n\ninit\n").await;
        assert_eq!(result.expect("session"), SessionEnd::Disconnected);
        assert_eq!(reply, "netplot_version=2.5\nOK\nOK\nOK\nOK\n");
        let metrics = metrics.lock().snapshot();
        assert_eq!(metrics.lines, 4);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[tokio::test]
    async fn status_toggle_suppresses_acks_but_is_itself_acknowledged() {
        let (ctx, _rx) = context(1);
        let (_, reply) = exchange(
            ctx,
            b"enable_status 0\nset graph=time\ninit\nenable_status 1\n1.0\n",
        )
        .await;
        assert_eq!(reply, "netplot_version=2.5\nOK\nOK\nOK\n");
    }

    #[tokio::test]
    async fn fatal_fault_reports_error_and_stops_processing() {
        let (ctx, mut rx) = context(2);
        let metrics = ctx.metrics.clone();
        let (result, reply) = exchange(
            ctx,
            b"set graph=xy\nset plot_name=p\n0:1:2\ninit\n0:1:2\n",
        )
        .await;
        assert!(matches!(result, Ok(SessionEnd::Faulted { .. })));
        assert!(reply.starts_with("netplot_version=2.5\nOK\nOK\nERROR: "));
        assert!(reply.ends_with('\n'));
        assert_eq!(reply.matches("ERROR").count(), 1);
        assert_eq!(metrics.lock().faults, 1);

        let mut last = None;
        while let Ok(command) = rx.try_recv() {
            if let PersistenceCommand::Enqueue { document, .. } = command {
                last = Some(document);
            }
        }
        let doc = last.map(|doc: Document| doc.render()).expect("panel scheduled");
        assert_eq!(doc["plot_values"], json!([]));
    }

    #[tokio::test]
    async fn unterminated_final_line_is_processed() {
        let (ctx, _rx) = context(1);
        let (_, reply) = exchange(ctx, b"set graph=bar\ninit").await;
        assert_eq!(reply, "netplot_version=2.5\nOK\nOK\n");
    }

    #[tokio::test]
    async fn base_slot_resets_frame_configuration() {
        let (ctx, mut rx) = context(0);
        ctx.global.lock().set_frame_title("stale");
        let global = ctx.global.clone();
        let (mut client, server) = duplex(1024);
        let session = tokio::spawn(async move { serve_connection(server, "base", ctx).await });

        let respond_to = match rx.recv().await.expect("purge requested") {
            PersistenceCommand::Purge { respond_to } => respond_to,
            other => panic!("expected purge, got {other:?}"),
        };
        assert_eq!(global.lock().frame_title, None);
        let _ = respond_to.send(Ok(crate::persistence::PurgeReport::default()));

        client.shutdown().await.expect("half close");
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.expect("read reply");
        assert_eq!(reply, "netplot_version=2.5\n");
        assert_eq!(
            session.await.expect("session task").expect("session"),
            SessionEnd::Disconnected
        );
    }

    #[tokio::test]
    async fn failed_reset_purge_keeps_base_session_open() {
        let (ctx, mut rx) = context(0);
        let metrics = ctx.metrics.clone();
        let (mut client, server) = duplex(1024);
        let session = tokio::spawn(async move { serve_connection(server, "base", ctx).await });

        let respond_to = match rx.recv().await.expect("purge requested") {
            PersistenceCommand::Purge { respond_to } => respond_to,
            other => panic!("expected purge, got {other:?}"),
        };
        let _ = respond_to.send(Err(NetplotError::Persistence("purge: disk full".into())));

        client.write_all(b"set graph=xy\n").await.expect("send line");
        client.shutdown().await.expect("half close");
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.expect("read reply");
        assert_eq!(reply, "netplot_version=2.5\nOK\n");
        assert_eq!(
            session.await.expect("session task").expect("session"),
            SessionEnd::Disconnected
        );
        let snapshot = metrics.lock().snapshot();
        assert_eq!(snapshot.purge_failures, 1);
        assert_eq!(snapshot.faults, 0);
    }
}
