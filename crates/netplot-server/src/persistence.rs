//! Debounced batch writer for panel documents and the discovery manifest.
//!
//! One task owns the document map and the flush schedule. Sessions talk to
//! it through a [`PersistenceHandle`], so every mutation, flush and purge is
//! applied in arrival order: one flush covers everything enqueued before it
//! and the last enqueue per file name wins.

#![allow(missing_docs)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{json, Value};
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::error::NetplotError;
use crate::metrics::SharedMetrics;
use crate::panel::{SharedGlobalConfig, SharedPanel};

pub const GLOBAL_CONFIG_FILE: &str = "global_config.json";
pub const MANIFEST_FILE: &str = "filelist.json";

/// Matches `<digits>_<anything>.json`, the panel document naming scheme.
#[must_use]
pub fn is_panel_document_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".json") else {
        return false;
    };
    let Some((prefix, _)) = stem.split_once('_') else {
        return false;
    };
    !prefix.is_empty() && prefix.bytes().all(|byte| byte.is_ascii_digit())
}

fn is_session_document_name(name: &str) -> bool {
    name == GLOBAL_CONFIG_FILE || is_panel_document_name(name)
}

/// Content held for one file. Live variants are rendered at flush time.
#[derive(Debug, Clone)]
pub enum Document {
    Json(Value),
    Panel(SharedPanel),
    Global(SharedGlobalConfig),
}

impl Document {
    #[must_use]
    pub fn render(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Panel(panel) => panel.lock().to_document(),
            Self::Global(global) => global.lock().to_document(),
        }
    }
}

/// Debounce window plus the optional upper bound on how long a pending
/// mutation may wait.
#[derive(Debug, Clone)]
pub struct FlushSchedule {
    config: PersistenceConfig,
    quiet_deadline: Option<Instant>,
    first_pending: Option<Instant>,
}

impl FlushSchedule {
    #[must_use]
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            quiet_deadline: None,
            first_pending: None,
        }
    }

    /// Restarts the quiet window.
    pub fn note_mutation(&mut self, now: Instant) {
        self.quiet_deadline = Some(now + self.config.debounce);
        self.first_pending.get_or_insert(now);
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let quiet = self.quiet_deadline?;
        match (self.config.max_flush_delay, self.first_pending) {
            (Some(bound), Some(first)) => Some(quiet.min(first + bound)),
            _ => Some(quiet),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.quiet_deadline.is_some()
    }

    pub fn clear(&mut self) {
        self.quiet_deadline = None;
        self.first_pending = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: Vec<SmolStr>,
    pub failed: Vec<(SmolStr, SmolStr)>,
    pub manifest_written: bool,
}

impl FlushReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.manifest_written
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed_files: Vec<String>,
    pub forgotten: Vec<SmolStr>,
}

#[derive(Debug)]
pub enum PersistenceCommand {
    Enqueue {
        filename: SmolStr,
        document: Document,
    },
    Forget {
        filename: SmolStr,
    },
    Flush {
        respond_to: oneshot::Sender<FlushReport>,
    },
    Purge {
        respond_to: oneshot::Sender<Result<PurgeReport, NetplotError>>,
    },
}

#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistenceCommand>,
}

impl PersistenceHandle {
    /// Upserts `document` under `filename` and restarts the debounce window.
    pub fn enqueue(
        &self,
        filename: impl Into<SmolStr>,
        document: Document,
    ) -> Result<(), NetplotError> {
        self.tx
            .send(PersistenceCommand::Enqueue {
                filename: filename.into(),
                document,
            })
            .map_err(|_| NetplotError::ServiceStopped)
    }

    /// Drops `filename` from the held set; the next flush leaves it out of
    /// the manifest.
    pub fn forget(&self, filename: impl Into<SmolStr>) -> Result<(), NetplotError> {
        self.tx
            .send(PersistenceCommand::Forget {
                filename: filename.into(),
            })
            .map_err(|_| NetplotError::ServiceStopped)
    }

    /// Writes every held document now, regardless of the debounce window.
    pub async fn force_flush(&self) -> Result<FlushReport, NetplotError> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(PersistenceCommand::Flush { respond_to })
            .map_err(|_| NetplotError::ServiceStopped)?;
        response.await.map_err(|_| NetplotError::ServiceStopped)
    }

    /// Deletes stale panel documents and the global config, on disk and in
    /// the held map, then rewrites the manifest.
    pub async fn purge_session_documents(&self) -> Result<PurgeReport, NetplotError> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(PersistenceCommand::Purge { respond_to })
            .map_err(|_| NetplotError::ServiceStopped)?;
        response.await.map_err(|_| NetplotError::ServiceStopped)?
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<PersistenceCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[derive(Debug)]
pub struct PersistenceService {
    output_dir: PathBuf,
    schedule: FlushSchedule,
    documents: IndexMap<SmolStr, Document>,
    rx: mpsc::UnboundedReceiver<PersistenceCommand>,
    metrics: SharedMetrics,
}

impl PersistenceService {
    /// Starts the owning task on the current tokio runtime.
    pub fn spawn(
        output_dir: PathBuf,
        config: PersistenceConfig,
        metrics: SharedMetrics,
    ) -> (PersistenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            output_dir,
            schedule: FlushSchedule::new(config),
            documents: IndexMap::new(),
            rx,
            metrics,
        };
        let task = tokio::spawn(service.run());
        (PersistenceHandle { tx }, task)
    }

    async fn run(mut self) {
        loop {
            let deadline = self.schedule.deadline();
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle(command).await;
                }
                () = sleep_until_deadline(deadline) => {
                    self.flush().await;
                }
            }
        }
        if self.schedule.is_pending() {
            self.flush().await;
        }
        debug!("persistence service stopped");
    }

    async fn handle(&mut self, command: PersistenceCommand) {
        match command {
            PersistenceCommand::Enqueue { filename, document } => {
                self.documents.insert(filename, document);
                self.schedule.note_mutation(Instant::now());
            }
            PersistenceCommand::Forget { filename } => {
                if self.documents.shift_remove(&filename).is_some() {
                    debug!("forgot {filename}");
                    self.schedule.note_mutation(Instant::now());
                }
            }
            PersistenceCommand::Flush { respond_to } => {
                let report = self.flush().await;
                let _ = respond_to.send(report);
            }
            PersistenceCommand::Purge { respond_to } => {
                let result = self.purge().await;
                let _ = respond_to.send(result);
            }
        }
    }

    async fn flush(&mut self) -> FlushReport {
        self.schedule.clear();
        let rendered: Vec<(SmolStr, Value)> = self
            .documents
            .iter()
            .map(|(filename, document)| (filename.clone(), document.render()))
            .collect();
        let dir = self.output_dir.clone();
        let started = std::time::Instant::now();
        let report = match tokio::task::spawn_blocking(move || write_documents(&dir, &rendered))
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!("flush task failed: {err}");
                FlushReport {
                    written: Vec::new(),
                    failed: self
                        .documents
                        .keys()
                        .map(|name| (name.clone(), SmolStr::new("flush task failed")))
                        .collect(),
                    manifest_written: false,
                }
            }
        };
        self.metrics
            .lock()
            .record_flush(started.elapsed(), report.written.len(), report.failed.len());
        if report.failed.is_empty() {
            debug!(documents = report.written.len(), "flushed documents");
        } else {
            warn!(
                failed = report.failed.len(),
                "flush incomplete; documents stay queued for the next flush"
            );
        }
        report
    }

    async fn purge(&mut self) -> Result<PurgeReport, NetplotError> {
        let forgotten: Vec<SmolStr> = self
            .documents
            .keys()
            .filter(|name| is_session_document_name(name))
            .cloned()
            .collect();
        self.documents
            .retain(|name, _| !is_session_document_name(name));
        let remaining: Vec<SmolStr> = self.documents.keys().cloned().collect();
        let dir = self.output_dir.clone();
        let removed_files = tokio::task::spawn_blocking(move || -> io::Result<Vec<String>> {
            let removed = purge_directory(&dir)?;
            if dir.is_dir() {
                write_json_file(&dir.join(MANIFEST_FILE), &json!(remaining))?;
            }
            Ok(removed)
        })
        .await
        .map_err(|err| NetplotError::Persistence(format!("purge task failed: {err}").into()))?
        .map_err(|err| NetplotError::Persistence(format!("purge: {err}").into()))?;
        self.metrics.lock().purges += 1;
        info!(removed = removed_files.len(), "purged stale panel documents");
        Ok(PurgeReport {
            removed_files,
            forgotten,
        })
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn write_documents(dir: &Path, rendered: &[(SmolStr, Value)]) -> FlushReport {
    let mut report = FlushReport::default();
    if let Err(err) = fs::create_dir_all(dir) {
        warn!("create output dir {}: {err}", dir.display());
        report.failed = rendered
            .iter()
            .map(|(name, _)| (name.clone(), SmolStr::new(err.to_string())))
            .collect();
        return report;
    }
    for (filename, document) in rendered {
        match write_json_file(&dir.join(filename.as_str()), document) {
            Ok(()) => report.written.push(filename.clone()),
            Err(err) => {
                warn!("write {filename}: {err}");
                report
                    .failed
                    .push((filename.clone(), SmolStr::new(err.to_string())));
            }
        }
    }
    let names: Vec<&str> = rendered.iter().map(|(name, _)| name.as_str()).collect();
    match write_json_file(&dir.join(MANIFEST_FILE), &json!(names)) {
        Ok(()) => report.manifest_written = true,
        Err(err) => warn!("write {MANIFEST_FILE}: {err}"),
    }
    report
}

/// Writes through a temporary sibling so pollers never read a partial file.
fn write_json_file(path: &Path, value: &Value) -> io::Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

fn purge_directory(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_session_document_name(&name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("removed {name}");
                removed.push(name);
            }
            Err(err) => warn!("remove {name}: {err}"),
        }
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use crate::metrics::ServerMetrics;

    static TEMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(1);

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let seq = TEMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "netplot-{prefix}-{}-{nanos}-{seq}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn config(debounce_ms: u64, max_ms: Option<u64>) -> PersistenceConfig {
        PersistenceConfig {
            debounce: Duration::from_millis(debounce_ms),
            max_flush_delay: max_ms.map(Duration::from_millis),
        }
    }

    fn read_json(path: &Path) -> Value {
        let text = fs::read_to_string(path).expect("read json file");
        serde_json::from_str(&text).expect("parse json file")
    }

    #[test]
    fn panel_document_names() {
        assert!(is_panel_document_name("0_demo.json"));
        assert!(is_panel_document_name("12_cpu_load.json"));
        assert!(!is_panel_document_name("global_config.json"));
        assert!(!is_panel_document_name("filelist.json"));
        assert!(!is_panel_document_name("_demo.json"));
        assert!(!is_panel_document_name("1a_demo.json"));
        assert!(!is_panel_document_name("3_demo.txt"));
    }

    #[test]
    fn schedule_restarts_quiet_window_on_each_mutation() {
        let mut schedule = FlushSchedule::new(config(250, None));
        assert_eq!(schedule.deadline(), None);
        let start = Instant::now();
        schedule.note_mutation(start);
        schedule.note_mutation(start + Duration::from_millis(100));
        assert_eq!(
            schedule.deadline(),
            Some(start + Duration::from_millis(350))
        );
        schedule.clear();
        assert!(!schedule.is_pending());
    }

    #[test]
    fn schedule_bounds_delay_under_continuous_mutation() {
        let mut schedule = FlushSchedule::new(config(250, Some(1_000)));
        let start = Instant::now();
        for step in 0..10 {
            schedule.note_mutation(start + Duration::from_millis(step * 200));
        }
        assert_eq!(
            schedule.deadline(),
            Some(start + Duration::from_millis(1_000))
        );
    }

    #[test]
    fn write_documents_writes_manifest_of_all_names() {
        let dir = unique_temp_dir("write");
        let rendered = vec![
            (SmolStr::new("0_a.json"), json!({"plot_name": "a"})),
            (SmolStr::new(GLOBAL_CONFIG_FILE), json!({"grid": [1, 1]})),
        ];
        let report = write_documents(&dir, &rendered);
        assert!(report.is_clean());
        assert_eq!(read_json(&dir.join("0_a.json")), json!({"plot_name": "a"}));
        assert_eq!(
            read_json(&dir.join(MANIFEST_FILE)),
            json!(["0_a.json", GLOBAL_CONFIG_FILE])
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn purge_directory_keeps_unrelated_files() {
        let dir = unique_temp_dir("purge");
        for name in ["0_a.json", "7_b.json", GLOBAL_CONFIG_FILE, "notes.json", "index.html"] {
            fs::write(dir.join(name), "{}").expect("seed file");
        }
        let removed = purge_directory(&dir).expect("purge");
        assert_eq!(removed, vec!["0_a.json", "7_b.json", GLOBAL_CONFIG_FILE]);
        assert!(dir.join("notes.json").is_file());
        assert!(dir.join("index.html").is_file());
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_coalesces_into_one_flush() {
        let dir = unique_temp_dir("coalesce");
        let metrics = ServerMetrics::shared();
        let (handle, _task) =
            PersistenceService::spawn(dir.clone(), config(250, None), metrics.clone());

        for value in 0..20 {
            handle
                .enqueue("0_burst.json", Document::Json(json!({ "value": value })))
                .expect("enqueue");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.lock().flushes, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(metrics.lock().flushes, 1);
        assert_eq!(read_json(&dir.join("0_burst.json")), json!({ "value": 19 }));
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn force_flush_and_purge_round_trip() {
        let dir = unique_temp_dir("force");
        let metrics = ServerMetrics::shared();
        let (handle, _task) =
            PersistenceService::spawn(dir.clone(), config(10_000, None), metrics.clone());

        handle
            .enqueue("1_keep.json", Document::Json(json!({"a": 1})))
            .expect("enqueue panel");
        handle
            .enqueue("extra.json", Document::Json(json!({"b": 2})))
            .expect("enqueue extra");
        let report = handle.force_flush().await.expect("flush");
        assert_eq!(report.written.len(), 2);
        assert!(dir.join("1_keep.json").is_file());

        let purge = handle.purge_session_documents().await.expect("purge");
        assert_eq!(purge.removed_files, vec!["1_keep.json"]);
        assert_eq!(purge.forgotten, vec![SmolStr::new("1_keep.json")]);
        assert!(!dir.join("1_keep.json").exists());
        assert_eq!(read_json(&dir.join(MANIFEST_FILE)), json!(["extra.json"]));
        assert_eq!(metrics.lock().purges, 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn forgotten_document_leaves_the_manifest() {
        let dir = unique_temp_dir("forget");
        let metrics = ServerMetrics::shared();
        let (handle, _task) =
            PersistenceService::spawn(dir.clone(), config(10_000, None), metrics.clone());

        handle
            .enqueue("0_old.json", Document::Json(json!({"v": 1})))
            .expect("enqueue old");
        handle
            .enqueue("1_other.json", Document::Json(json!({"v": 2})))
            .expect("enqueue other");
        handle.force_flush().await.expect("flush");

        handle.forget("0_old.json").expect("forget");
        let report = handle.force_flush().await.expect("second flush");
        assert_eq!(report.written, vec![SmolStr::new("1_other.json")]);
        assert_eq!(read_json(&dir.join(MANIFEST_FILE)), json!(["1_other.json"]));
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_write_is_retried_on_next_flush() {
        let dir = unique_temp_dir("retry");
        let metrics = ServerMetrics::shared();
        let (handle, _task) =
            PersistenceService::spawn(dir.clone(), config(10_000, None), metrics.clone());

        // A directory squatting on the target name makes the rename fail.
        fs::create_dir_all(dir.join("2_blocked.json").join("inner")).expect("block target");
        handle
            .enqueue("2_blocked.json", Document::Json(json!({"v": 1})))
            .expect("enqueue");
        let report = handle.force_flush().await.expect("flush");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(metrics.lock().write_failures, 1);

        fs::remove_dir_all(dir.join("2_blocked.json")).expect("unblock target");
        let report = handle.force_flush().await.expect("retry flush");
        assert!(report.is_clean());
        assert_eq!(read_json(&dir.join("2_blocked.json")), json!({"v": 1}));
        let _ = fs::remove_dir_all(dir);
    }
}
