//! Server metrics collection.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub type SharedMetrics = Arc<Mutex<ServerMetrics>>;

#[derive(Debug, Clone)]
pub struct ServerMetrics {
    started: Instant,
    pub connections: u64,
    pub active_sessions: u64,
    pub lines: u64,
    pub ignored_lines: u64,
    pub faults: u64,
    pub flushes: u64,
    pub documents_written: u64,
    pub write_failures: u64,
    pub purges: u64,
    pub purge_failures: u64,
    flush_time_total: Duration,
    slowest_flush: Duration,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            connections: 0,
            active_sessions: 0,
            lines: 0,
            ignored_lines: 0,
            faults: 0,
            flushes: 0,
            documents_written: 0,
            write_failures: 0,
            purges: 0,
            purge_failures: 0,
            flush_time_total: Duration::ZERO,
            slowest_flush: Duration::ZERO,
        }
    }
}

impl ServerMetrics {
    #[must_use]
    pub fn shared() -> SharedMetrics {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn session_opened(&mut self) {
        self.connections = self.connections.saturating_add(1);
        self.active_sessions = self.active_sessions.saturating_add(1);
    }

    pub fn session_closed(&mut self) {
        self.active_sessions = self.active_sessions.saturating_sub(1);
    }

    pub fn record_flush(&mut self, duration: Duration, written: usize, failed: usize) {
        self.flushes = self.flushes.saturating_add(1);
        self.documents_written = self.documents_written.saturating_add(written as u64);
        self.write_failures = self.write_failures.saturating_add(failed as u64);
        self.flush_time_total = self.flush_time_total.saturating_add(duration);
        self.slowest_flush = self.slowest_flush.max(duration);
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let avg_flush_ms = if self.flushes == 0 {
            0.0
        } else {
            self.flush_time_total.as_secs_f64() * 1000.0 / self.flushes as f64
        };
        MetricsSnapshot {
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            connections: self.connections,
            active_sessions: self.active_sessions,
            lines: self.lines,
            ignored_lines: self.ignored_lines,
            faults: self.faults,
            flushes: self.flushes,
            documents_written: self.documents_written,
            write_failures: self.write_failures,
            purges: self.purges,
            purge_failures: self.purge_failures,
            avg_flush_ms,
            max_flush_ms: self.slowest_flush.as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub connections: u64,
    pub active_sessions: u64,
    pub lines: u64,
    pub ignored_lines: u64,
    pub faults: u64,
    pub flushes: u64,
    pub documents_written: u64,
    pub write_failures: u64,
    pub purges: u64,
    pub purge_failures: u64,
    pub avg_flush_ms: f64,
    pub max_flush_ms: f64,
}
