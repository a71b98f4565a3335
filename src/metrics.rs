// Run metrics
//
// Lightweight counters for background runs, readable at any time and logged
// on shutdown.

use crate::notify::RunOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Coordinator metrics
///
/// Uses atomic operations so the worker thread can record without locks.
#[derive(Debug)]
pub struct Metrics {
    /// Runs accepted by `start()`
    pub runs_started: AtomicU64,

    /// Runs that completed successfully
    pub runs_succeeded: AtomicU64,

    /// Runs that ended with an error
    pub runs_failed: AtomicU64,

    /// Runs that ended canceled (user or internal)
    pub runs_canceled: AtomicU64,

    /// Cancellations issued by the job while re-applying configuration
    pub internal_cancels: AtomicU64,

    /// Finalized exports and uploads
    pub exports: AtomicU64,

    /// Total time spent processing, in milliseconds
    pub total_run_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_canceled: AtomicU64::new(0),
            internal_cancels: AtomicU64::new(0),
            exports: AtomicU64::new(0),
            total_run_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a run ended and how long it took
    pub fn record_outcome(&self, outcome: &RunOutcome, duration: Duration) {
        let counter = match outcome {
            RunOutcome::Success => &self.runs_succeeded,
            RunOutcome::Canceled => &self.runs_canceled,
            RunOutcome::Failed(_) => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_run_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_internal_cancel(&self) {
        self.internal_cancels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_export(&self) {
        self.exports.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs that have ended, whatever the outcome
    pub fn runs_completed(&self) -> u64 {
        self.runs_succeeded.load(Ordering::Relaxed)
            + self.runs_failed.load(Ordering::Relaxed)
            + self.runs_canceled.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average processing time per completed run in milliseconds
    pub fn avg_run_time_ms(&self) -> f64 {
        let total = self.total_run_time_ms.load(Ordering::Relaxed);
        let count = self.runs_completed();
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Coordinator Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Runs: {} started, {} succeeded, {} failed, {} canceled ({} internal)",
            self.runs_started.load(Ordering::Relaxed),
            self.runs_succeeded.load(Ordering::Relaxed),
            self.runs_failed.load(Ordering::Relaxed),
            self.runs_canceled.load(Ordering::Relaxed),
            self.internal_cancels.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Processing time: {:.2}s (avg: {:.2}ms per run), exports: {}",
            self.total_run_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_run_time_ms(),
            self.exports.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
