//! Job contract - the slicing engine as seen by the coordinator.
//!
//! The engine itself is an external collaborator. This module defines what the
//! coordinator needs from it:
//!
//! - [`CancelableJob`]: process / cancel / restart plus the re-entrant state lock
//! - [`GcodeJob`]: FFF kind, exports G-code to a temporary file first
//! - [`ArchiveJob`]: SLA kind, exports a zipped archive directly
//! - [`JobControl`]: cancellation status, cancel callback and state lock, embedded by
//!   job implementations so the bookkeeping half of the contract is shared
//!
//! # Cancellation
//!
//! Cancellation is cooperative. `process()` checks [`CancelableJob::check_canceled`]
//! at fine-grained points and returns [`JobError::Canceled`] once a cancel was issued.
//! Two origins are distinguished by [`CancelStatus`]: a user request (`cancel()`) and an
//! internal one issued while re-applying configuration (`cancel_internal()`).

pub mod lock;

use crate::models::{ApplyStatus, Model, PrintConfig, PrintStatistics, Technology};
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

pub use lock::{StateGuard, StateLock};

/// Why a job is (or is not) canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelStatus {
    NotCanceled = 0,
    /// `cancel()` - reported to the notification sink.
    CanceledByUser = 1,
    /// `cancel_internal()` - issued by `apply()`, never reported.
    CanceledInternal = 2,
}

impl CancelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CancelStatus::CanceledByUser,
            2 => CancelStatus::CanceledInternal,
            _ => CancelStatus::NotCanceled,
        }
    }
}

/// Caller misuse of the step protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Step {0} marked done without being started")]
    StepNotStarted(&'static str),

    #[error("Step {0} is already done")]
    StepAlreadyDone(&'static str),
}

/// Errors returned by job processing.
#[derive(Error, Debug)]
pub enum JobError {
    /// Expected outcome of a cancel request, never reported as a failure.
    #[error("Processing was canceled")]
    Canceled,

    #[error("{0}")]
    Failure(String),

    #[error("Copying of the temporary G-code to the output G-code failed ({from} -> {to}): {source}")]
    Copy {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

impl JobError {
    pub fn failure(message: impl Into<String>) -> Self {
        JobError::Failure(message.into())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, JobError::Canceled)
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;

/// Callback a job invokes while holding its state lock, before it changes data
/// that a running or finished step depends on.
///
/// The guard is the ticket for the held lock; the coordinator may release it
/// while waiting for the worker to acknowledge the cancellation.
pub type CancelCallback = Arc<dyn Fn(&mut StateGuard<'_>) + Send + Sync>;

/// Cancellation bookkeeping shared by all job implementations.
#[derive(Default)]
pub struct JobControl {
    state_lock: StateLock,
    cancel_status: AtomicU8,
    cancel_callback: Mutex<Option<CancelCallback>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_lock(&self) -> &StateLock {
        &self.state_lock
    }

    pub fn cancel(&self) {
        self.cancel_status
            .store(CancelStatus::CanceledByUser as u8, Ordering::SeqCst);
    }

    pub fn cancel_internal(&self) {
        self.cancel_status
            .store(CancelStatus::CanceledInternal as u8, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.cancel_status
            .store(CancelStatus::NotCanceled as u8, Ordering::SeqCst);
    }

    pub fn cancel_status(&self) -> CancelStatus {
        CancelStatus::from_u8(self.cancel_status.load(Ordering::SeqCst))
    }

    pub fn canceled(&self) -> bool {
        self.cancel_status() != CancelStatus::NotCanceled
    }

    pub fn check_canceled(&self) -> JobResult<()> {
        if self.canceled() {
            Err(JobError::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn set_cancel_callback(&self, callback: Option<CancelCallback>) {
        *self.cancel_callback.lock() = callback;
    }

    pub fn has_cancel_callback(&self) -> bool {
        self.cancel_callback.lock().is_some()
    }

    /// Invoke the cancel callback, if any.
    ///
    /// The callback is cloned out first: the coordinator clears it from inside
    /// the call.
    pub fn invoke_cancel_callback(&self, guard: &mut StateGuard<'_>) {
        let callback = self.cancel_callback.lock().clone();
        if let Some(callback) = callback {
            callback(guard);
        }
    }
}

/// The external slicing engine contract.
///
/// Implementors provide [`control`](Self::control) and the processing methods;
/// cancellation and locking default to the embedded [`JobControl`].
///
/// `restart()` and the cancel-status queries are called by the worker while it
/// holds the coordinator mutex and must not take the state lock.
pub trait CancelableJob: Send + Sync {
    fn control(&self) -> &JobControl;

    fn technology(&self) -> Technology;

    /// Run the slicing pipeline. Returns [`JobError::Canceled`] once canceled.
    fn process(&self) -> JobResult<()>;

    /// No object in the model, or nothing printable.
    fn empty(&self) -> bool;

    /// Check the configuration before slicing; `Some(message)` if it is unusable.
    fn validate(&self) -> Option<String> {
        None
    }

    /// Apply a new model and configuration. Invalidating running or finished
    /// work must go through the state lock and the cancel callback.
    fn apply(&self, model: &Model, config: &PrintConfig) -> ApplyStatus;

    /// Drop all processed data.
    fn clear(&self);

    fn cancel(&self) {
        self.control().cancel();
    }

    fn cancel_internal(&self) {
        self.control().cancel_internal();
    }

    fn canceled(&self) -> bool {
        self.control().canceled()
    }

    fn cancel_status(&self) -> CancelStatus {
        self.control().cancel_status()
    }

    /// Reset the transient cancel state after a run.
    fn restart(&self) {
        self.control().restart();
    }

    fn set_cancel_callback(&self, callback: Option<CancelCallback>) {
        self.control().set_cancel_callback(callback);
    }

    fn state_lock(&self) -> &StateLock {
        self.control().state_lock()
    }

    fn check_canceled(&self) -> JobResult<()> {
        self.control().check_canceled()
    }
}

/// FFF job: G-code is first written to a temporary file, then finalized.
pub trait GcodeJob: CancelableJob {
    fn export_gcode(&self, path: &Utf8Path) -> JobResult<()>;

    fn print_statistics(&self) -> PrintStatistics;
}

/// SLA job: the raster archive is written straight to the export target.
pub trait ArchiveJob: CancelableJob {
    fn export_archive(&self, path: &Utf8Path) -> JobResult<()>;
}
