//! Background slicing coordinator.
//!
//! [`WorkerCoordinator`] owns one long-lived worker thread and drives it through
//! a small state machine guarded by a single mutex/condvar pair:
//!
//! ```text
//! Initial --start()--> Idle --start()--> Started --worker--> Running
//! Running --done/failed--> Finished      Running --canceled--> Canceled
//! Finished|Canceled --stop()--> Idle     Started|Running --stop()--> Canceled --> Idle
//! Idle --join_background_thread()--> Exit --> Exited
//! ```
//!
//! The job's own state lock is independent of the coordinator mutex. A job that
//! must invalidate running work while holding its lock calls the cancel callback
//! with its [`StateGuard`]; the coordinator releases that guard while it waits for
//! the worker to acknowledge the cancellation.
//!
//! # Caller rules
//!
//! - `stop()`, `reset()` and `start()` must not be called while holding the job's
//!   state lock.
//! - The cancel callback must be invoked from the control side, never from inside
//!   the job's `process()`.

mod worker;

use crate::job::{ArchiveJob, CancelCallback, CancelableJob, GcodeJob, StateGuard};
use crate::metrics::Metrics;
use crate::models::{ApplyStatus, CoordinatorSettings, Model, PrintConfig, Technology, UploadJob};
use crate::notify::{LogSink, NotificationSink};
use crate::services::export::{OutputNameFormatter, temp_output_path, unique_upload_path};
use crate::steps::{CoordinatorStep, StepTracker};
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// State of the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No thread yet.
    Initial,
    /// Waiting for a task.
    Idle,
    /// Task requested, worker not yet awake.
    Started,
    Running,
    Finished,
    Canceled,
    /// Thread asked to terminate.
    Exit,
    /// Thread is terminating or gone.
    Exited,
}

impl WorkerState {
    pub fn is_running(self) -> bool {
        matches!(self, WorkerState::Started | WorkerState::Running)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors returned by coordinator operations
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Cannot start a background task, the worker thread is not idle (state {0})")]
    NotIdle(WorkerState),

    #[error("An export to {0} is already scheduled")]
    ExportAlreadyScheduled(Utf8PathBuf),

    #[error("Not allowed while a background task is running")]
    Running,

    #[error("Configuration is for {config}, but the active job is {active}")]
    TechnologyMismatch {
        active: Technology,
        config: Technology,
    },

    #[error("Failed to spawn the background thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Last-resort handler for a fault that escaped the worker loop.
pub type FaultHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default)]
struct ExportTarget {
    path: Option<Utf8PathBuf>,
    upload: Option<UploadJob>,
}

/// State shared between the owner and the worker thread.
pub(crate) struct Shared {
    state: Mutex<WorkerState>,
    condition: Condvar,
    /// Runs the worker has ended. Only changed with `state` locked.
    completed_runs: AtomicU64,
    technology: RwLock<Technology>,
    fff: Arc<dyn GcodeJob>,
    sla: Arc<dyn ArchiveJob>,
    export: Mutex<ExportTarget>,
    steps: StepTracker<CoordinatorStep>,
    temp_dir: Utf8PathBuf,
    temp_output_path: Utf8PathBuf,
    formatter: OutputNameFormatter,
    sink: Arc<dyn NotificationSink>,
    metrics: Metrics,
    fault_handler: FaultHandler,
}

impl Shared {
    fn technology(&self) -> Technology {
        *self.technology.read()
    }

    fn job_for(&self, technology: Technology) -> &dyn CancelableJob {
        match technology {
            Technology::Fff => &*self.fff,
            Technology::Sla => &*self.sla,
        }
    }

    fn job(&self) -> &dyn CancelableJob {
        self.job_for(self.technology())
    }

    /// Callback installed on the job while a run is active.
    ///
    /// Holds only a weak reference: the job is owned by `Shared`.
    fn cancel_callback(self: &Arc<Self>) -> CancelCallback {
        let shared = Arc::downgrade(self);
        Arc::new(move |ticket: &mut StateGuard<'_>| {
            if let Some(shared) = shared.upgrade() {
                shared.stop_internal(ticket);
            }
        })
    }

    /// Cancellation requested by the job while it holds its state lock.
    ///
    /// Emits no notification. The ticket is released while waiting for the
    /// worker and held again on return.
    fn stop_internal(&self, ticket: &mut StateGuard<'_>) {
        let mut state = self.state.lock();
        match *state {
            WorkerState::Initial | WorkerState::Idle | WorkerState::Exit | WorkerState::Exited => {
                return;
            }
            WorkerState::Started | WorkerState::Running => {
                let job = self.job();
                // Set before the ticket is released: the worker's next step
                // check under the state lock must fail. A pending user cancel
                // keeps its status so the run is still reported.
                if !job.canceled() {
                    job.cancel_internal();
                }
                tracing::debug!("Internal cancellation, waiting for the worker");
                ticket.unlocked(|| self.wait_for_run_end(&mut state));
            }
            WorkerState::Finished | WorkerState::Canceled => {}
        }
        self.settle(&mut state);
    }

    /// Block until the worker ends the active run or exits.
    ///
    /// Waits on the run counter rather than on `Canceled`: another waiter may
    /// already have moved the state on to `Idle`.
    fn wait_for_run_end(&self, state: &mut MutexGuard<'_, WorkerState>) {
        let run = self.completed_runs.load(Ordering::SeqCst);
        self.condition.wait_while(state, |s| {
            *s != WorkerState::Exited && self.completed_runs.load(Ordering::SeqCst) == run
        });
    }

    /// Acknowledge an ended run. Leaves a run started by someone else alone.
    fn settle(&self, state: &mut MutexGuard<'_, WorkerState>) {
        if matches!(**state, WorkerState::Finished | WorkerState::Canceled) {
            **state = WorkerState::Idle;
        }
        if !state.is_running() {
            self.job().set_cancel_callback(None);
        }
    }

    /// Called by the worker with `state` locked once a run has ended.
    fn run_ended(&self) {
        self.completed_runs.fetch_add(1, Ordering::SeqCst);
        self.condition.notify_all();
    }

    fn invalidate_step(&self, step: CoordinatorStep, ticket: &mut StateGuard<'_>) -> bool {
        self.steps
            .invalidate(step, ticket, |ticket| self.stop_internal(ticket))
    }

    fn set_step_started<J>(&self, job: &J, step: CoordinatorStep) -> crate::job::JobResult<bool>
    where
        J: CancelableJob + ?Sized,
    {
        self.steps
            .set_started(step, job.state_lock(), || job.check_canceled())
    }

    fn set_step_done<J>(&self, job: &J, step: CoordinatorStep) -> crate::job::JobResult<()>
    where
        J: CancelableJob + ?Sized,
    {
        self.steps
            .set_done(step, job.state_lock(), || job.check_canceled())
    }

    /// Export target and upload descriptor, read under the job's state lock.
    fn export_snapshot<J>(&self, job: &J) -> (Option<Utf8PathBuf>, Option<UploadJob>)
    where
        J: CancelableJob + ?Sized,
    {
        let _guard = job.state_lock().lock();
        let export = self.export.lock();
        (export.path.clone(), export.upload.clone())
    }
}

/// Builder for [`WorkerCoordinator`].
pub struct CoordinatorBuilder {
    fff: Arc<dyn GcodeJob>,
    sla: Arc<dyn ArchiveJob>,
    sink: Arc<dyn NotificationSink>,
    temp_dir: Option<Utf8PathBuf>,
    technology: Technology,
    fault_handler: Option<FaultHandler>,
}

impl CoordinatorBuilder {
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn temp_dir(mut self, temp_dir: impl Into<Utf8PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn settings(mut self, settings: &CoordinatorSettings) -> Self {
        self.temp_dir = Some(settings.resolved_temp_dir());
        self
    }

    pub fn technology(mut self, technology: Technology) -> Self {
        self.technology = technology;
        self
    }

    pub fn fault_handler(mut self, handler: FaultHandler) -> Self {
        self.fault_handler = Some(handler);
        self
    }

    pub fn build(self) -> WorkerCoordinator {
        let temp_dir = self
            .temp_dir
            .unwrap_or_else(|| CoordinatorSettings::default().resolved_temp_dir());
        let temp_output_path = temp_output_path(&temp_dir);
        let fault_handler: FaultHandler = match self.fault_handler {
            Some(handler) => handler,
            None => Arc::new(|message: &str| {
                tracing::error!("Unhandled fault in the background thread: {}", message);
            }),
        };

        tracing::debug!(
            "Coordinator created: technology={}, temp_output={}",
            self.technology,
            temp_output_path
        );

        WorkerCoordinator {
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::Initial),
                condition: Condvar::new(),
                completed_runs: AtomicU64::new(0),
                technology: RwLock::new(self.technology),
                fff: self.fff,
                sla: self.sla,
                export: Mutex::new(ExportTarget::default()),
                steps: StepTracker::new(),
                temp_dir,
                temp_output_path,
                formatter: OutputNameFormatter::new(),
                sink: self.sink,
                metrics: Metrics::new(),
                fault_handler,
            }),
            thread: Mutex::new(None),
        }
    }
}

/// Supervises background slicing runs on a dedicated worker thread.
///
/// All operations take `&self`; the coordinator can be shared behind an `Arc`.
/// Concurrent `stop()` and internal cancellations all return once the worker
/// ends the run.
/// Dropping it stops any active run, joins the thread and removes the
/// temporary output file.
pub struct WorkerCoordinator {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerCoordinator {
    /// Start building a coordinator over the two job kinds.
    pub fn builder(fff: Arc<dyn GcodeJob>, sla: Arc<dyn ArchiveJob>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            fff,
            sla,
            sink: Arc::new(LogSink),
            temp_dir: None,
            technology: Technology::Fff,
            fault_handler: None,
        }
    }

    /// Switch the active job kind. A different kind forces a full [`reset`](Self::reset).
    ///
    /// Returns whether the technology changed.
    pub fn select_technology(&self, technology: Technology) -> bool {
        let current = self.shared.technology();
        if current == technology {
            return false;
        }
        self.reset();
        *self.shared.technology.write() = technology;
        tracing::info!("Printer technology switched: {} -> {}", current, technology);
        true
    }

    pub fn current_printer_technology(&self) -> Technology {
        self.shared.technology()
    }

    /// Start a background run.
    ///
    /// `Ok(false)` if the job is empty or a run is already active. The worker
    /// thread is spawned on the first call.
    pub fn start(&self) -> Result<bool, CoordinatorError> {
        let shared = &self.shared;
        let job = shared.job();
        if job.empty() {
            tracing::debug!("Not starting: job is empty");
            return Ok(false);
        }

        let mut state = shared.state.lock();
        if *state == WorkerState::Initial {
            let worker = Arc::clone(shared);
            let handle = thread::Builder::new()
                .name("slicer-worker".to_string())
                .spawn(move || worker::thread_proc_safe(worker))
                .map_err(CoordinatorError::Spawn)?;
            *self.thread.lock() = Some(handle);
            // Wait until the worker is ready to execute a task.
            shared
                .condition
                .wait_while(&mut state, |s| *s == WorkerState::Initial);
            tracing::debug!("Background thread ready");
        }

        if state.is_running() {
            return Ok(false);
        }
        if *state != WorkerState::Idle {
            return Err(CoordinatorError::NotIdle(*state));
        }

        *state = WorkerState::Started;
        job.set_cancel_callback(Some(shared.cancel_callback()));
        drop(state);
        shared.condition.notify_all();

        shared.metrics.record_run_started();
        tracing::info!("Background run started ({})", shared.technology());
        Ok(true)
    }

    /// Stop the active run, blocking until the worker acknowledges it.
    ///
    /// Returns false only if the worker was never started.
    pub fn stop(&self) -> bool {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        match *state {
            WorkerState::Initial => return false,
            WorkerState::Started | WorkerState::Running => {
                let job = shared.job();
                tracing::info!("Canceling background run");
                job.cancel();
                shared.wait_for_run_end(&mut state);
                shared.settle(&mut state);
            }
            WorkerState::Finished | WorkerState::Canceled => shared.settle(&mut state),
            WorkerState::Idle | WorkerState::Exit | WorkerState::Exited => {}
        }
        true
    }

    /// Cancel on behalf of the job while `ticket` holds its state lock.
    ///
    /// Same path the installed cancel callback takes. Emits no notification.
    pub fn stop_internal(&self, ticket: &mut StateGuard<'_>) {
        self.shared.stop_internal(ticket);
    }

    /// Stop, forget the export target, clear the job and invalidate all steps.
    pub fn reset(&self) -> bool {
        let stopped = self.stop();
        if let Err(e) = self.reset_export() {
            tracing::warn!("Export target kept during reset: {}", e);
        }
        self.shared.job().clear();
        self.invalidate_all_steps();
        stopped
    }

    /// Ask the worker thread to exit and join it. Stops an active run first.
    pub fn join_background_thread(&self) {
        {
            let state = self.shared.state.lock();
            if *state == WorkerState::Initial {
                // Worker thread has not been started yet.
                return;
            }
        }

        self.stop();

        {
            let mut state = self.shared.state.lock();
            if *state != WorkerState::Exited {
                *state = WorkerState::Exit;
            }
        }
        self.shared.condition.notify_all();

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Background thread terminated by a panic");
            }
            tracing::debug!("Background thread joined");
        }
    }

    /// Schedule the finished result to be exported to `path`.
    ///
    /// Invalidates the finalize step so a stale export is redone; a finalize in
    /// progress is canceled first.
    pub fn schedule_export(&self, path: impl Into<Utf8PathBuf>) -> Result<(), CoordinatorError> {
        let path = path.into();
        if let Some(existing) = self.shared.export.lock().path.clone() {
            return Err(CoordinatorError::ExportAlreadyScheduled(existing));
        }

        let job = self.shared.job();
        // Guard against entering the export step before the path is changed.
        let mut ticket = job.state_lock().lock();
        self.shared
            .invalidate_step(CoordinatorStep::GcodeFinalize, &mut ticket);
        let mut export = self.shared.export.lock();
        if let Some(existing) = &export.path {
            return Err(CoordinatorError::ExportAlreadyScheduled(existing.clone()));
        }
        tracing::info!("Export scheduled: {}", path);
        export.path = Some(path);
        Ok(())
    }

    /// Schedule an upload: the result is exported to a fresh temporary file and
    /// handed to the uploader through the sink. Returns the temporary path.
    pub fn schedule_upload(&self, upload: UploadJob) -> Result<Utf8PathBuf, CoordinatorError> {
        if let Some(existing) = self.shared.export.lock().path.clone() {
            return Err(CoordinatorError::ExportAlreadyScheduled(existing));
        }

        let path = unique_upload_path(&self.shared.temp_dir);
        let job = self.shared.job();
        let mut ticket = job.state_lock().lock();
        self.shared
            .invalidate_step(CoordinatorStep::GcodeFinalize, &mut ticket);
        let mut export = self.shared.export.lock();
        if let Some(existing) = &export.path {
            return Err(CoordinatorError::ExportAlreadyScheduled(existing.clone()));
        }
        tracing::info!("Upload to {} scheduled via {}", upload.host, path);
        export.path = Some(path.clone());
        export.upload = Some(upload);
        Ok(path)
    }

    /// Forget the export target. Only legal while no run is active.
    pub fn reset_export(&self) -> Result<(), CoordinatorError> {
        if self.running() {
            return Err(CoordinatorError::Running);
        }
        let job = self.shared.job();
        let mut ticket = job.state_lock().lock();
        {
            let mut export = self.shared.export.lock();
            export.path = None;
            export.upload = None;
        }
        self.shared
            .invalidate_step(CoordinatorStep::GcodeFinalize, &mut ticket);
        Ok(())
    }

    pub fn export_target(&self) -> Option<Utf8PathBuf> {
        self.shared.export.lock().path.clone()
    }

    pub fn upload_job(&self) -> Option<UploadJob> {
        self.shared.export.lock().upload.clone()
    }

    pub fn is_step_done(&self, step: CoordinatorStep) -> bool {
        let job = self.shared.job();
        self.shared.steps.is_done(step, job.state_lock())
    }

    fn invalidate_all_steps(&self) -> bool {
        let job = self.shared.job();
        let mut ticket = job.state_lock().lock();
        self.shared
            .steps
            .invalidate_all(&mut ticket, |ticket| self.shared.stop_internal(ticket))
    }

    pub fn empty(&self) -> bool {
        self.shared.job().empty()
    }

    pub fn validate(&self) -> Option<String> {
        self.shared.job().validate()
    }

    /// Apply a model and configuration to the active job.
    ///
    /// The job cancels running work through the cancel callback if the change
    /// invalidates it.
    pub fn apply(&self, model: &Model, config: &PrintConfig) -> Result<ApplyStatus, CoordinatorError> {
        let active = self.shared.technology();
        if config.technology != active {
            return Err(CoordinatorError::TechnologyMismatch {
                active,
                config: config.technology,
            });
        }
        let status = self.shared.job().apply(model, config);
        tracing::debug!("Applied configuration: {:?}", status);
        Ok(status)
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Started or running.
    pub fn running(&self) -> bool {
        self.state().is_running()
    }

    pub fn idle(&self) -> bool {
        self.state() == WorkerState::Idle
    }

    pub fn finished(&self) -> bool {
        self.state() == WorkerState::Finished
    }

    pub fn temp_output_path(&self) -> &Utf8Path {
        &self.shared.temp_output_path
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }
}

impl Drop for WorkerCoordinator {
    fn drop(&mut self) {
        self.stop();
        self.join_background_thread();
        let temp = &self.shared.temp_output_path;
        if temp.exists() {
            match fs::remove_file(temp) {
                Ok(()) => tracing::debug!("Removed temporary output {}", temp),
                Err(e) => tracing::warn!("Failed to remove temporary output {}: {}", temp, e),
            }
        }
    }
}
