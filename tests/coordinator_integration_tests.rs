//! Integration tests for WorkerCoordinator driving simulated jobs
//!
//! These tests verify that the coordinator correctly:
//! - Moves through the worker state machine on start/stop/join
//! - Reports each run exactly once, except internally canceled ones
//! - Finalizes exports once per scheduled target
//! - Cleans up its thread and temporary file when dropped

use camino::{Utf8Path, Utf8PathBuf};
use mockall::mock;
use parking_lot::{Condvar, Mutex};
use proptest::prelude::*;
use slicer_worker::services::{SimulatedJob, SimulationPlan};
use slicer_worker::{
    ApplyStatus, CancelStatus, CancelableJob, ChannelSink, CoordinatorError, CoordinatorStep,
    GcodeJob, JobControl, JobResult, Model, ModelObject, Notification, NotificationSink,
    PrintConfig, PrintStatistics, RunOutcome, Technology, UploadJob, WorkerCoordinator,
    WorkerState,
};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

mock! {
    pub Sink {}

    impl NotificationSink for Sink {
        fn slicing_completed(&self);
        fn run_finished(&self, outcome: &RunOutcome);
        fn status(&self, percent: u8, message: &str);
        fn export_ready(&self, path: &Utf8Path);
        fn upload_ready(&self, job: &UploadJob, path: &Utf8Path);
    }
}

struct Fixture {
    coordinator: WorkerCoordinator,
    fff: Arc<SimulatedJob>,
    sla: Arc<SimulatedJob>,
    root: Utf8PathBuf,
    _dir: TempDir,
}

fn fixture_with_sink(plan: SimulationPlan, sink: Arc<dyn NotificationSink>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    let fff = Arc::new(SimulatedJob::fff(plan.clone()));
    let sla = Arc::new(SimulatedJob::sla(plan));
    let coordinator = WorkerCoordinator::builder(fff.clone(), sla.clone())
        .sink(sink)
        .temp_dir(&root)
        .build();
    Fixture {
        coordinator,
        fff,
        sla,
        root,
        _dir: dir,
    }
}

fn fixture(plan: SimulationPlan) -> (Fixture, broadcast::Receiver<Notification>) {
    let sink = Arc::new(ChannelSink::new(64));
    let rx = sink.subscribe();
    (fixture_with_sink(plan, sink), rx)
}

fn cube() -> Model {
    Model::new(vec![ModelObject::new("cube", 1)])
}

fn fff_config() -> PrintConfig {
    PrintConfig::new(Technology::Fff).with_option("layer_height", "0.2")
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Collect events until the next RunFinished.
async fn next_outcome(
    rx: &mut broadcast::Receiver<Notification>,
) -> (RunOutcome, Vec<Notification>) {
    let mut seen = Vec::new();
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Channel closed");
        match event {
            Notification::RunFinished(outcome) => return (outcome, seen),
            other => seen.push(other),
        }
    }
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn test_start_on_empty_job_is_noop() {
    let (fx, mut rx) = fixture(SimulationPlan::instant());

    assert!(!fx.coordinator.start().unwrap());
    assert_eq!(fx.coordinator.state(), WorkerState::Initial);
    assert!(!fx.coordinator.stop());
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_second_start_while_running_returns_false() {
    let (fx, _rx) = fixture(SimulationPlan::instant().gated_at(0));
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    fx.fff.gate().hold();

    assert!(fx.coordinator.start().unwrap());
    assert!(fx.fff.gate().wait_reached(WAIT));
    assert!(fx.coordinator.running());
    assert!(!fx.coordinator.start().unwrap());

    fx.fff.gate().release();
    assert!(wait_until(|| fx.coordinator.finished()));
    assert_eq!(fx.fff.process_calls(), 1);
}

#[test]
fn test_user_stop_mid_run_reports_canceled() {
    let (fx, mut rx) = fixture(SimulationPlan::instant().gated_at(1));
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    fx.fff.gate().hold();

    fx.coordinator.start().unwrap();
    assert!(fx.fff.gate().wait_reached(WAIT));

    assert!(fx.coordinator.stop());
    assert_eq!(fx.coordinator.state(), WorkerState::Idle);

    // Delivered before stop() could observe Canceled
    let events = drain(&mut rx);
    assert_eq!(events, vec![Notification::RunFinished(RunOutcome::Canceled)]);
    assert_eq!(fx.coordinator.metrics().runs_canceled.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_completion_with_export_finalizes_once() {
    let (fx, mut rx) = fixture(SimulationPlan::instant());
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    let target = fx.root.join("out/part_[print_time].gcode");
    fx.coordinator.schedule_export(&target).unwrap();

    assert!(fx.coordinator.start().unwrap());
    let (outcome, events) = next_outcome(&mut rx).await;
    assert_eq!(outcome, RunOutcome::Success);

    let exported = fx.root.join("out/part_0h4m.gcode");
    assert!(exported.exists(), "expected {}", exported);
    assert_eq!(events[0], Notification::SlicingCompleted);
    assert!(events.contains(&Notification::Status {
        percent: 100,
        message: format!("G-code file exported to {}", exported),
    }));
    assert!(events.contains(&Notification::ExportReady {
        path: exported.clone()
    }));
    assert!(fx.coordinator.is_step_done(CoordinatorStep::GcodeFinalize));

    // The finalize step is done: a second run does not export again
    fx.coordinator.stop();
    assert!(fx.coordinator.start().unwrap());
    let (outcome, events) = next_outcome(&mut rx).await;
    assert_eq!(outcome, RunOutcome::Success);
    assert!(!events.iter().any(|e| matches!(e, Notification::ExportReady { .. })));
    assert_eq!(fx.coordinator.metrics().exports.load(Ordering::Relaxed), 1);

    let temp = fx.coordinator.temp_output_path().to_path_buf();
    assert!(temp.exists());
    drop(fx);
    assert!(!temp.exists());
}

#[tokio::test]
async fn test_completion_without_target_reports_slicing_complete() {
    let (fx, mut rx) = fixture(SimulationPlan::instant());
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();

    fx.coordinator.start().unwrap();
    let (outcome, events) = next_outcome(&mut rx).await;

    assert!(outcome.success());
    assert_eq!(
        events,
        vec![
            Notification::SlicingCompleted,
            Notification::Status {
                percent: 100,
                message: "Slicing complete".to_string()
            },
        ]
    );
    assert_eq!(fx.fff.export_calls(), 1);
}

#[test]
fn test_second_schedule_export_rejected() {
    let (fx, _rx) = fixture(SimulationPlan::instant());
    let first = fx.root.join("first.gcode");

    fx.coordinator.schedule_export(&first).unwrap();
    let err = fx
        .coordinator
        .schedule_export(fx.root.join("second.gcode"))
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::ExportAlreadyScheduled(ref p) if *p == first));
    assert_eq!(fx.coordinator.export_target(), Some(first));
}

#[tokio::test]
async fn test_schedule_upload_hands_file_to_uploader() {
    let (fx, mut rx) = fixture(SimulationPlan::instant());
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    let upload = UploadJob {
        host: "printer.local".to_string(),
        upload_path: "jobs/cube.gcode".into(),
        start_print: true,
    };

    let path = fx.coordinator.schedule_upload(upload.clone()).unwrap();
    assert_eq!(path.parent(), Some(fx.root.as_path()));
    assert!(path.file_name().unwrap().starts_with(".upload."));
    assert_eq!(fx.coordinator.upload_job(), Some(upload.clone()));

    fx.coordinator.start().unwrap();
    let (outcome, events) = next_outcome(&mut rx).await;
    assert!(outcome.success());
    assert!(events.contains(&Notification::UploadReady {
        job: upload,
        path: path.clone()
    }));
    assert!(path.exists());
}

#[test]
fn test_reset_clears_steps_and_export() {
    let (fx, _rx) = fixture(SimulationPlan::instant());
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    fx.coordinator
        .schedule_export(fx.root.join("out.gcode"))
        .unwrap();
    fx.coordinator.start().unwrap();
    assert!(wait_until(|| fx.coordinator.finished()));
    assert!(fx.coordinator.is_step_done(CoordinatorStep::GcodeFinalize));

    assert!(fx.coordinator.reset());

    assert!(!fx.coordinator.is_step_done(CoordinatorStep::GcodeFinalize));
    assert_eq!(fx.coordinator.export_target(), None);
    assert_eq!(fx.coordinator.state(), WorkerState::Idle);
    assert!(fx.coordinator.empty());
}

#[test]
fn test_reset_export_rejected_while_running() {
    let (fx, _rx) = fixture(SimulationPlan::instant().gated_at(0));
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    fx.coordinator
        .schedule_export(fx.root.join("out.gcode"))
        .unwrap();
    fx.fff.gate().hold();
    fx.coordinator.start().unwrap();
    assert!(fx.fff.gate().wait_reached(WAIT));

    assert!(matches!(
        fx.coordinator.reset_export(),
        Err(CoordinatorError::Running)
    ));
    assert!(fx.coordinator.export_target().is_some());

    fx.coordinator.stop();
    fx.coordinator.reset_export().unwrap();
    assert_eq!(fx.coordinator.export_target(), None);
}

#[test]
fn test_apply_mid_run_cancels_silently() {
    let mut sink = MockSink::new();
    // The canceled run must not be reported; the rerun is reported once
    sink.expect_run_finished()
        .withf(|outcome| outcome.success())
        .times(1)
        .return_const(());
    sink.expect_slicing_completed().times(1).return_const(());
    sink.expect_status()
        .withf(|percent, message| *percent == 100 && message == "Slicing complete")
        .times(1)
        .return_const(());

    let fx = fixture_with_sink(SimulationPlan::instant().gated_at(0), Arc::new(sink));
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    fx.fff.gate().hold();
    fx.coordinator.start().unwrap();
    assert!(fx.fff.gate().wait_reached(WAIT));

    let changed = fff_config().with_option("layer_height", "0.1");
    let status = fx.coordinator.apply(&cube(), &changed).unwrap();

    assert_eq!(status, ApplyStatus::Invalidated);
    assert_eq!(fx.coordinator.state(), WorkerState::Idle);
    let metrics = fx.coordinator.metrics();
    assert_eq!(metrics.internal_cancels.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.runs_canceled.load(Ordering::Relaxed), 1);
    assert!(!fx.fff.canceled());

    fx.fff.gate().release();
    fx.coordinator.start().unwrap();
    assert!(wait_until(|| fx.coordinator.finished()));
    assert!(fx.fff.is_sliced());
}

#[tokio::test]
async fn test_job_failure_is_reported() {
    let (fx, mut rx) = fixture(SimulationPlan::instant().failing_at(1));
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();

    fx.coordinator.start().unwrap();
    let (outcome, events) = next_outcome(&mut rx).await;

    assert_eq!(
        outcome,
        RunOutcome::Failed("Simulated failure at stage 1".to_string())
    );
    assert_eq!(outcome.code(), 0);
    assert!(events.is_empty());
    assert_eq!(fx.coordinator.state(), WorkerState::Finished);
}

#[tokio::test]
async fn test_job_panic_becomes_failure() {
    let (fx, mut rx) = fixture(SimulationPlan::instant().panicking_at(0));
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();

    fx.coordinator.start().unwrap();
    let (outcome, _) = next_outcome(&mut rx).await;

    assert_eq!(outcome.error_message(), Some("Simulated fault at stage 0"));

    // The worker survives and takes the next task
    fx.fff.set_plan(SimulationPlan::instant());
    fx.coordinator.stop();
    fx.coordinator.start().unwrap();
    let (outcome, _) = next_outcome(&mut rx).await;
    assert!(outcome.success());
}

#[tokio::test]
async fn test_sla_export_writes_archive() {
    let (fx, mut rx) = fixture(SimulationPlan::instant());
    assert!(fx.coordinator.select_technology(Technology::Sla));
    assert!(!fx.coordinator.select_technology(Technology::Sla));
    assert_eq!(fx.coordinator.current_printer_technology(), Technology::Sla);

    fx.coordinator
        .apply(&cube(), &PrintConfig::new(Technology::Sla))
        .unwrap();
    let target = fx.root.join("part.sl1");
    fx.coordinator.schedule_export(&target).unwrap();

    fx.coordinator.start().unwrap();
    let (outcome, events) = next_outcome(&mut rx).await;

    assert!(outcome.success());
    assert!(events.contains(&Notification::Status {
        percent: 100,
        message: format!("Zip file exported to {}", target),
    }));
    assert_eq!(&fs::read(&target).unwrap()[..2], b"PK");
    assert_eq!(fx.sla.export_calls(), 1);
    assert_eq!(fx.fff.process_calls(), 0);
}

#[test]
fn test_select_technology_resets_export() {
    let (fx, _rx) = fixture(SimulationPlan::instant());
    fx.coordinator
        .schedule_export(fx.root.join("out.gcode"))
        .unwrap();

    assert!(fx.coordinator.select_technology(Technology::Sla));
    assert_eq!(fx.coordinator.export_target(), None);
}

#[test]
fn test_apply_rejects_other_technology() {
    let (fx, _rx) = fixture(SimulationPlan::instant());

    let err = fx
        .coordinator
        .apply(&cube(), &PrintConfig::new(Technology::Sla))
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::TechnologyMismatch {
            active: Technology::Fff,
            config: Technology::Sla
        }
    ));
}

#[test]
fn test_stop_internal_under_job_lock() {
    let (fx, mut rx) = fixture(SimulationPlan::instant().gated_at(0));
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();

    // No-op before the worker exists
    let mut ticket = fx.fff.state_lock().lock();
    fx.coordinator.stop_internal(&mut ticket);
    drop(ticket);
    assert_eq!(fx.coordinator.state(), WorkerState::Initial);

    fx.fff.gate().hold();
    fx.coordinator.start().unwrap();
    assert!(fx.fff.gate().wait_reached(WAIT));

    let mut ticket = fx.fff.state_lock().lock();
    fx.coordinator.stop_internal(&mut ticket);
    assert!(fx.fff.state_lock().is_owned_by_current_thread());
    drop(ticket);

    assert_eq!(fx.coordinator.state(), WorkerState::Idle);
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_start_after_join_is_rejected() {
    let (fx, _rx) = fixture(SimulationPlan::instant());
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    fx.coordinator.start().unwrap();
    assert!(wait_until(|| fx.coordinator.finished()));

    fx.coordinator.join_background_thread();
    assert_eq!(fx.coordinator.state(), WorkerState::Exited);
    assert!(matches!(
        fx.coordinator.start(),
        Err(CoordinatorError::NotIdle(WorkerState::Exited))
    ));
}

#[test]
fn test_drop_while_running_stops_and_cleans_up() {
    let (fx, _rx) = fixture(SimulationPlan::instant());
    fx.coordinator.apply(&cube(), &fff_config()).unwrap();
    fx.coordinator.start().unwrap();
    assert!(wait_until(|| fx.coordinator.finished()));
    let temp = fx.coordinator.temp_output_path().to_path_buf();
    assert!(temp.exists());

    // Re-slice and park the run at the gate
    fx.fff.set_plan(SimulationPlan::instant().gated_at(0));
    fx.coordinator
        .apply(&cube(), &fff_config().with_option("infill", "20%"))
        .unwrap();
    fx.fff.gate().hold();
    fx.coordinator.stop();
    fx.coordinator.start().unwrap();
    assert!(fx.fff.gate().wait_reached(WAIT));

    let Fixture {
        coordinator,
        fff,
        sla,
        _dir,
        ..
    } = fx;
    drop(coordinator);

    assert!(!temp.exists());
    // Worker thread joined: nothing else holds the jobs
    assert_eq!(Arc::strong_count(&fff), 1);
    assert_eq!(Arc::strong_count(&sla), 1);
}

/// FFF job whose `process()` ignores cancellation until released.
#[derive(Default)]
struct HeldJob {
    control: JobControl,
    entered: AtomicBool,
    released: Mutex<bool>,
    wake: Condvar,
}

impl HeldJob {
    fn release(&self) {
        *self.released.lock() = true;
        self.wake.notify_all();
    }
}

impl CancelableJob for HeldJob {
    fn control(&self) -> &JobControl {
        &self.control
    }

    fn technology(&self) -> Technology {
        Technology::Fff
    }

    fn process(&self) -> JobResult<()> {
        self.entered.store(true, Ordering::SeqCst);
        let mut released = self.released.lock();
        self.wake.wait_while(&mut released, |released| !*released);
        drop(released);
        self.check_canceled()
    }

    fn empty(&self) -> bool {
        false
    }

    fn apply(&self, _model: &Model, _config: &PrintConfig) -> ApplyStatus {
        let mut guard = self.control.state_lock().lock();
        self.control.invoke_cancel_callback(&mut guard);
        ApplyStatus::Invalidated
    }

    fn clear(&self) {}
}

impl GcodeJob for HeldJob {
    fn export_gcode(&self, path: &Utf8Path) -> JobResult<()> {
        fs::write(path, "; held\n")?;
        Ok(())
    }

    fn print_statistics(&self) -> PrintStatistics {
        PrintStatistics::default()
    }
}

fn held_coordinator(
    fff: Arc<HeldJob>,
    root: &Utf8Path,
) -> (Arc<WorkerCoordinator>, broadcast::Receiver<Notification>) {
    let sink = Arc::new(ChannelSink::new(64));
    let rx = sink.subscribe();
    let coordinator = WorkerCoordinator::builder(
        fff,
        Arc::new(SimulatedJob::sla(SimulationPlan::instant())),
    )
    .sink(sink)
    .temp_dir(root)
    .build();
    (Arc::new(coordinator), rx)
}

#[test]
fn test_internal_then_user_cancel_both_return() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    let fff = Arc::new(HeldJob::default());
    let (coordinator, mut rx) = held_coordinator(fff.clone(), &root);

    assert!(coordinator.start().unwrap());
    assert!(wait_until(|| fff.entered.load(Ordering::SeqCst)));

    let internal = {
        let coordinator = Arc::clone(&coordinator);
        thread::spawn(move || coordinator.apply(&cube(), &fff_config()))
    };
    assert!(wait_until(|| fff.cancel_status() == CancelStatus::CanceledInternal));

    let user = {
        let coordinator = Arc::clone(&coordinator);
        thread::spawn(move || coordinator.stop())
    };
    // stop() sets the user status with the coordinator mutex held and keeps it
    // until it waits, so the worker cannot end the run before both are waiting
    assert!(wait_until(|| fff.cancel_status() == CancelStatus::CanceledByUser));
    fff.release();

    assert!(wait_until(|| internal.is_finished() && user.is_finished()));
    assert_eq!(internal.join().unwrap().unwrap(), ApplyStatus::Invalidated);
    assert!(user.join().unwrap());
    assert_eq!(coordinator.state(), WorkerState::Idle);
    assert!(!fff.control().has_cancel_callback());

    // The user asked for the stop: the run is reported
    assert_eq!(
        drain(&mut rx),
        vec![Notification::RunFinished(RunOutcome::Canceled)]
    );
}

#[test]
fn test_user_cancel_not_downgraded_by_internal_cancel() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    let fff = Arc::new(HeldJob::default());
    let (coordinator, mut rx) = held_coordinator(fff.clone(), &root);

    assert!(coordinator.start().unwrap());
    assert!(wait_until(|| fff.entered.load(Ordering::SeqCst)));

    let user = {
        let coordinator = Arc::clone(&coordinator);
        thread::spawn(move || coordinator.stop())
    };
    assert!(wait_until(|| fff.cancel_status() == CancelStatus::CanceledByUser));

    let internal = {
        let coordinator = Arc::clone(&coordinator);
        thread::spawn(move || coordinator.apply(&cube(), &fff_config()))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fff.cancel_status(), CancelStatus::CanceledByUser);
    fff.release();

    assert!(wait_until(|| internal.is_finished() && user.is_finished()));
    assert!(user.join().unwrap());
    internal.join().unwrap().unwrap();
    assert_eq!(coordinator.state(), WorkerState::Idle);
    assert_eq!(
        drain(&mut rx),
        vec![Notification::RunFinished(RunOutcome::Canceled)]
    );
    assert_eq!(
        coordinator.metrics().internal_cancels.load(Ordering::Relaxed),
        0
    );
}

/// Forwards to a channel, but holds the first finalize status report until the
/// job is canceled.
struct FinalizeParkingSink {
    inner: ChannelSink,
    job: Arc<SimulatedJob>,
    parked: AtomicBool,
}

impl NotificationSink for FinalizeParkingSink {
    fn slicing_completed(&self) {
        self.inner.slicing_completed();
    }
    fn run_finished(&self, outcome: &RunOutcome) {
        self.inner.run_finished(outcome);
    }
    fn status(&self, percent: u8, message: &str) {
        if !self.parked.swap(true, Ordering::SeqCst) {
            assert!(wait_until(|| self.job.canceled()));
        }
        self.inner.status(percent, message);
    }
    fn export_ready(&self, path: &Utf8Path) {
        self.inner.export_ready(path);
    }
    fn upload_ready(&self, job: &UploadJob, path: &Utf8Path) {
        self.inner.upload_ready(job, path);
    }
}

#[tokio::test]
async fn test_schedule_export_during_finalize_cancels_silently() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    let fff = Arc::new(SimulatedJob::fff(SimulationPlan::instant()));
    let channel = ChannelSink::new(64);
    let mut rx = channel.subscribe();
    let sink = Arc::new(FinalizeParkingSink {
        inner: channel,
        job: Arc::clone(&fff),
        parked: AtomicBool::new(false),
    });
    let coordinator = WorkerCoordinator::builder(
        fff.clone(),
        Arc::new(SimulatedJob::sla(SimulationPlan::instant())),
    )
    .sink(sink.clone())
    .temp_dir(&root)
    .build();
    coordinator.apply(&cube(), &fff_config()).unwrap();

    assert!(coordinator.start().unwrap());
    // Worker is inside the finalize step, reporting "Slicing complete"
    assert!(wait_until(|| sink.parked.load(Ordering::SeqCst)));
    assert!(!coordinator.is_step_done(CoordinatorStep::GcodeFinalize));

    let target = root.join("late.gcode");
    coordinator.schedule_export(&target).unwrap();

    assert_eq!(coordinator.state(), WorkerState::Idle);
    assert_eq!(coordinator.export_target(), Some(target.clone()));
    assert!(!coordinator.is_step_done(CoordinatorStep::GcodeFinalize));
    let metrics = coordinator.metrics();
    assert_eq!(metrics.internal_cancels.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.runs_canceled.load(Ordering::Relaxed), 1);
    let events = drain(&mut rx);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, Notification::RunFinished(_))),
        "internal cancel was reported: {:?}",
        events
    );

    // The rerun exports to the new target
    assert!(coordinator.start().unwrap());
    let (outcome, events) = next_outcome(&mut rx).await;
    assert!(outcome.success());
    assert!(events.contains(&Notification::ExportReady {
        path: target.clone()
    }));
    assert!(target.exists());
}

#[test]
fn test_concurrent_schedule_export_keeps_first_target() {
    let (fx, _rx) = fixture(SimulationPlan::instant());
    let coordinator = Arc::new(fx.coordinator);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            let path = fx.root.join(format!("out_{}.gcode", i));
            thread::spawn(move || {
                barrier.wait();
                coordinator.schedule_export(&path).map(|()| path)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].clone();
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, CoordinatorError::ExportAlreadyScheduled(p) if *p == winner));
        }
    }
    assert_eq!(coordinator.export_target(), Some(winner));
}

struct PanickingSink;

impl NotificationSink for PanickingSink {
    fn slicing_completed(&self) {}
    fn run_finished(&self, _outcome: &RunOutcome) {
        panic!("sink exploded");
    }
    fn status(&self, _percent: u8, _message: &str) {}
    fn export_ready(&self, _path: &Utf8Path) {}
    fn upload_ready(&self, _job: &UploadJob, _path: &Utf8Path) {}
}

#[test]
fn test_fault_outside_job_marks_worker_exited() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    let fff = Arc::new(SimulatedJob::fff(SimulationPlan::instant()));
    let sla = Arc::new(SimulatedJob::sla(SimulationPlan::instant()));
    let faults = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&faults);

    let coordinator = WorkerCoordinator::builder(fff, sla)
        .sink(Arc::new(PanickingSink))
        .temp_dir(&root)
        .fault_handler(Arc::new(move |message: &str| {
            recorded.lock().push(message.to_string());
        }))
        .build();
    coordinator.apply(&cube(), &fff_config()).unwrap();
    coordinator.start().unwrap();

    assert!(wait_until(|| coordinator.state() == WorkerState::Exited));
    assert_eq!(*faults.lock(), vec!["sink exploded".to_string()]);
    assert!(coordinator.stop());
    assert!(matches!(
        coordinator.start(),
        Err(CoordinatorError::NotIdle(WorkerState::Exited))
    ));
}

#[test]
fn test_panicking_fault_handler_still_marks_worker_exited() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    let fff = Arc::new(SimulatedJob::fff(SimulationPlan::instant()));
    let sla = Arc::new(SimulatedJob::sla(SimulationPlan::instant()));

    let coordinator = WorkerCoordinator::builder(fff, sla)
        .sink(Arc::new(PanickingSink))
        .temp_dir(&root)
        .fault_handler(Arc::new(|_message: &str| {
            panic!("handler exploded");
        }))
        .build();
    coordinator.apply(&cube(), &fff_config()).unwrap();
    coordinator.start().unwrap();

    assert!(wait_until(|| coordinator.state() == WorkerState::Exited));
    assert!(coordinator.stop());
    // Drop joins the thread without hanging
    drop(coordinator);
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Stop,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Start), Just(Op::Stop)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn stop_after_start_always_ends_idle(ops in prop::collection::vec(op_strategy(), 1..10)) {
        let plan = SimulationPlan {
            stages: 2,
            stage_delay: Duration::from_millis(1),
            ..SimulationPlan::default()
        };
        let (fx, _rx) = fixture(plan);
        fx.coordinator.apply(&cube(), &fff_config()).unwrap();

        let mut started = false;
        for op in ops {
            match op {
                Op::Start => {
                    // A finished run must be acknowledged by stop() first
                    match fx.coordinator.start() {
                        Ok(_) | Err(CoordinatorError::NotIdle(WorkerState::Finished)) => {}
                        Err(e) => prop_assert!(false, "unexpected error: {}", e),
                    }
                    started = true;
                }
                Op::Stop => {
                    prop_assert_eq!(fx.coordinator.stop(), started);
                    if started {
                        prop_assert_eq!(fx.coordinator.state(), WorkerState::Idle);
                    }
                }
            }
        }
    }
}
