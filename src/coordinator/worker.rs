// Worker thread body
//
// Runs one task per Started transition. The coordinator mutex is held except
// while the job processes; `run_finished` is delivered with it held.

use super::{Shared, WorkerState};
use crate::job::{ArchiveJob, CancelStatus, CancelableJob, GcodeJob, JobError, JobResult};
use crate::models::Technology;
use crate::notify::RunOutcome;
use crate::services::export::copy_file;
use crate::steps::CoordinatorStep;
use parking_lot::MutexGuard;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Thread entry point. A fault escaping the loop goes to the fault handler and
/// the thread is marked exited so waiters do not hang.
pub(super) fn thread_proc_safe(shared: Arc<Shared>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| thread_proc(&shared)));
    if let Err(payload) = result {
        let message = panic_message(payload.as_ref());
        let handled = panic::catch_unwind(AssertUnwindSafe(|| (shared.fault_handler)(&message)));
        if handled.is_err() {
            tracing::error!("Fault handler panicked while handling: {}", message);
        }
        *shared.state.lock() = WorkerState::Exited;
        shared.condition.notify_all();
    }
}

fn thread_proc(shared: &Shared) {
    let mut state = shared.state.lock();
    *state = WorkerState::Idle;
    shared.condition.notify_all();

    loop {
        shared
            .condition
            .wait_while(&mut state, |s| !matches!(s, WorkerState::Started | WorkerState::Exit));
        if *state == WorkerState::Exit {
            break;
        }

        *state = WorkerState::Running;
        let technology = shared.technology();
        let started = Instant::now();
        let error = MutexGuard::unlocked(&mut state, || run_task(shared, technology));
        let elapsed = started.elapsed();

        let job = shared.job_for(technology);
        let canceled = job.canceled();
        *state = if canceled {
            WorkerState::Canceled
        } else {
            WorkerState::Finished
        };

        let outcome = match error {
            _ if canceled => RunOutcome::Canceled,
            Some(message) => RunOutcome::Failed(message),
            None => RunOutcome::Success,
        };
        shared.metrics.record_outcome(&outcome, elapsed);

        // Internal cancellations are restarted by whoever issued them.
        if job.cancel_status() == CancelStatus::CanceledInternal {
            shared.metrics.record_internal_cancel();
            tracing::debug!("Run canceled internally, no notification");
        } else {
            tracing::info!("Background run ended: {:?} in {:?}", outcome, elapsed);
            shared.sink.run_finished(&outcome);
        }
        job.restart();
        shared.run_ended();
    }

    *state = WorkerState::Exited;
    shared.condition.notify_all();
    tracing::debug!("Background thread exiting");
}

/// One run. Returns the failure message, `None` on success or cancellation.
fn run_task(shared: &Shared, technology: Technology) -> Option<String> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| match technology {
        Technology::Fff => process_gcode(shared),
        Technology::Sla => process_archive(shared),
    }));

    match result {
        Ok(Ok(())) => None,
        Ok(Err(JobError::Canceled)) if shared.job_for(technology).canceled() => None,
        Ok(Err(e)) => {
            tracing::warn!("Background run failed: {}", e);
            Some(e.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Background run panicked: {}", message);
            Some(message)
        }
    }
}

fn process_gcode(shared: &Shared) -> JobResult<()> {
    let job = &*shared.fff;
    job.process()?;
    shared.sink.slicing_completed();
    job.export_gcode(&shared.temp_output_path)?;

    if shared.set_step_started(job, CoordinatorStep::GcodeFinalize)? {
        let (target, upload) = shared.export_snapshot(job);
        match target {
            Some(target) => {
                let export_path = shared
                    .formatter
                    .finalize_output_path(&target, &job.print_statistics());
                copy_file(&shared.temp_output_path, &export_path)?;
                shared.metrics.record_export();
                shared
                    .sink
                    .status(100, &format!("G-code file exported to {}", export_path));
                shared.sink.export_ready(&export_path);
                if let Some(upload) = upload {
                    shared.sink.upload_ready(&upload, &export_path);
                }
            }
            None => shared.sink.status(100, "Slicing complete"),
        }
        shared.set_step_done(job, CoordinatorStep::GcodeFinalize)?;
    }
    Ok(())
}

fn process_archive(shared: &Shared) -> JobResult<()> {
    let job = &*shared.sla;
    job.process()?;
    shared.sink.slicing_completed();

    if shared.set_step_started(job, CoordinatorStep::GcodeFinalize)? {
        let (target, _) = shared.export_snapshot(job);
        if let Some(target) = target {
            job.export_archive(&target)?;
            shared.metrics.record_export();
            shared
                .sink
                .status(100, &format!("Zip file exported to {}", target));
            shared.sink.export_ready(&target);
        }
        shared.set_step_done(job, CoordinatorStep::GcodeFinalize)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown failure".to_string()
    }
}
