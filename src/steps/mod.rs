// Step tracking
//
// Completion state for a small closed set of pipeline steps. Transitions are
// made while the owning job's state lock is held; the tracker's own mutex only
// protects the table and is never held across a callback.

use crate::job::{JobError, JobResult, ProtocolViolation, StateGuard, StateLock};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::hash::Hash;

/// A closed enum of pipeline steps.
pub trait PipelineStep: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Every step, in pipeline order.
    const ALL: &'static [Self];

    fn name(self) -> &'static str;
}

/// Steps owned by the coordinator itself (the engine tracks its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorStep {
    /// Copying/archiving the sliced result to the export target.
    GcodeFinalize,
}

impl PipelineStep for CoordinatorStep {
    const ALL: &'static [Self] = &[CoordinatorStep::GcodeFinalize];

    fn name(self) -> &'static str {
        match self {
            CoordinatorStep::GcodeFinalize => "gcode_finalize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Started,
    Done,
}

/// Tracks [`StepStatus`] per step.
#[derive(Debug)]
pub struct StepTracker<S: PipelineStep> {
    steps: Mutex<IndexMap<S, StepStatus>>,
}

impl<S: PipelineStep> StepTracker<S> {
    pub fn new() -> Self {
        let steps = S::ALL.iter().map(|&s| (s, StepStatus::Pending)).collect();
        Self {
            steps: Mutex::new(steps),
        }
    }

    /// Mark `step` started.
    ///
    /// Acquires `lock`, then runs `cancel_check` before touching the table so a
    /// canceled job never enters a step. Returns `Ok(false)` if the step is done.
    pub fn set_started<F>(&self, step: S, lock: &StateLock, cancel_check: F) -> JobResult<bool>
    where
        F: FnOnce() -> JobResult<()>,
    {
        let _guard = lock.lock();
        cancel_check()?;
        let mut steps = self.steps.lock();
        let status = steps.entry(step).or_insert(StepStatus::Pending);
        if *status == StepStatus::Done {
            return Ok(false);
        }
        *status = StepStatus::Started;
        tracing::debug!("Step {} started", step.name());
        Ok(true)
    }

    /// Mark a started step done.
    pub fn set_done<F>(&self, step: S, lock: &StateLock, cancel_check: F) -> JobResult<()>
    where
        F: FnOnce() -> JobResult<()>,
    {
        let _guard = lock.lock();
        cancel_check()?;
        let mut steps = self.steps.lock();
        match steps.get(&step).copied().unwrap_or(StepStatus::Pending) {
            StepStatus::Started => {
                steps.insert(step, StepStatus::Done);
                tracing::debug!("Step {} done", step.name());
                Ok(())
            }
            StepStatus::Done => Err(JobError::from(ProtocolViolation::StepAlreadyDone(step.name()))),
            StepStatus::Pending => Err(JobError::from(ProtocolViolation::StepNotStarted(step.name()))),
        }
    }

    pub fn is_done(&self, step: S, lock: &StateLock) -> bool {
        let _guard = lock.lock();
        self.status(step) == StepStatus::Done
    }

    /// Current status without taking the job lock; for diagnostics.
    pub fn status(&self, step: S) -> StepStatus {
        self.steps
            .lock()
            .get(&step)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    /// Reset `step` to pending. The caller holds the job lock (`guard`).
    ///
    /// A started step first runs `on_invalidate`, which must cancel the job and
    /// wait until the worker has let go of the step. Returns whether the step
    /// changed.
    pub fn invalidate<F>(&self, step: S, guard: &mut StateGuard<'_>, on_invalidate: F) -> bool
    where
        F: FnOnce(&mut StateGuard<'_>),
    {
        let status = self.status(step);
        match status {
            StepStatus::Pending => false,
            StepStatus::Started => {
                on_invalidate(guard);
                self.steps.lock().insert(step, StepStatus::Pending);
                tracing::debug!("Step {} invalidated while running", step.name());
                true
            }
            StepStatus::Done => {
                self.steps.lock().insert(step, StepStatus::Pending);
                tracing::debug!("Step {} invalidated", step.name());
                true
            }
        }
    }

    /// Invalidate every step; returns whether any changed.
    pub fn invalidate_all<F>(&self, guard: &mut StateGuard<'_>, mut on_invalidate: F) -> bool
    where
        F: FnMut(&mut StateGuard<'_>),
    {
        let mut invalidated = false;
        for &step in S::ALL {
            invalidated |= self.invalidate(step, guard, &mut on_invalidate);
        }
        invalidated
    }
}

impl<S: PipelineStep> Default for StepTracker<S> {
    fn default() -> Self {
        Self::new()
    }
}
