use crate::job::{ArchiveJob, CancelableJob, GcodeJob, JobControl, JobError, JobResult};
use crate::models::{ApplyStatus, Model, PrintConfig, PrintStatistics, Technology};
use crate::steps::{PipelineStep, StepTracker};
use camino::Utf8Path;
use parking_lot::{Condvar, Mutex};
use std::fmt::Write as _;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellation checks while a stage sleeps.
const CANCEL_POLL: Duration = Duration::from_millis(2);

/// Steps of the simulated engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStep {
    Slice,
}

impl PipelineStep for EngineStep {
    const ALL: &'static [Self] = &[EngineStep::Slice];

    fn name(self) -> &'static str {
        match self {
            EngineStep::Slice => "slice",
        }
    }
}

/// How a simulated run behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationPlan {
    /// Number of cancelable stages in `process()`.
    pub stages: usize,
    pub stage_delay: Duration,
    /// Return a failure when reaching this stage.
    pub fail_at: Option<usize>,
    /// Panic when reaching this stage.
    pub panic_at: Option<usize>,
    /// Stop at the [`Gate`] when reaching this stage.
    pub gate_at: Option<usize>,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            stages: 4,
            stage_delay: Duration::from_millis(5),
            fail_at: None,
            panic_at: None,
            gate_at: None,
        }
    }
}

impl SimulationPlan {
    /// Plan without delays.
    pub fn instant() -> Self {
        Self {
            stage_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn gated_at(mut self, stage: usize) -> Self {
        self.gate_at = Some(stage);
        self
    }

    pub fn failing_at(mut self, stage: usize) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub fn panicking_at(mut self, stage: usize) -> Self {
        self.panic_at = Some(stage);
        self
    }
}

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    reached: bool,
}

/// Rendezvous point inside `process()`.
///
/// While held, a run reaching the gate parks there until released or
/// canceled. Lets a caller act at a known point of a run.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    condition: Condvar,
}

impl Gate {
    pub fn hold(&self) {
        let mut state = self.state.lock();
        state.held = true;
        state.reached = false;
    }

    pub fn release(&self) {
        self.state.lock().held = false;
        self.condition.notify_all();
    }

    /// Wait until a run reaches the gate. Returns false on timeout.
    pub fn wait_reached(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        self.condition
            .wait_while_for(&mut state, |s| !s.reached, timeout);
        state.reached
    }

    fn pass(&self, control: &JobControl) {
        let mut state = self.state.lock();
        state.reached = true;
        self.condition.notify_all();
        while state.held && !control.canceled() {
            self.condition.wait_for(&mut state, CANCEL_POLL);
        }
    }
}

#[derive(Debug)]
struct Input {
    model: Model,
    config: PrintConfig,
}

/// In-process stand-in for the slicing engine.
///
/// One type serves both kinds: G-code export writes a text file, archive
/// export writes a small binary file. Slicing is a sequence of sleeping stages
/// with cancellation checks in between.
pub struct SimulatedJob {
    technology: Technology,
    control: JobControl,
    steps: StepTracker<EngineStep>,
    plan: Mutex<SimulationPlan>,
    gate: Gate,
    input: Mutex<Input>,
    process_calls: AtomicUsize,
    export_calls: AtomicUsize,
}

impl SimulatedJob {
    pub fn new(technology: Technology, plan: SimulationPlan) -> Self {
        Self {
            technology,
            control: JobControl::new(),
            steps: StepTracker::new(),
            plan: Mutex::new(plan),
            gate: Gate::default(),
            input: Mutex::new(Input {
                model: Model::default(),
                config: PrintConfig::new(technology),
            }),
            process_calls: AtomicUsize::new(0),
            export_calls: AtomicUsize::new(0),
        }
    }

    pub fn fff(plan: SimulationPlan) -> Self {
        Self::new(Technology::Fff, plan)
    }

    pub fn sla(plan: SimulationPlan) -> Self {
        Self::new(Technology::Sla, plan)
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn set_plan(&self, plan: SimulationPlan) {
        *self.plan.lock() = plan;
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn export_calls(&self) -> usize {
        self.export_calls.load(Ordering::SeqCst)
    }

    pub fn is_sliced(&self) -> bool {
        self.steps.is_done(EngineStep::Slice, self.control.state_lock())
    }

    /// Sleep for `delay`, returning early once canceled.
    fn pause(&self, delay: Duration) -> JobResult<()> {
        let deadline = Instant::now() + delay;
        loop {
            self.control.check_canceled()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }

    fn run_stages(&self, plan: &SimulationPlan) -> JobResult<()> {
        for stage in 0..plan.stages {
            self.control.check_canceled()?;
            if plan.fail_at == Some(stage) {
                return Err(JobError::failure(format!(
                    "Simulated failure at stage {}",
                    stage
                )));
            }
            if plan.panic_at == Some(stage) {
                panic!("Simulated fault at stage {}", stage);
            }
            if plan.gate_at == Some(stage) {
                self.gate.pass(&self.control);
            }
            self.pause(plan.stage_delay)?;
            tracing::trace!("Simulated stage {}/{} done", stage + 1, plan.stages);
        }
        Ok(())
    }

    fn render_gcode(&self) -> String {
        let input = self.input.lock();
        let mut out = String::from("; generated by slicer-worker (simulated)\n");
        for (key, value) in &input.config.options {
            let _ = writeln!(out, "; {} = {}", key, value);
        }
        for object in &input.model.objects {
            for instance in 0..object.instances {
                let _ = writeln!(out, "; object {} instance {}", object.name, instance);
                out.push_str("G1 X10 Y10 E1.0\n");
            }
        }
        out
    }
}

impl CancelableJob for SimulatedJob {
    fn control(&self) -> &JobControl {
        &self.control
    }

    fn technology(&self) -> Technology {
        self.technology
    }

    fn process(&self) -> JobResult<()> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        let lock = self.control.state_lock();
        if !self
            .steps
            .set_started(EngineStep::Slice, lock, || self.control.check_canceled())?
        {
            tracing::debug!("Simulated job already sliced");
            return Ok(());
        }

        let plan = self.plan.lock().clone();
        self.run_stages(&plan)?;

        self.steps
            .set_done(EngineStep::Slice, lock, || self.control.check_canceled())
    }

    fn empty(&self) -> bool {
        !self.input.lock().model.is_printable()
    }

    fn validate(&self) -> Option<String> {
        let input = self.input.lock();
        let layer_height = input.config.options.get("layer_height")?;
        match layer_height.parse::<f64>() {
            Ok(value) if value > 0.0 => None,
            _ => Some(format!("Invalid layer height: {}", layer_height)),
        }
    }

    fn apply(&self, model: &Model, config: &PrintConfig) -> ApplyStatus {
        let mut ticket = self.control.state_lock().lock();
        {
            let mut input = self.input.lock();
            if input.model == *model && input.config == *config {
                return ApplyStatus::Unchanged;
            }
            input.model = model.clone();
            input.config = config.clone();
        }

        let invalidated = self.steps.invalidate(EngineStep::Slice, &mut ticket, |ticket| {
            self.control.invoke_cancel_callback(ticket)
        });
        if invalidated {
            ApplyStatus::Invalidated
        } else {
            ApplyStatus::Changed
        }
    }

    fn clear(&self) {
        let mut ticket = self.control.state_lock().lock();
        self.input.lock().model = Model::default();
        self.steps.invalidate_all(&mut ticket, |ticket| {
            self.control.invoke_cancel_callback(ticket)
        });
    }
}

impl GcodeJob for SimulatedJob {
    fn export_gcode(&self, path: &Utf8Path) -> JobResult<()> {
        self.control.check_canceled()?;
        fs::write(path, self.render_gcode())?;
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn print_statistics(&self) -> PrintStatistics {
        let input = self.input.lock();
        let instances: usize = input.model.objects.iter().map(|o| o.instances).sum();
        let minutes = instances * self.plan.lock().stages;
        PrintStatistics {
            estimated_normal_print_time: format!("{}h{}m", minutes / 60, minutes % 60),
            estimated_silent_print_time: format!("{}h{}m", minutes * 2 / 60, minutes * 2 % 60),
            total_used_filament: 1250.0 * instances as f64,
            total_extruded_volume: 3000.0 * instances as f64,
            total_cost: 0.5 * instances as f64,
            total_weight: 3.75 * instances as f64,
            ..Default::default()
        }
    }
}

impl ArchiveJob for SimulatedJob {
    fn export_archive(&self, path: &Utf8Path) -> JobResult<()> {
        self.control.check_canceled()?;
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        // Local file header signature of a zip archive
        let mut bytes = vec![0x50, 0x4b, 0x03, 0x04];
        bytes.extend_from_slice(self.render_gcode().as_bytes());
        fs::write(path, bytes)?;
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
