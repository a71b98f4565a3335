//! slicer-worker - runs one simulated background slice.
//!
//! # Usage
//!
//! ```text
//! slicer-worker [--sla] [OUTPUT_PATH]
//! ```
//!
//! Loads `config/Coordinator.yaml` (environment overrides `SLICER_WORKER_*`),
//! sets up logging, applies a small demo model to a [`SimulatedJob`], starts
//! the coordinator and prints notifications until the run finishes. With an
//! output path, the result is exported there; placeholders such as
//! `[print_time]` in the file name are replaced with print statistics.
//!
//! Exit status is non-zero when the run fails.

use anyhow::{Context, Result, bail};
use slicer_worker::services::{SimulatedJob, SimulationPlan};
use slicer_worker::{
    APP_NAME, ChannelSink, ConfigManager, Model, ModelObject, Notification, PrintConfig,
    RunOutcome, Technology, VERSION, WorkerCoordinator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound for one simulated run.
const RUN_TIMEOUT: Duration = Duration::from_secs(120);

struct Args {
    technology: Technology,
    output: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        technology: Technology::Fff,
        output: None,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--sla" => args.technology = Technology::Sla,
            "--fff" => args.technology = Technology::Fff,
            flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
            path => {
                if args.output.replace(path.to_string()).is_some() {
                    bail!("Only one output path may be given");
                }
            }
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    let args = parse_args()?;

    let config_manager = ConfigManager::new("config")?;
    let config = config_manager.load_config()?;
    let settings = config.coordinator;

    let _log_guard = slicer_worker::logging::setup_from_settings(&settings)?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    // Current-thread runtime: only the notification receiver is async
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let sink = Arc::new(ChannelSink::new(settings.notification_capacity));
    let mut events = sink.subscribe();

    let fff = Arc::new(SimulatedJob::fff(SimulationPlan::default()));
    let sla = Arc::new(SimulatedJob::sla(SimulationPlan::default()));
    let coordinator = WorkerCoordinator::builder(fff, sla)
        .sink(sink)
        .settings(&settings)
        .build();

    coordinator.select_technology(args.technology);
    let model = Model::new(vec![
        ModelObject::new("calibration_cube", 2),
        ModelObject::new("benchy", 1),
    ]);
    let print_config = PrintConfig::new(args.technology).with_option("layer_height", "0.2");
    coordinator.apply(&model, &print_config)?;

    if let Some(message) = coordinator.validate() {
        bail!("Configuration rejected: {}", message);
    }
    if let Some(output) = args.output {
        coordinator.schedule_export(output)?;
    }

    if !coordinator.start()? {
        bail!("Nothing to slice");
    }

    let outcome = runtime
        .block_on(async {
            tokio::time::timeout(RUN_TIMEOUT, wait_for_outcome(&mut events)).await
        })
        .context("Timed out waiting for the background run")??;

    coordinator.stop();
    coordinator.metrics().log_summary();
    drop(coordinator);

    match outcome {
        RunOutcome::Success => {
            tracing::info!("Done");
            Ok(())
        }
        RunOutcome::Canceled => bail!("Run was canceled"),
        RunOutcome::Failed(message) => bail!("Run failed: {}", message),
    }
}

async fn wait_for_outcome(events: &mut broadcast::Receiver<Notification>) -> Result<RunOutcome> {
    loop {
        match events.recv().await {
            Ok(Notification::RunFinished(outcome)) => return Ok(outcome),
            Ok(Notification::Status { percent, message }) => {
                println!("[{:>3}%] {}", percent, message);
            }
            Ok(Notification::SlicingCompleted) => println!("Slicing complete, exporting"),
            Ok(Notification::ExportReady { path }) => println!("Exported: {}", path),
            Ok(Notification::UploadReady { job, path }) => {
                println!("Ready for upload to {}: {}", job.host, path);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Notification receiver lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                bail!("Notification channel closed before the run finished");
            }
        }
    }
}
