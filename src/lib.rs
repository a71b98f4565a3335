// slicer-worker - Background slicing coordinator
//
// Library crate: the worker coordinator, the job contract it drives, step
// tracking, notification sinks and the ambient configuration and logging.
// The binary crate (main.rs) runs a simulated slice end to end.

pub mod config;
pub mod coordinator;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod services;
pub mod steps;

// Re-export commonly used types for convenience
pub use crate::config::ConfigManager;
pub use coordinator::{
    CoordinatorBuilder, CoordinatorError, FaultHandler, WorkerCoordinator, WorkerState,
};
pub use job::{
    ArchiveJob, CancelCallback, CancelStatus, CancelableJob, GcodeJob, JobControl, JobError,
    JobResult, ProtocolViolation, StateGuard, StateLock,
};
pub use metrics::Metrics;
pub use models::{
    ApplyStatus, CoordinatorConfig, CoordinatorSettings, Model, ModelObject, PrintConfig,
    PrintStatistics, Technology, UploadJob,
};
pub use notify::{ChannelSink, LogSink, Notification, NotificationSink, RunOutcome};
pub use steps::{CoordinatorStep, PipelineStep, StepStatus, StepTracker};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
