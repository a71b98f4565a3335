//! Data models for the slicing coordinator.
//!
//! - [`CoordinatorConfig`]: settings loaded from `Coordinator.yaml` (temp dir, logging, channel size)
//! - [`Model`] / [`PrintConfig`]: the input handed to a job through `apply()`
//! - [`Technology`]: selects which of the two job kinds is active
//! - [`PrintStatistics`]: values substituted into the export file name
//! - [`UploadJob`]: opaque descriptor forwarded to an external uploader

pub mod config;
pub mod print;

pub use self::config::{CoordinatorConfig, CoordinatorSettings};
pub use print::{ApplyStatus, Model, ModelObject, PrintConfig, PrintStatistics, Technology, UploadJob};
