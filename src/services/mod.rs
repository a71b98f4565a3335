//! Services module - export helpers and the simulated engine.
//!
//! # Components
//!
//! - [`export`]: temporary output paths, copying the temporary G-code to its
//!   destination, and [`OutputNameFormatter`] for statistics placeholders in
//!   export file names.
//! - [`simulated`]: [`SimulatedJob`], an in-process engine implementing both job
//!   kinds with configurable delays, failures, panics and a [`Gate`] to park a run
//!   at a known stage.
//!
//! The real slicing engine lives outside this crate; anything implementing
//! [`crate::job::GcodeJob`] or [`crate::job::ArchiveJob`] can replace the
//! simulated one.

pub mod export;
pub mod simulated;

pub use export::{OutputNameFormatter, copy_file, temp_output_path, unique_upload_path};
pub use simulated::{EngineStep, Gate, SimulatedJob, SimulationPlan};
