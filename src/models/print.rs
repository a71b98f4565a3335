use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Printer technology, selecting which of the two job kinds is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    /// Fused filament fabrication: slice, write G-code, copy to export path.
    Fff,
    /// Resin printing: slice, write a zipped raster archive to export path.
    Sla,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Technology::Fff => write!(f, "FFF"),
            Technology::Sla => write!(f, "SLA"),
        }
    }
}

/// A single printable object and the number of its placed instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelObject {
    pub name: String,
    pub instances: usize,
}

impl ModelObject {
    pub fn new(name: impl Into<String>, instances: usize) -> Self {
        Self {
            name: name.into(),
            instances,
        }
    }
}

/// The scene handed to a job through `apply()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub objects: Vec<ModelObject>,
}

impl Model {
    pub fn new(objects: Vec<ModelObject>) -> Self {
        Self { objects }
    }

    /// A model is printable only if at least one object has an instance.
    pub fn is_printable(&self) -> bool {
        self.objects.iter().any(|o| o.instances > 0)
    }
}

/// Flat print configuration. Only the technology is interpreted here;
/// the remaining options are opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintConfig {
    pub technology: Technology,
    #[serde(default)]
    pub options: IndexMap<String, String>,
}

impl PrintConfig {
    pub fn new(technology: Technology) -> Self {
        Self {
            technology,
            options: IndexMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Result of applying a new model/config over a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Nothing changed.
    Unchanged,
    /// Something changed, but no finished or running step was affected.
    Changed,
    /// Finished or running steps were invalidated; processing must restart.
    Invalidated,
}

/// Statistics of a finished slice, substituted into export file names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrintStatistics {
    pub estimated_normal_print_time: String,
    pub estimated_silent_print_time: String,
    /// Filament length in millimeters.
    pub total_used_filament: f64,
    pub total_extruded_volume: f64,
    pub total_cost: f64,
    pub total_weight: f64,
    pub total_wipe_tower_cost: f64,
    pub total_wipe_tower_filament: f64,
}

impl PrintStatistics {
    /// Placeholder values available to output file name templates.
    pub fn placeholders(&self) -> IndexMap<&'static str, String> {
        let mut values = IndexMap::new();
        values.insert("print_time", self.estimated_normal_print_time.clone());
        values.insert("normal_print_time", self.estimated_normal_print_time.clone());
        values.insert("silent_print_time", self.estimated_silent_print_time.clone());
        values.insert("used_filament", format!("{:.2}", self.total_used_filament / 1000.0));
        values.insert("extruded_volume", format!("{:.2}", self.total_extruded_volume));
        values.insert("total_cost", format!("{:.2}", self.total_cost));
        values.insert("total_weight", format!("{:.2}", self.total_weight));
        values.insert(
            "total_wipe_tower_cost",
            format!("{:.2}", self.total_wipe_tower_cost),
        );
        values.insert(
            "total_wipe_tower_filament",
            format!("{:.2}", self.total_wipe_tower_filament),
        );
        values
    }
}

/// Opaque descriptor of an upload, consumed by an external uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadJob {
    /// Print host the file goes to.
    pub host: String,
    /// File name on the print host.
    pub upload_path: String,
    pub start_print: bool,
}
