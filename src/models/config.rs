use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Coordinator configuration from Coordinator.yaml
///
/// Every field has a default so a missing file or a partial file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Directory for the temporary G-code and upload files.
    /// Empty means the system temporary directory.
    #[serde(default)]
    pub temp_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    #[serde(default)]
    pub debug_mode: bool,

    #[serde(default)]
    pub console_output: bool,

    /// Buffer size of the broadcast notification channel.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            temp_dir: String::new(),
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            debug_mode: false,
            console_output: false,
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl CoordinatorSettings {
    /// Resolve the temporary directory, falling back to the system one.
    pub fn resolved_temp_dir(&self) -> Utf8PathBuf {
        if self.temp_dir.is_empty() {
            Utf8PathBuf::try_from(std::env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("."))
        } else {
            Utf8PathBuf::from(&self.temp_dir)
        }
    }
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_prefix() -> String {
    "slicer-worker".to_string()
}

fn default_notification_capacity() -> usize {
    100
}
