use crate::job::{JobError, JobResult};
use crate::models::PrintStatistics;
use camino::{Utf8Path, Utf8PathBuf};
use regex::{Captures, Regex};
use std::fs;
use uuid::Uuid;

/// Temporary G-code path unique to this process: `<temp_dir>/.<pid>.gcode`.
pub fn temp_output_path(temp_dir: &Utf8Path) -> Utf8PathBuf {
    temp_dir.join(format!(".{}.gcode", std::process::id()))
}

/// Fresh temporary path for an upload: `<temp_dir>/.upload.<uuid>.gcode`.
pub fn unique_upload_path(temp_dir: &Utf8Path) -> Utf8PathBuf {
    temp_dir.join(format!(".upload.{}.gcode", Uuid::new_v4()))
}

/// Copy the temporary G-code to its final location.
///
/// Missing parent directories of `to` are created.
pub fn copy_file(from: &Utf8Path, to: &Utf8Path) -> JobResult<()> {
    let copy = || -> std::io::Result<u64> {
        if let Some(parent) = to.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::copy(from, to)
    };

    match copy() {
        Ok(bytes) => {
            tracing::debug!("Copied {} bytes: {} -> {}", bytes, from, to);
            Ok(())
        }
        Err(source) => Err(JobError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        }),
    }
}

/// Substitutes print statistics into the file stem of an export path.
///
/// Placeholders are written `[name]` or `{name}`, e.g.
/// `part_[print_time].gcode` becomes `part_1h 2m.gcode`. Only the stem is
/// processed; directory and extension are kept verbatim.
///
/// The regex is compiled once at construction.
pub struct OutputNameFormatter {
    placeholder_pattern: Regex,
}

impl OutputNameFormatter {
    pub fn new() -> Self {
        Self {
            placeholder_pattern: Regex::new(r"\[(\w+)\]|\{(\w+)\}")
                .expect("Invalid placeholder regex"),
        }
    }

    /// Apply `stats` to `path`. An unknown placeholder leaves the path unchanged.
    pub fn finalize_output_path(&self, path: &Utf8Path, stats: &PrintStatistics) -> Utf8PathBuf {
        let Some(stem) = path.file_stem() else {
            return path.to_path_buf();
        };

        let values = stats.placeholders();
        let mut unknown = None;
        let new_stem = self
            .placeholder_pattern
            .replace_all(stem, |caps: &Captures<'_>| {
                let key = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match values.get(key) {
                    Some(value) => value.clone(),
                    None => {
                        if unknown.is_none() {
                            unknown = Some(key.to_string());
                        }
                        caps[0].to_string()
                    }
                }
            });

        if let Some(key) = unknown {
            tracing::error!(
                "Failed to apply the print statistics to the export file name: unknown placeholder '{}'",
                key
            );
            return path.to_path_buf();
        }

        let file_name = match path.extension() {
            Some(ext) => format!("{}.{}", new_stem, ext),
            None => new_stem.into_owned(),
        };
        path.with_file_name(file_name)
    }
}

impl Default for OutputNameFormatter {
    fn default() -> Self {
        Self::new()
    }
}
