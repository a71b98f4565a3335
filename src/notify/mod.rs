// Notification sink
//
// Replaces the GUI event queue of a desktop slicer with an injected trait.
// `ChannelSink` forwards events to a tokio broadcast channel so any number of
// listeners (UI bridge, CLI progress printer, tests) can subscribe.

use crate::models::UploadJob;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::broadcast;

/// Outcome of one background run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Canceled,
    Failed(String),
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    pub fn canceled(&self) -> bool {
        matches!(self, RunOutcome::Canceled)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            RunOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }

    /// Status code: -1 canceled, 1 success, 0 failure.
    pub fn code(&self) -> i32 {
        match self {
            RunOutcome::Canceled => -1,
            RunOutcome::Success => 1,
            RunOutcome::Failed(_) => 0,
        }
    }
}

/// Receiver of coordinator events.
///
/// `run_finished` is delivered while the coordinator mutex is held, so
/// implementations must not block and must not call back into the coordinator.
pub trait NotificationSink: Send + Sync {
    /// Slicing is complete, the export phase begins.
    fn slicing_completed(&self);

    /// A run ended. Not delivered for internally triggered cancellations.
    fn run_finished(&self, outcome: &RunOutcome);

    /// Progress of the finalize step.
    fn status(&self, percent: u8, message: &str);

    /// The finalized export file exists at `path`.
    fn export_ready(&self, path: &Utf8Path);

    /// An upload's temporary file is written and can be handed to the uploader.
    fn upload_ready(&self, job: &UploadJob, path: &Utf8Path);
}

/// Event sent through [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    SlicingCompleted,
    RunFinished(RunOutcome),
    Status { percent: u8, message: String },
    ExportReady { path: Utf8PathBuf },
    UploadReady { job: UploadJob, path: Utf8PathBuf },
}

/// [`NotificationSink`] backed by a broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    fn send(&self, notification: Notification) {
        // Ignore send errors - it's OK if no one is listening
        let _ = self.tx.send(notification);
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new(100)
    }
}

impl NotificationSink for ChannelSink {
    fn slicing_completed(&self) {
        self.send(Notification::SlicingCompleted);
    }

    fn run_finished(&self, outcome: &RunOutcome) {
        self.send(Notification::RunFinished(outcome.clone()));
    }

    fn status(&self, percent: u8, message: &str) {
        self.send(Notification::Status {
            percent,
            message: message.to_string(),
        });
    }

    fn export_ready(&self, path: &Utf8Path) {
        self.send(Notification::ExportReady {
            path: path.to_path_buf(),
        });
    }

    fn upload_ready(&self, job: &UploadJob, path: &Utf8Path) {
        self.send(Notification::UploadReady {
            job: job.clone(),
            path: path.to_path_buf(),
        });
    }
}

/// Sink that only logs; used when nobody listens.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn slicing_completed(&self) {
        tracing::info!("Slicing completed, exporting");
    }

    fn run_finished(&self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Success => tracing::info!("Background run finished"),
            RunOutcome::Canceled => tracing::info!("Background run canceled"),
            RunOutcome::Failed(message) => tracing::error!("Background run failed: {}", message),
        }
    }

    fn status(&self, percent: u8, message: &str) {
        tracing::info!("[{:>3}%] {}", percent, message);
    }

    fn export_ready(&self, path: &Utf8Path) {
        tracing::info!("Export ready: {}", path);
    }

    fn upload_ready(&self, job: &UploadJob, path: &Utf8Path) {
        tracing::info!("Upload ready for {}: {}", job.host, path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(RunOutcome::Canceled.code(), -1);
        assert_eq!(RunOutcome::Success.code(), 1);
        assert_eq!(RunOutcome::Failed("boom".into()).code(), 0);
        assert_eq!(RunOutcome::Failed("boom".into()).error_message(), Some("boom"));
        assert!(!RunOutcome::Canceled.success());
    }

    #[test]
    fn test_channel_sink_delivers_to_all_subscribers() {
        let sink = ChannelSink::new(8);
        let mut rx1 = sink.subscribe();
        let mut rx2 = sink.subscribe();

        sink.run_finished(&RunOutcome::Success);

        assert_eq!(rx1.try_recv().unwrap(), Notification::RunFinished(RunOutcome::Success));
        assert_eq!(rx2.try_recv().unwrap(), Notification::RunFinished(RunOutcome::Success));
    }

    #[test]
    fn test_channel_sink_without_listener_does_not_fail() {
        let sink = ChannelSink::new(1);
        sink.status(50, "halfway");
        sink.slicing_completed();
    }

    #[test]
    fn test_channel_sink_async_receive() {
        let sink = ChannelSink::default();
        let mut rx = sink.subscribe();
        sink.export_ready(Utf8Path::new("/out/part.gcode"));

        let event = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(
            event,
            Notification::ExportReady {
                path: Utf8PathBuf::from("/out/part.gcode")
            }
        );
    }
}
