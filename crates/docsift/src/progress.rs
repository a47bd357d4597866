use std::sync::mpsc::Sender;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::report::JobReport;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress {
        completed: usize,
        total: usize,
        label: String,
    },
    Skipped {
        key: String,
    },
    Failed {
        key: String,
        message: String,
    },
    Finished(JobReport),
}

/// Receives job progress. Called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, completed: usize, total: usize, label: &str);

    fn on_skipped(&self, _key: &str) {}

    fn on_failed(&self, _key: &str, _message: &str) {}

    fn on_finished(&self, _report: &JobReport) {}
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _completed: usize, _total: usize, _label: &str) {}
}

/// Logs every event through `tracing`.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_progress(&self, completed: usize, total: usize, label: &str) {
        info!(completed, total, label, "progress");
    }

    fn on_skipped(&self, key: &str) {
        info!(key, "unchanged, skipped");
    }

    fn on_failed(&self, key: &str, message: &str) {
        warn!(key, message, "failed");
    }

    fn on_finished(&self, report: &JobReport) {
        info!("{report}");
    }
}

/// Forwards events into a channel. A dropped receiver is ignored.
pub struct ChannelSink {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: ProgressEvent) {
        let _ = self.tx.lock().send(event);
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, completed: usize, total: usize, label: &str) {
        self.send(ProgressEvent::Progress {
            completed,
            total,
            label: label.to_string(),
        });
    }

    fn on_skipped(&self, key: &str) {
        self.send(ProgressEvent::Skipped {
            key: key.to_string(),
        });
    }

    fn on_failed(&self, key: &str, message: &str) {
        self.send(ProgressEvent::Failed {
            key: key.to_string(),
            message: message.to_string(),
        });
    }

    fn on_finished(&self, report: &JobReport) {
        self.send(ProgressEvent::Finished(report.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn channel_sink_forwards_in_order() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        sink.on_skipped("a.md");
        sink.on_progress(1, 2, "a.md");
        sink.on_failed("b.md", "boom");
        sink.on_finished(&JobReport::default());
        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            ProgressEvent::Skipped {
                key: "a.md".into()
            }
        );
        assert!(matches!(events[3], ProgressEvent::Finished(_)));
    }

    #[test]
    fn dropped_receiver_is_not_an_error() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelSink::new(tx).on_progress(1, 1, "x");
    }
}
