//! Outbound event payloads and the cross-thread event sink.
//!
//! The training worker runs on a plain OS thread, outside the connection's
//! async event loop. It must never touch the socket directly: every publish
//! goes through an [`EventSink`], and the production sink is a
//! fire-and-forget handoff into the event loop's queue, which delivers in
//! submission order.

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::graph::ModelGraph;

/// One outbound `update` event. Serializes to the flat payload shapes the
/// client protocol defines.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Update {
    /// Free-form progress status line.
    Status { status: String },

    /// One-time architecture description, sent before the first epoch.
    Architecture {
        #[serde(rename = "modelArchitectureText")]
        model_architecture_text: String,
        #[serde(rename = "modelGraphData")]
        model_graph_data: ModelGraph,
    },

    /// Per-epoch training progress.
    Progress {
        epoch: usize,
        loss: f64,
        accuracy: f64,
        kernels: Vec<String>,
        status: String,
    },

    /// Terminal event for completed or stopped runs.
    Complete {
        status: String,
        #[serde(rename = "isTrainingComplete")]
        is_training_complete: bool,
    },

    /// Terminal event for failed runs.
    Failed { status: String, error: bool },
}

impl Update {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            status: message.into(),
        }
    }

    pub fn architecture(text: String, graph: ModelGraph) -> Self {
        Self::Architecture {
            model_architecture_text: text,
            model_graph_data: graph,
        }
    }

    pub fn progress(
        epoch: usize,
        loss: f64,
        accuracy: f64,
        kernels: Vec<String>,
        status: impl Into<String>,
    ) -> Self {
        Self::Progress {
            epoch,
            loss,
            accuracy,
            kernels,
            status: status.into(),
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::Complete {
            status: message.into(),
            is_training_complete: true,
        }
    }

    pub fn stopped(message: impl Into<String>) -> Self {
        Self::Complete {
            status: message.into(),
            is_training_complete: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            status: message.into(),
            error: true,
        }
    }

    /// Whether this event ends a run. Exactly one terminal event is
    /// published per run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Failed { .. })
    }
}

/// Destination for run events. Implementations must be callable from the
/// worker thread; delivery itself happens elsewhere.
pub trait EventSink: Send + Sync {
    fn emit(&self, update: Update);
}

/// The production sink: enqueues events into the connection's event loop.
/// Sending never blocks; once the subscriber loop is gone the run keeps
/// training (or gets cancelled by the session teardown) and events are
/// dropped with a warning.
pub struct QueueSink {
    tx: UnboundedSender<Update>,
}

impl QueueSink {
    pub fn new(tx: UnboundedSender<Update>) -> Self {
        Self { tx }
    }
}

impl EventSink for QueueSink {
    fn emit(&self, update: Update) {
        if self.tx.send(update).is_err() {
            warn!("Dropping update: event loop receiver is gone");
        }
    }
}

/// A sink that writes updates to the log. Used by the headless CLI run.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, update: Update) {
        match &update {
            Update::Status { status } => info!("{status}"),
            Update::Architecture {
                model_architecture_text,
                ..
            } => info!("Model architecture:\n{model_architecture_text}"),
            Update::Progress {
                epoch,
                loss,
                accuracy,
                kernels,
                ..
            } => info!(
                "Epoch {epoch}: loss = {loss:.4}, accuracy = {accuracy:.2}% ({} kernel images)",
                kernels.len()
            ),
            Update::Complete { status, .. } => info!("{status}"),
            Update::Failed { status, .. } => warn!("{status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_serialization_shape() {
        let update = Update::progress(3, 0.25, 91.5, vec!["data:image/png;base64,AAAA".into()], "Epoch 3/5 complete");
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["epoch"], 3);
        assert_eq!(json["accuracy"], 91.5);
        assert_eq!(json["kernels"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_terminal_serialization_shapes() {
        let complete = serde_json::to_value(Update::complete("Training complete!")).unwrap();
        assert_eq!(complete["isTrainingComplete"], true);

        let stopped = serde_json::to_value(Update::stopped("Training stopped")).unwrap();
        assert_eq!(stopped["isTrainingComplete"], false);

        let failed = serde_json::to_value(Update::failed("Error: boom")).unwrap();
        assert_eq!(failed["error"], true);
        assert_eq!(failed["status"], "Error: boom");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Update::complete("x").is_terminal());
        assert!(Update::stopped("x").is_terminal());
        assert!(Update::failed("x").is_terminal());
        assert!(!Update::status("x").is_terminal());
    }

    #[test]
    fn test_queue_sink_hands_off_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = QueueSink::new(tx);
        sink.emit(Update::status("one"));
        sink.emit(Update::status("two"));

        match rx.try_recv().unwrap() {
            Update::Status { status } => assert_eq!(status, "one"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Update::Status { status } => assert_eq!(status, "two"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
