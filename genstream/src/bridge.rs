//! Cross-feature streaming
//!
//! A component that owns a generation publishes it through a
//! [`StreamPublisher`]; the consuming controller drains the paired receiver
//! (see [`StreamIngestionController::attach`](crate::controller::StreamIngestionController::attach))
//! and mirrors the output in its own session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Producer side of a mirrored generation
pub trait StreamSink: Send + Sync {
    fn start(&self, source_id: &str, context: Value);
    fn chunk(&self, source_id: &str, text: &str);
    fn complete(&self, source_id: &str, final_raw: &str);
    fn error(&self, source_id: &str, message: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalEvent {
    Start { source_id: String, context: Value },
    Chunk { source_id: String, text: String },
    Complete { source_id: String, final_raw: String },
    Error { source_id: String, message: String },
}

impl ExternalEvent {
    pub fn source_id(&self) -> &str {
        match self {
            ExternalEvent::Start { source_id, .. }
            | ExternalEvent::Chunk { source_id, .. }
            | ExternalEvent::Complete { source_id, .. }
            | ExternalEvent::Error { source_id, .. } => source_id,
        }
    }
}

/// [`StreamSink`] that forwards every call over a channel
#[derive(Debug, Clone)]
pub struct StreamPublisher {
    tx: mpsc::UnboundedSender<ExternalEvent>,
}

impl StreamPublisher {
    fn send(&self, event: ExternalEvent) {
        if self.tx.send(event).is_err() {
            debug!("Stream consumer is gone, dropping event");
        }
    }
}

impl StreamSink for StreamPublisher {
    fn start(&self, source_id: &str, context: Value) {
        self.send(ExternalEvent::Start {
            source_id: source_id.to_string(),
            context,
        });
    }

    fn chunk(&self, source_id: &str, text: &str) {
        self.send(ExternalEvent::Chunk {
            source_id: source_id.to_string(),
            text: text.to_string(),
        });
    }

    fn complete(&self, source_id: &str, final_raw: &str) {
        self.send(ExternalEvent::Complete {
            source_id: source_id.to_string(),
            final_raw: final_raw.to_string(),
        });
    }

    fn error(&self, source_id: &str, message: &str) {
        self.send(ExternalEvent::Error {
            source_id: source_id.to_string(),
            message: message.to_string(),
        });
    }
}

/// Create a connected publisher/receiver pair
pub fn channel() -> (StreamPublisher, mpsc::UnboundedReceiver<ExternalEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamPublisher { tx }, rx)
}
