//! Session event fan-out
//!
//! Subscribers are unbounded channels held in an explicit list; a closed
//! receiver is dropped from the list on the next publish.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::artifact::Artifact;
use crate::processor::{ProcessedSection, ProcessingPhase};
use crate::session::{SessionId, SessionSource};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        id: SessionId,
        source: SessionSource,
    },
    Chunk {
        id: SessionId,
        text: String,
        progress: u8,
    },
    /// Structural update; throttled while streaming, always sent once at the end
    Sections {
        id: SessionId,
        sections: Vec<ProcessedSection>,
        progress: u8,
        phase: ProcessingPhase,
    },
    Completed {
        id: SessionId,
        artifact: Artifact,
        replayed: bool,
    },
    Failed {
        id: SessionId,
        message: String,
    },
    Cancelled {
        id: SessionId,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::Started { id, .. }
            | SessionEvent::Chunk { id, .. }
            | SessionEvent::Sections { id, .. }
            | SessionEvent::Completed { id, .. }
            | SessionEvent::Failed { id, .. }
            | SessionEvent::Cancelled { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Completed { .. } | SessionEvent::Failed { .. } | SessionEvent::Cancelled { .. }
        )
    }
}

#[derive(Debug, Default)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
