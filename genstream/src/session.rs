//! Per-generation session state
//!
//! A session is written by exactly one producer (a transport task, a cache
//! replay or an external source). Once it reaches a terminal status every
//! later mutation is refused.

use chrono::{DateTime, Utc};
use genstream_cache::ContentKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::processor::{IncrementalContentProcessor, ProcessedSection, ProcessingPhase};
use crate::throttle::Throttle;
use crate::transport::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No session has been started
    Idle,
    /// Request issued, no output yet
    Generating,
    /// At least one chunk received
    Streaming,
    Success,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Success | SessionStatus::Error | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Generating => "generating",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Success => "success",
            SessionStatus::Error => "error",
            SessionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Who produces the chunks of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionSource {
    /// Live generation through the controller's transport
    Transport,
    /// Cached output replayed chunk by chunk
    Replay,
    /// Mirrored output of a generation owned by another component
    External { source_id: String },
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub source: SessionSource,
    pub cache_key: String,
    pub raw: String,
    pub sections: Vec<ProcessedSection>,
    pub phase: ProcessingPhase,
    pub progress: u8,
    pub chunk_count: usize,
    pub artifact: Option<Artifact>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of an accepted chunk
#[derive(Debug)]
pub(crate) struct ChunkApplied {
    pub progress: u8,
    pub phase: ProcessingPhase,
    /// Present when the throttle let a structural update through
    pub sections: Option<Vec<ProcessedSection>>,
}

/// How a final text relates to the streamed buffer
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FinalText<'a> {
    /// Identical to the buffer (or empty)
    Same,
    /// Extends the buffer with this suffix
    Extends(&'a str),
    /// Not a continuation of the buffer
    Diverges,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub id: SessionId,
    pub source: SessionSource,
    pub key: ContentKey,
    /// Inputs fingerprinted for persisted records
    pub key_parts: Value,
    pub cancel: CancelToken,
    status: SessionStatus,
    /// Output is complete and being validated; chunks are refused
    finalizing: bool,
    raw: String,
    processor: Option<IncrementalContentProcessor>,
    final_sections: Vec<ProcessedSection>,
    phase: ProcessingPhase,
    progress: u8,
    chunk_count: usize,
    throttle: Throttle<u8>,
    artifact: Option<Artifact>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        source: SessionSource,
        key: ContentKey,
        key_parts: Value,
        processor: IncrementalContentProcessor,
        throttle_interval: Duration,
    ) -> Self {
        Self {
            id: SessionId::new(),
            source,
            key,
            key_parts,
            cancel: CancelToken::new(),
            status: SessionStatus::Generating,
            finalizing: false,
            raw: String::new(),
            processor: Some(processor),
            final_sections: Vec::new(),
            phase: ProcessingPhase::Initializing,
            progress: 0,
            chunk_count: 0,
            throttle: Throttle::new(throttle_interval),
            artifact: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn external_source(&self) -> Option<&str> {
        match &self.source {
            SessionSource::External { source_id } => Some(source_id),
            _ => None,
        }
    }

    /// Append a chunk; `None` once the session is finalizing or terminal
    pub fn push_chunk(&mut self, text: &str, now: Instant) -> Option<ChunkApplied> {
        if self.is_terminal() || self.finalizing {
            return None;
        }
        let processor = self.processor.as_mut()?;

        let update = processor.process_chunk(text);
        self.raw.push_str(text);
        self.chunk_count += 1;
        self.status = SessionStatus::Streaming;
        self.phase = update.phase;
        self.progress = update.progress;

        let sections = self
            .throttle
            .offer(update.progress, now)
            .map(|_| processor.sections());

        Some(ChunkApplied {
            progress: update.progress,
            phase: update.phase,
            sections,
        })
    }

    pub fn classify_final<'a>(&self, final_raw: &'a str) -> FinalText<'a> {
        if final_raw.is_empty() || final_raw == self.raw {
            FinalText::Same
        } else if let Some(suffix) = final_raw.strip_prefix(self.raw.as_str()) {
            FinalText::Extends(suffix)
        } else {
            FinalText::Diverges
        }
    }

    /// Stop accepting chunks; `false` if already finalizing or terminal
    pub fn begin_finalize(&mut self) -> bool {
        if self.is_terminal() || self.finalizing {
            return false;
        }
        self.finalizing = true;
        true
    }

    /// Closing structural update; discards whatever the throttle held back
    pub fn final_update(&mut self) -> (Vec<ProcessedSection>, u8, ProcessingPhase) {
        self.throttle.flush();
        (self.sections(), self.progress, self.phase)
    }

    /// Close the processor; returns the final sections
    pub fn finish_stream(&mut self) -> Vec<ProcessedSection> {
        if let Some(processor) = self.processor.as_mut() {
            let update = processor.complete();
            self.phase = update.phase;
            self.progress = update.progress;
        }
        self.sections()
    }

    pub fn succeed(&mut self, artifact: Artifact) {
        self.artifact = Some(artifact);
        self.terminate(SessionStatus::Success);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.terminate(SessionStatus::Error);
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.terminate(SessionStatus::Cancelled);
    }

    /// Hand back the processor of a terminal session for reuse
    pub fn take_processor(&mut self) -> Option<IncrementalContentProcessor> {
        if self.is_terminal() {
            self.processor.take()
        } else {
            None
        }
    }

    pub fn sections(&self) -> Vec<ProcessedSection> {
        match &self.processor {
            Some(processor) => processor.sections(),
            None => self.final_sections.clone(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            status: self.status,
            source: self.source.clone(),
            cache_key: self.key.to_string(),
            raw: self.raw.clone(),
            sections: self.sections(),
            phase: self.phase,
            progress: self.progress,
            chunk_count: self.chunk_count,
            artifact: self.artifact.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    fn terminate(&mut self, status: SessionStatus) {
        if let Some(processor) = &self.processor {
            self.final_sections = processor.sections();
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
