use genstream_cache::CacheError;
use thiserror::Error;

use crate::session::SessionId;

/// Failure reported by an LLM transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to start transport: {0}")]
    Spawn(String),

    #[error("transport I/O failed: {0}")]
    Io(String),

    #[error("transport exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("generation was cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// The finished output could not be turned into a structured artifact
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("generation produced no output")]
    EmptyOutput,

    #[error("output contains no titled section with content")]
    NoSections,

    #[error("output contains no phase with at least one task")]
    NoPhases,
}

/// Errors surfaced by the ingestion controller API
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to parse generation: {0}")]
    Parse(#[from] ParseError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
}
