pub mod artifact;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod observer;
pub mod processor;
pub mod session;
pub mod throttle;
pub mod transport;

pub use artifact::{
    Artifact, ArtifactKind, ArtifactParser, ImplementationPlan, PlanParser, PlanPhase, Report,
    ReportParser, ReportSection,
};
pub use bridge::{ExternalEvent, StreamPublisher, StreamSink};
pub use config::{ControllerConfig, Feature, GeneratorConfig, GenstreamConfig};
pub use controller::{CachedGeneration, StreamIngestionController};
pub use error::{GenerationError, ParseError, TransportError};
pub use observer::SessionEvent;
pub use processor::{
    ContentUpdate, IncrementalContentProcessor, ProcessedSection, ProcessingPhase,
    ProcessorConfig, ProcessorPool, SectionKind,
};
pub use session::{SessionId, SessionSnapshot, SessionSource, SessionStatus};
pub use throttle::Throttle;
pub use transport::{CancelToken, ChunkSink, CommandTransport, GenerationRequest, LlmTransport};
