//! Streaming ingestion controller
//!
//! One controller owns one session slot for one feature namespace. Starting
//! a session supersedes (cancels) the previous one. Results are looked up in
//! the shared [`CacheStore`], then in the persisted adapter, before the
//! transport is contacted; cache hits are replayed chunk by chunk so
//! consumers see the same event sequence as a live generation.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`. Finishing a session happens in three steps: validate and parse
//! under the lock, write the cache without it, then apply the terminal status
//! under the lock again. A cancel that lands in between wins, and the
//! write-back it raced with is rolled back.

use genstream_cache::{
    CacheStats, CacheStore, ContentHasher, ContentKey, PersistedKeyValueAdapter, PersistedRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactParser};
use crate::bridge::ExternalEvent;
use crate::config::ControllerConfig;
use crate::error::{GenerationError, ParseError};
use crate::observer::{SessionEvent, Subscribers};
use crate::processor::ProcessorPool;
use crate::session::{FinalText, Session, SessionId, SessionSnapshot, SessionSource, SessionStatus};
use crate::transport::{CancelToken, ChunkSink, GenerationRequest, LlmTransport};

/// Idle processors kept per controller
const POOL_SIZE: usize = 2;

/// What the cache holds for a finished generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedGeneration {
    pub raw: String,
    pub artifact: Artifact,
}

#[derive(Debug, Default)]
struct ControllerState {
    current: Option<Session>,
    /// Snapshots of superseded sessions, oldest first
    history: VecDeque<SessionSnapshot>,
}

/// Validated outcome of a finished stream, applied after cache write-back
struct Finalization {
    outcome: Result<Artifact, String>,
    replayed: bool,
    key: ContentKey,
    key_parts: Value,
    raw: String,
    cancel: CancelToken,
}

pub struct StreamIngestionController {
    config: ControllerConfig,
    cache: Arc<CacheStore<CachedGeneration>>,
    persisted: Option<PersistedKeyValueAdapter>,
    transport: Option<Arc<dyn LlmTransport>>,
    parser: Arc<dyn ArtifactParser>,
    hasher: ContentHasher,
    pool: ProcessorPool,
    subscribers: Subscribers,
    state: Mutex<ControllerState>,
    /// Bumped on every terminal transition
    finished: watch::Sender<u64>,
}

impl StreamIngestionController {
    pub fn new(config: ControllerConfig, cache: Arc<CacheStore<CachedGeneration>>) -> Self {
        let parser = config.artifact.parser();
        let pool = ProcessorPool::new(config.processor, POOL_SIZE);
        let (finished, _) = watch::channel(0);

        Self {
            config,
            cache,
            persisted: None,
            transport: None,
            parser,
            hasher: ContentHasher::new(),
            pool,
            subscribers: Subscribers::new(),
            state: Mutex::new(ControllerState::default()),
            finished,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn LlmTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_persisted(mut self, persisted: PersistedKeyValueAdapter) -> Self {
        self.persisted = Some(persisted);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ArtifactParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Start a generation for `(config, context)`
    ///
    /// Any in-flight session of this controller is cancelled first.
    pub async fn start<C, X>(self: &Arc<Self>, config: &C, context: &X) -> SessionId
    where
        C: Serialize + ?Sized,
        X: Serialize + ?Sized,
    {
        let namespace = self.config.namespace.clone();
        let request = match (serde_json::to_value(config), serde_json::to_value(context)) {
            (Ok(config), Ok(context)) => Some(GenerationRequest {
                namespace: namespace.clone(),
                config,
                context,
            }),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Request for {} is not serializable: {}", namespace, e);
                None
            }
        };

        let (key, key_parts) = match &request {
            Some(request) => (
                self.hasher.hash(&namespace, &request.config, &request.context),
                Value::Array(vec![request.config.clone(), request.context.clone()]),
            ),
            None => (ContentKey::uncacheable(namespace.as_str()), Value::Null),
        };

        let cached = self.lookup(&key, &key_parts).await;
        let source = if cached.is_some() {
            SessionSource::Replay
        } else {
            SessionSource::Transport
        };
        let (id, cancel) = self.install(source, key, key_parts);

        match (cached, request, self.transport.clone()) {
            (Some(hit), _, _) => self.spawn_replay(id, hit, cancel),
            (None, Some(request), Some(transport)) => self.spawn_transport(id, request, transport, cancel),
            (None, None, _) => {
                self.fail_session(id, "request is not serializable").await;
            }
            (None, Some(_), None) => {
                self.fail_session(id, "no transport configured").await;
            }
        }

        id
    }

    /// Cancel a live session; `false` if it is not current or already finished
    pub fn cancel(&self, id: SessionId) -> bool {
        let mut state = self.lock_state();
        match state.current.as_mut().filter(|s| s.id == id && !s.is_terminal()) {
            Some(session) => {
                self.cancel_locked(session);
                true
            }
            None => {
                debug!("Nothing to cancel for session {}", id);
                false
            }
        }
    }

    /// Begin mirroring a generation owned by `source_id`
    pub fn ingest_external_start<X>(&self, source_id: &str, context: &X) -> SessionId
    where
        X: Serialize + ?Sized,
    {
        let namespace = self.config.namespace.as_str();
        let marker = json!({ "ingest": "external" });

        let (key, key_parts) = match serde_json::to_value(context) {
            Ok(context) => (
                self.hasher.hash(namespace, &marker, &context),
                Value::Array(vec![marker, context]),
            ),
            Err(e) => {
                warn!("External context for {} is not serializable: {}", namespace, e);
                (ContentKey::uncacheable(namespace), Value::Null)
            }
        };

        let source = SessionSource::External {
            source_id: source_id.to_string(),
        };
        let (id, _) = self.install(source, key, key_parts);
        id
    }

    pub fn ingest_external_chunk(&self, source_id: &str, text: &str) -> bool {
        let mut state = self.lock_state();
        match external_session(&mut state, source_id) {
            Some(session) => self.push_locked(session, text),
            None => {
                debug!("Ignoring chunk from inactive source {}", source_id);
                false
            }
        }
    }

    pub async fn ingest_external_complete(&self, source_id: &str, final_raw: &str) -> bool {
        let Some(id) = self.external_session_id(source_id) else {
            debug!("Ignoring completion from inactive source {}", source_id);
            return false;
        };
        self.complete_session(id, Some(final_raw), None).await
    }

    pub async fn ingest_external_error(&self, source_id: &str, message: &str) -> bool {
        let Some(id) = self.external_session_id(source_id) else {
            debug!("Ignoring error from inactive source {}", source_id);
            return false;
        };
        self.fail_session(id, message).await
    }

    /// Apply one bridged event
    pub async fn apply_external(&self, event: ExternalEvent) -> bool {
        match event {
            ExternalEvent::Start { source_id, context } => {
                self.ingest_external_start(&source_id, &context);
                true
            }
            ExternalEvent::Chunk { source_id, text } => self.ingest_external_chunk(&source_id, &text),
            ExternalEvent::Complete {
                source_id,
                final_raw,
            } => self.ingest_external_complete(&source_id, &final_raw).await,
            ExternalEvent::Error { source_id, message } => {
                self.ingest_external_error(&source_id, &message).await
            }
        }
    }

    /// Drain a bridge receiver in arrival order until every publisher is gone
    pub fn attach(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<ExternalEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.apply_external(event).await;
            }
            debug!("Bridge for {} closed", this.config.namespace);
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.subscribers.subscribe()
    }

    /// Status of the current session, `Idle` before the first start
    pub fn status(&self) -> SessionStatus {
        self.lock_state()
            .current
            .as_ref()
            .map(|s| s.status())
            .unwrap_or(SessionStatus::Idle)
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.lock_state().current.as_ref().map(|s| s.id)
    }

    pub fn snapshot(&self, id: SessionId) -> Option<SessionSnapshot> {
        let state = self.lock_state();
        if let Some(session) = state.current.as_ref().filter(|s| s.id == id) {
            return Some(session.snapshot());
        }
        state.history.iter().rev().find(|s| s.id == id).cloned()
    }

    /// Wait until the session reaches a terminal status
    pub async fn wait(&self, id: SessionId) -> Result<SessionSnapshot, GenerationError> {
        let mut finished = self.finished.subscribe();
        loop {
            match self.snapshot(id) {
                None => return Err(GenerationError::UnknownSession(id)),
                Some(snapshot) if snapshot.status.is_terminal() => return Ok(snapshot),
                Some(_) => {}
            }
            if finished.changed().await.is_err() {
                return Err(GenerationError::UnknownSession(id));
            }
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    async fn lookup(&self, key: &ContentKey, key_parts: &Value) -> Option<CachedGeneration> {
        if !key.is_cacheable() {
            return None;
        }

        if let Some(hit) = self.cache.lookup(key).await {
            debug!("Memory cache hit for {}", key);
            return Some(hit);
        }

        let namespace = self.config.namespace.clone();
        let owner = self.config.owner_id.clone();
        let parts = key_parts.clone();
        let (record, remaining) = self
            .on_persisted(move |persisted| {
                let record: PersistedRecord<CachedGeneration> = persisted.load_record(&namespace, &owner, &parts)?;
                let remaining = persisted.remaining_ttl(&record);
                Some((record, remaining))
            })
            .await
            .flatten()?;

        // The memory copy must not outlive the persisted record
        match remaining.filter(|ttl| !ttl.is_zero()) {
            Some(ttl) => {
                info!("Promoting persisted generation {} ({:?} left)", key, ttl);
                if let Err(e) = self.cache.set_with_ttl(key.as_cache_key(), record.value.clone(), ttl).await {
                    warn!("Failed to promote {}: {}", key, e);
                }
            }
            None => debug!("Persisted generation {} expires now; not promoting", key),
        }
        Some(record.value)
    }

    fn install(&self, source: SessionSource, key: ContentKey, key_parts: Value) -> (SessionId, CancelToken) {
        let session = Session::new(
            source.clone(),
            key,
            key_parts,
            self.pool.acquire(),
            self.config.throttle_interval,
        );
        let id = session.id;
        let cancel = session.cancel.clone();

        let mut state = self.lock_state();
        if let Some(mut previous) = state.current.take() {
            if !previous.is_terminal() {
                info!("Session {} superseded by {}", previous.id, id);
                self.cancel_locked(&mut previous);
            }
            state.history.push_back(previous.snapshot());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
        }

        info!("Started session {} for {} ({:?})", id, self.config.namespace, source);
        state.current = Some(session);
        self.subscribers.publish(SessionEvent::Started { id, source });

        (id, cancel)
    }

    fn spawn_replay(self: &Arc<Self>, id: SessionId, hit: CachedGeneration, cancel: CancelToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let chars: Vec<char> = hit.raw.chars().collect();
            let delay = this.config.replay_delay;

            for (i, piece) in chars.chunks(this.config.replay_chunk_size.max(1)).enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                let piece: String = piece.iter().collect();
                if !this.apply_chunk(id, &piece) {
                    return;
                }
            }

            this.complete_session(id, None, Some(hit.artifact)).await;
        });
    }

    fn spawn_transport(
        self: &Arc<Self>,
        id: SessionId,
        request: GenerationRequest,
        transport: Arc<dyn LlmTransport>,
        cancel: CancelToken,
    ) {
        let this = Arc::clone(self);
        let sink: Arc<dyn ChunkSink> = Arc::new(SessionSink {
            controller: Arc::clone(self),
            id,
        });

        tokio::spawn(async move {
            match transport.stream(request, sink, cancel).await {
                Ok(final_raw) => {
                    this.complete_session(id, Some(&final_raw), None).await;
                }
                Err(e) => {
                    this.fail_session(id, &e.to_string()).await;
                }
            }
        });
    }

    /// Append a chunk to session `id` if it is current and live
    fn apply_chunk(&self, id: SessionId, text: &str) -> bool {
        let mut state = self.lock_state();
        match state.current.as_mut().filter(|s| s.id == id) {
            Some(session) => self.push_locked(session, text),
            None => {
                debug!("Dropping chunk for superseded session {}", id);
                false
            }
        }
    }

    fn push_locked(&self, session: &mut Session, text: &str) -> bool {
        let Some(applied) = session.push_chunk(text, Instant::now()) else {
            debug!("Dropping chunk for finished session {}", session.id);
            return false;
        };

        self.subscribers.publish(SessionEvent::Chunk {
            id: session.id,
            text: text.to_string(),
            progress: applied.progress,
        });
        if let Some(sections) = applied.sections {
            self.subscribers.publish(SessionEvent::Sections {
                id: session.id,
                sections,
                progress: applied.progress,
                phase: applied.phase,
            });
        }
        true
    }

    /// Finish session `id` successfully, or with the parse failure
    ///
    /// `cached` carries the artifact of a replayed cache hit, which is
    /// neither re-parsed nor written back.
    async fn complete_session(&self, id: SessionId, final_raw: Option<&str>, cached: Option<Artifact>) -> bool {
        let finalization = {
            let mut state = self.lock_state();
            let Some(session) = state.current.as_mut().filter(|s| s.id == id && !s.is_terminal()) else {
                debug!("Ignoring completion of inactive session {}", id);
                return false;
            };

            if let Some(final_raw) = final_raw {
                match session.classify_final(final_raw) {
                    FinalText::Same => {}
                    FinalText::Extends(suffix) => {
                        self.push_locked(session, suffix);
                    }
                    FinalText::Diverges => {
                        warn!("Final text of session {} does not extend the streamed output; keeping the stream", id);
                    }
                }
            }

            if !session.begin_finalize() {
                return false;
            }

            let sections = session.finish_stream();
            let replayed = cached.is_some();
            let outcome = if session.raw().trim().is_empty() {
                Err(ParseError::EmptyOutput.to_string())
            } else if let Some(artifact) = cached {
                Ok(artifact)
            } else {
                self.parser
                    .parse(session.raw(), &sections)
                    .map_err(|e| GenerationError::from(e).to_string())
            };

            Finalization {
                outcome,
                replayed,
                key: session.key.clone(),
                key_parts: session.key_parts.clone(),
                raw: session.raw().to_string(),
                cancel: session.cancel.clone(),
            }
        };

        let mut written = false;
        match &finalization.outcome {
            Ok(_) if finalization.cancel.is_cancelled() => {
                debug!("Session {} was cancelled before write-back", id);
            }
            Ok(artifact) if !finalization.replayed => {
                written = self
                    .write_back(&finalization.key, &finalization.key_parts, &finalization.raw, artifact)
                    .await;
            }
            Ok(_) => {}
            Err(message) => self.record_error(&finalization.key_parts, message).await,
        }

        let applied = {
            let mut state = self.lock_state();
            match state.current.as_mut().filter(|s| s.id == id && !s.is_terminal()) {
                None => {
                    debug!("Session {} ended before it could be finalized", id);
                    false
                }
                Some(session) => {
                    match finalization.outcome {
                        Ok(artifact) => {
                            info!("Session {} succeeded", id);
                            session.succeed(artifact.clone());
                            self.after_terminal(
                                session,
                                SessionEvent::Completed {
                                    id,
                                    artifact,
                                    replayed: finalization.replayed,
                                },
                            );
                        }
                        Err(message) => {
                            warn!("Session {} failed: {}", id, message);
                            session.fail(message.clone());
                            self.after_terminal(session, SessionEvent::Failed { id, message });
                        }
                    }
                    true
                }
            }
        };

        if !applied && written {
            info!("Rolling back write-back of cancelled session {}", id);
            self.roll_back(&finalization.key, &finalization.key_parts).await;
        }
        applied
    }

    /// Move session `id` to `error`, keeping its partial output
    async fn fail_session(&self, id: SessionId, message: &str) -> bool {
        let key_parts = {
            let mut state = self.lock_state();
            let Some(session) = state.current.as_mut().filter(|s| s.id == id) else {
                debug!("Ignoring failure of inactive session {}: {}", id, message);
                return false;
            };
            if !session.begin_finalize() {
                debug!("Ignoring failure of finished session {}: {}", id, message);
                return false;
            }
            session.key_parts.clone()
        };

        self.record_error(&key_parts, message).await;

        let mut state = self.lock_state();
        let Some(session) = state.current.as_mut().filter(|s| s.id == id && !s.is_terminal()) else {
            return false;
        };

        warn!("Session {} failed: {}", id, message);
        session.fail(message);
        self.after_terminal(
            session,
            SessionEvent::Failed {
                id,
                message: message.to_string(),
            },
        );
        true
    }

    fn cancel_locked(&self, session: &mut Session) {
        info!("Cancelling session {}", session.id);
        session.cancel();
        let id = session.id;
        self.after_terminal(session, SessionEvent::Cancelled { id });
    }

    /// Publish the final sections and the terminal event, recycle the processor
    fn after_terminal(&self, session: &mut Session, event: SessionEvent) {
        let (sections, progress, phase) = session.final_update();
        self.subscribers.publish(SessionEvent::Sections {
            id: session.id,
            sections,
            progress,
            phase,
        });
        self.subscribers.publish(event);

        if let Some(processor) = session.take_processor() {
            self.pool.release(processor);
        }
        self.finished.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Store a finished generation in memory and on disk; `true` if either took it
    async fn write_back(&self, key: &ContentKey, key_parts: &Value, raw: &str, artifact: &Artifact) -> bool {
        if !key.is_cacheable() {
            return false;
        }

        let generation = CachedGeneration {
            raw: raw.to_string(),
            artifact: artifact.clone(),
        };

        let mut written = match self.cache.store(key, generation.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to cache {}: {}", key, e);
                false
            }
        };

        let namespace = self.config.namespace.clone();
        let owner = self.config.owner_id.clone();
        let parts = key_parts.clone();
        match self
            .on_persisted(move |persisted| persisted.save(&namespace, &owner, &parts, &generation))
            .await
        {
            Some(true) => written = true,
            Some(false) => warn!("Generation {} was not persisted", key),
            None => {}
        }
        written
    }

    /// Undo a write-back whose session was cancelled before it finished
    async fn roll_back(&self, key: &ContentKey, key_parts: &Value) {
        self.cache.delete(&key.as_cache_key()).await;

        let namespace = self.config.namespace.clone();
        let owner = self.config.owner_id.clone();
        let parts = key_parts.clone();
        self.on_persisted(move |persisted| persisted.remove(&namespace, &owner, &parts))
            .await;
    }

    async fn record_error(&self, key_parts: &Value, message: &str) {
        let namespace = format!("{}.errors", self.config.namespace);
        let owner = self.config.owner_id.clone();
        let parts = key_parts.clone();
        let message = message.to_string();
        self.on_persisted(move |persisted| persisted.record_error(&namespace, &owner, &parts, &message))
            .await;
    }

    /// Run `f` against the persisted adapter on the blocking pool
    ///
    /// `None` when no adapter is configured or the task panicked.
    async fn on_persisted<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&PersistedKeyValueAdapter) -> R + Send + 'static,
    {
        let persisted = self.persisted.clone()?;
        match tokio::task::spawn_blocking(move || f(&persisted)).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("Persisted store task failed: {}", e);
                None
            }
        }
    }

    fn external_session_id(&self, source_id: &str) -> Option<SessionId> {
        let mut state = self.lock_state();
        external_session(&mut state, source_id).map(|s| s.id)
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The live external session fed by `source_id`
fn external_session<'a>(state: &'a mut ControllerState, source_id: &str) -> Option<&'a mut Session> {
    state
        .current
        .as_mut()
        .filter(|s| !s.is_terminal() && s.external_source() == Some(source_id))
}

/// Routes transport chunks to one session
struct SessionSink {
    controller: Arc<StreamIngestionController>,
    id: SessionId,
}

impl ChunkSink for SessionSink {
    fn chunk(&self, text: &str) {
        self.controller.apply_chunk(self.id, text);
    }
}
