//! Boundary to the model provider
//!
//! A transport receives one [`GenerationRequest`], pushes text to a
//! [`ChunkSink`] as it arrives and resolves with the full output. It must
//! stop promptly once its [`CancelToken`] fires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::TransportError;

mod command;

pub use command::CommandTransport;

/// What the transport is asked to generate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub namespace: String,
    pub config: Value,
    pub context: Value,
}

/// Receiver of streamed text
pub trait ChunkSink: Send + Sync {
    fn chunk(&self, text: &str);
}

#[async_trait]
pub trait LlmTransport: Send + Sync + fmt::Debug {
    /// Stream one generation; returns the complete output text
    async fn stream(
        &self,
        request: GenerationRequest,
        sink: Arc<dyn ChunkSink>,
        cancel: CancelToken,
    ) -> Result<String, TransportError>;
}

/// Cooperative cancellation flag shared between a session and its transport
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of this token, so this only
        // returns once the flag is set.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());

        let waiter = tokio::spawn(async move { observer.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_set() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
