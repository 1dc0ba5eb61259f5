use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{CancelToken, ChunkSink, GenerationRequest, LlmTransport};
use crate::error::TransportError;

/// Runs an external generator process per request
///
/// The request is written to the child's stdin as JSON. Every stdout line is
/// forwarded as a chunk (newline included). A non-zero exit fails the
/// generation with the captured stderr.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl LlmTransport for CommandTransport {
    async fn stream(
        &self,
        request: GenerationRequest,
        sink: Arc<dyn ChunkSink>,
        cancel: CancelToken,
    ) -> Result<String, TransportError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("Running generator: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {}", self.program.display(), e)))?;

        let payload = serde_json::to_vec(&request).map_err(|e| TransportError::Failed(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            // Dropping stdin closes it so the child sees EOF.
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        let mut reader = BufReader::new(stdout);
        let mut output = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                read = reader.read_line(&mut line) => read?,
                _ = cancel.cancelled() => {
                    tracing::debug!("Generation cancelled, killing {}", self.program.display());
                    let _ = child.kill().await;
                    return Err(TransportError::Cancelled);
                }
            };

            if read == 0 {
                break;
            }

            sink.chunk(&line);
            output.push_str(&line);
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !stderr.is_empty() {
            tracing::warn!("generator stderr: {}", stderr.trim_end());
        }

        if !status.success() {
            return Err(TransportError::Exited {
                code: status.code(),
                stderr,
            });
        }

        Ok(output)
    }
}
