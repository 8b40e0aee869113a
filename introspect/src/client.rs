//! Runner client - controller-side facade over the introspection worker.
//!
//! Flow:
//! 1. Spawn the worker through the supervisor
//! 2. Wait for the handshake frame (the worker has loaded its runtime)
//! 3. Answer queries one at a time: write a request, wait for its response
//! 4. On shutdown: send the shutdown notification, wait for exit, close streams
//!
//! At most one request is in flight: every operation that touches the worker's
//! streams takes `&mut self`, so there are no request ids to correlate.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CodecError, JsonCodec, next_frame};
use crate::bridge::protocol::{Params, Request, Response};
use crate::introspection::{
    MODEL_METHOD, ModelInfo, ROUTE_METHOD, RouteInfo, model_params, route_params,
};
use crate::null_client::NullClient;
use crate::supervisor::{
    self, CommandSpawner, SpawnError, WorkerCommand, WorkerProcess, WorkerSpawner,
};

/// How long to keep reading stderr for diagnostics once nothing more arrives.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// The query contract shared by the live client and its stand-in.
///
/// Callers never branch on whether a worker is available: failures are logged
/// and surface as `None`, the same as a query that found nothing.
#[async_trait]
pub trait Runner: Send {
    /// Run `method` in the worker and return its result.
    async fn query(&mut self, method: &str, params: Option<Params>) -> Option<Value>;

    /// Stop the worker and release its streams. Idempotent.
    async fn shutdown(&mut self);

    /// True once the streams are closed and the worker is gone.
    fn is_stopped(&self) -> bool;

    /// Columns and schema file of a concrete, database-backed model.
    async fn model(&mut self, name: &str) -> Option<ModelInfo> {
        let result = self.query(MODEL_METHOD, Some(model_params(name))).await?;
        decode_payload(MODEL_METHOD, result)
    }

    /// Route serving `controller#action`.
    async fn route(&mut self, controller: &str, action: &str) -> Option<RouteInfo> {
        let result = self
            .query(ROUTE_METHOD, Some(route_params(controller, action)))
            .await?;
        decode_payload(ROUTE_METHOD, result)
    }
}

fn decode_payload<T: DeserializeOwned>(method: &str, result: Value) -> Option<T> {
    match serde_json::from_value(result) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(method, error = %e, "Unexpected result shape from worker");
            None
        }
    }
}

/// Build a client, falling back to [`NullClient`] when the worker cannot be
/// spawned or never becomes ready.
pub async fn create_client(config: ClientConfig) -> Box<dyn Runner> {
    match RunnerClient::start(config).await {
        Ok(client) => Box::new(client),
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize worker");
            if let Some(stderr) = e.diagnostics() {
                tracing::error!(stderr, "Worker diagnostics");
            }
            tracing::warn!("Worker-dependent features will not be available");
            Box::new(NullClient)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    /// Handshake failed or the worker exited before answering.
    #[error("worker failed to initialize: {reason}")]
    Initialization { reason: String, stderr: String },

    /// Stream closed, truncated, or timed out mid-exchange.
    #[error("incomplete message from worker: {0}")]
    IncompleteMessage(String),

    /// The worker answered with an `error` field (including unknown routes).
    #[error("worker error: {0}")]
    Remote(String),

    #[error("failed to decode worker message: {0}")]
    Decode(CodecError),
}

impl ClientError {
    /// Worker stderr captured while failing to start, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Initialization { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::IncompleteMessage(reason) => Self::IncompleteMessage(reason),
            // A broken pipe or read error means the worker's end is gone.
            CodecError::Io(e) => Self::IncompleteMessage(e.to_string()),
            other => Self::Decode(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Spawned, handshake pending.
    Created,
    Running,
    /// Shutdown sent, waiting for the worker to exit.
    ShuttingDown,
    /// Streams closed.
    Stopped,
}

pub struct ClientConfig {
    pub command: WorkerCommand,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl ClientConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            // Booting a full application runtime can be slow.
            handshake_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// Worker stderr, read while every exchange is pending so the worker never
/// blocks on a full pipe. Only the most recent output is kept, for diagnostics.
struct StderrTail {
    stream: Option<ChildStderr>,
    /// False once the worker closed its end.
    open: bool,
    buf: Vec<u8>,
}

impl StderrTail {
    fn new(stream: ChildStderr) -> Self {
        Self {
            stream: Some(stream),
            open: true,
            buf: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_DIAGNOSTIC_BYTES {
            let excess = self.buf.len() - MAX_DIAGNOSTIC_BYTES;
            self.buf.drain(..excess);
        }
    }

    /// Drive `fut` to completion, consuming stderr whenever the worker writes to it.
    async fn pump<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut chunk = [0u8; 4096];
        loop {
            if !self.open {
                return fut.await;
            }
            let Some(stream) = self.stream.as_mut() else {
                return fut.await;
            };
            let read = tokio::select! {
                biased;
                output = &mut fut => return output,
                read = stream.read(&mut chunk) => read,
            };
            match read {
                Ok(0) | Err(_) => self.open = false,
                Ok(n) => self.push(&chunk[..n]),
            }
        }
    }

    /// Everything buffered plus whatever arrives before the stream goes quiet.
    async fn drain(&mut self) -> String {
        let mut chunk = [0u8; 4096];
        while self.open
            && let Some(stream) = self.stream.as_mut()
        {
            match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) => self.open = false,
                Ok(Ok(n)) => self.push(&chunk[..n]),
                Err(_) => break,
            }
        }

        let text = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        self.buf.clear();
        text
    }

    fn close(&mut self) {
        self.stream = None;
        self.open = false;
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

/// Client backed by a live worker process.
pub struct RunnerClient {
    state: ClientState,
    process: WorkerProcess,
    writer: Option<FramedWrite<ChildStdin, JsonCodec<Request>>>,
    reader: Option<FramedRead<ChildStdout, JsonCodec<Response>>>,
    stderr: StderrTail,
    /// Set after a broken exchange. A late response could otherwise be read as
    /// the answer to the next request.
    poisoned: bool,
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl RunnerClient {
    /// Spawn the worker and wait for its handshake.
    ///
    /// On failure the worker has been killed and reaped before this returns.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let handle = supervisor::start(config.spawner.as_ref(), &config.command)?;

        let mut client = Self {
            state: ClientState::Created,
            process: handle.process,
            writer: Some(FramedWrite::new(handle.stdin, JsonCodec::new())),
            reader: Some(FramedRead::new(handle.stdout, JsonCodec::new())),
            stderr: StderrTail::new(handle.stderr),
            poisoned: false,
            request_timeout: config.request_timeout,
            shutdown_timeout: config.shutdown_timeout,
        };

        tracing::info!(pid = ?client.pid(), "Booting worker");
        match client.handshake(config.handshake_timeout).await {
            Ok(()) => {
                client.state = ClientState::Running;
                tracing::info!(pid = ?client.pid(), "Worker ready");
                Ok(client)
            }
            Err(reason) => {
                if let Err(e) = client.process.terminate().await {
                    tracing::warn!(error = %e, "Failed to reap worker after failed startup");
                }
                let stderr = client.stderr.drain().await;
                Err(ClientError::Initialization { reason, stderr })
            }
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    async fn handshake(&mut self, timeout: Duration) -> Result<(), String> {
        let reader = self.reader.as_mut().ok_or("worker output is closed")?;
        let handshake = self.stderr.pump(next_frame(reader));
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(Response::Result(_))) => Ok(()),
            Ok(Ok(Response::Error(message))) => Err(format!("worker reported: {}", message)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no handshake within {:.1}s",
                timeout.as_secs_f64()
            )),
        }
    }

    /// One request/response exchange, bounded by the request timeout.
    async fn request(&mut self, method: &str, params: Option<Params>) -> Result<Value, ClientError> {
        let timeout = self.request_timeout;
        let (Some(writer), Some(reader)) = (self.writer.as_mut(), self.reader.as_mut()) else {
            return Err(ClientError::IncompleteMessage(
                "worker streams are closed".to_string(),
            ));
        };

        let exchange = async {
            writer.send(Request::new(method, params)).await?;
            next_frame(reader).await
        };

        let response = match tokio::time::timeout(timeout, self.stderr.pump(exchange)).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(ClientError::IncompleteMessage(format!(
                    "no response within {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
        };

        match response {
            Response::Result(result) => Ok(result),
            Response::Error(message) => Err(ClientError::Remote(message)),
        }
    }

    /// Make sure the worker is gone after a shutdown wait. Returns false when
    /// the exit could not be confirmed.
    async fn confirm_exit(&mut self, waited: std::io::Result<ExitStatus>) -> bool {
        let error = match waited {
            Ok(status) => {
                tracing::info!(%status, "Worker stopped");
                return true;
            }
            Err(e) => e,
        };

        tracing::warn!(error = %error, "Failed to wait for worker exit, killing it");
        match self.process.terminate().await {
            Ok(status) => {
                tracing::info!(%status, "Worker killed");
                true
            }
            Err(e) => {
                tracing::error!(pid = ?self.pid(), error = %e, "Could not confirm worker exit");
                false
            }
        }
    }
}

#[async_trait]
impl Runner for RunnerClient {
    async fn query(&mut self, method: &str, params: Option<Params>) -> Option<Value> {
        if self.state != ClientState::Running {
            tracing::debug!(method, state = ?self.state, "Worker not running, query skipped");
            return None;
        }
        if self.poisoned {
            tracing::debug!(method, "Worker channel is broken, query skipped");
            return None;
        }

        match self.request(method, params).await {
            Ok(Value::Null) => None,
            Ok(result) => Some(result),
            Err(ClientError::Remote(message)) => {
                tracing::warn!(method, error = %message, "Worker returned an error");
                None
            }
            Err(e) => {
                self.poisoned = true;
                let stderr = self.stderr.drain().await;
                tracing::error!(
                    method,
                    error = %e,
                    stderr = %stderr,
                    "Failed to get a response from worker"
                );
                None
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state == ClientState::Stopped {
            return;
        }
        self.state = ClientState::ShuttingDown;
        tracing::info!(pid = ?self.pid(), "Shutting down worker");

        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.send(Request::shutdown()).await
        {
            tracing::debug!(error = %e, "Could not send shutdown, worker already gone");
        }

        let shutdown_timeout = self.shutdown_timeout;
        let waited = self
            .stderr
            .pump(self.process.wait_for_exit(shutdown_timeout))
            .await;
        if !self.confirm_exit(waited).await {
            // Streams stay open; a later shutdown retries.
            return;
        }

        // Streams are closed only after the exit is confirmed.
        self.writer = None;
        self.reader = None;
        self.stderr.close();
        self.state = ClientState::Stopped;
    }

    fn is_stopped(&self) -> bool {
        self.writer.is_none()
            && self.reader.is_none()
            && self.stderr.is_closed()
            && self.process.has_exited()
    }
}
