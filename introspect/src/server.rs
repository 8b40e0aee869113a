//! Server loop - runs inside the worker process.
//!
//! The controller side (spawning, requests) is in client.rs.
//!
//! Loop:
//! 1. Announce readiness with a handshake response
//! 2. Read one request frame, dispatch it by method name, write one response
//! 3. Repeat until the shutdown request arrives or the controller goes away
//!
//! A handler that fails or panics produces an error response; one bad query
//! must not take the worker down.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CodecError, ContentLengthCodec, JsonCodec};
use crate::bridge::protocol::{Params, Request, Response};

/// Error message for a method nobody registered.
pub const UNKNOWN_ROUTE: &str = "unknown route";

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A named query against the live runtime.
pub trait Handler: Send + Sync {
    fn call(&self, params: Option<&Params>) -> Result<Value, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Option<&Params>) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, params: Option<&Params>) -> Result<Value, HandlerError> {
        self(params)
    }
}

/// Required string parameter.
pub fn str_param<'a>(params: Option<&'a Params>, name: &'static str) -> Result<&'a str, HandlerError> {
    let value = params
        .and_then(|p| p.get(name))
        .ok_or(HandlerError::MissingParam(name))?;
    value.as_str().ok_or_else(|| HandlerError::InvalidParam {
        name,
        reason: format!("expected a string, got {}", value),
    })
}

/// Handlers keyed by method name.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `request`, converting every failure into an error response.
    pub fn dispatch(&self, request: &Request) -> Response {
        let method = request.method.as_str();
        let Some(handler) = self.handlers.get(method) else {
            tracing::debug!(method, "No handler registered");
            return Response::error(UNKNOWN_ROUTE);
        };

        match catch_unwind(AssertUnwindSafe(|| handler.call(request.params.as_ref()))) {
            Ok(Ok(result)) => Response::Result(result),
            Ok(Err(e)) => {
                tracing::debug!(method, error = %e, "Handler failed");
                Response::error(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(method, panic = %message, "Handler panicked");
                Response::error(format!("handler panicked: {}", message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn into_io(err: CodecError) -> io::Error {
    match err {
        CodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve requests from `input` until shutdown or end of input.
pub async fn run_server<R, W>(input: R, output: W, router: &Router) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(input, ContentLengthCodec::new());
    let mut writer = FramedWrite::new(output, JsonCodec::<Response>::new());

    writer.send(Response::ready()).await.map_err(into_io)?;
    tracing::info!(routes = router.len(), "Worker ready");

    loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) if e.is_incomplete() => {
                tracing::warn!(error = %e, "Controller went away mid-request, exiting");
                return Ok(());
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Input stream is unreadable, exiting");
                return Err(into_io(e));
            }
            None => {
                tracing::info!("Input closed (controller exited?), exiting");
                return Ok(());
            }
        };

        // A bad body inside a good frame leaves the stream in sync: answer and go on.
        let request: Request = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed request");
                writer
                    .send(Response::error(format!("malformed request: {}", e)))
                    .await
                    .map_err(into_io)?;
                continue;
            }
        };

        if request.is_shutdown() {
            tracing::info!("Shutdown requested");
            return Ok(());
        }

        tracing::trace!(method = %request.method, "Request received");
        let response = router.dispatch(&request);
        writer.send(response).await.map_err(into_io)?;
    }
}
