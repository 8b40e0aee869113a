//! Wire protocol types for controller-worker communication.
//!
//! The protocol is half-duplex: the controller writes one [`Request`] and the
//! worker answers with exactly one [`Response`] before the next request is sent.
//! There are no request ids; the only open request is always the last one sent.

use serde::{Deserialize, Serialize};

/// Request parameters. Only the envelope stays a free-form map; each query kind
/// agrees on its own keys.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Reserved method that makes the worker exit. Sent as a notification.
pub const SHUTDOWN_METHOD: &str = "shutdown";

/// Request from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Name of the handler to run. Older workers call this `route`.
    #[serde(alias = "route")]
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn shutdown() -> Self {
        Self::new(SHUTDOWN_METHOD, None)
    }

    pub fn is_shutdown(&self) -> bool {
        self.method == SHUTDOWN_METHOD
    }
}

/// Response from worker to controller: `{"result": ..}` or `{"error": ".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Result(serde_json::Value),
    Error(String),
}

impl Response {
    /// First frame written by a worker once its runtime is loaded.
    pub fn ready() -> Self {
        Self::Result(serde_json::json!({ "message": "ok" }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}
