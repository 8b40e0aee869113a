//! Stand-in used when no worker could be started.

use async_trait::async_trait;
use serde_json::Value;

use crate::bridge::protocol::Params;
use crate::client::Runner;

/// Answers every query with nothing and never touches a process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClient;

#[async_trait]
impl Runner for NullClient {
    async fn query(&mut self, method: &str, _params: Option<Params>) -> Option<Value> {
        tracing::trace!(method, "No worker available, query skipped");
        None
    }

    async fn shutdown(&mut self) {}

    fn is_stopped(&self) -> bool {
        true
    }
}
