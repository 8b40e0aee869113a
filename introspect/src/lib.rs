//! introspect: query a live application runtime from a tooling process.
//!
//! The runtime (model metadata, routing tables) only exists inside a worker
//! subprocess. The controller talks to it over the worker's stdin/stdout with
//! Content-Length framed JSON, one request at a time.

pub mod bridge;
pub mod client;
pub mod introspection;
mod null_client;
pub mod server;
pub mod supervisor;

pub use bridge::protocol::{Params, Request, Response, SHUTDOWN_METHOD};
pub use client::{ClientConfig, ClientError, ClientState, Runner, RunnerClient, create_client};
pub use introspection::{MODEL_METHOD, ModelInfo, ROUTE_METHOD, RouteInfo, SourceLocation};
pub use null_client::NullClient;
pub use server::{Handler, HandlerError, Router, UNKNOWN_ROUTE, run_server, str_param};
pub use supervisor::{CommandSpawner, SpawnError, WorkerCommand, WorkerSpawner};
