//! Wire protocol between the controller and the introspection worker.
//!
//! # Architecture
//!
//! - **protocol**: Request/Response envelopes and reserved method names
//! - **codec**: Content-Length framing + JSON for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
