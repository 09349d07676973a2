//! Remote-object adapter layer for a native time-tagger control library.
//!
//! The server introspects the native library's API surface once at startup,
//! classifies every exported class into an adapter kind, and exposes the
//! result over gRPC: constructors and free functions on a root object,
//! forwarded members on server-tracked adapters, numeric arrays as
//! base64-wrapped NPY payloads, and per-session resource tracking so a
//! departing client never leaks device handles.

pub mod adapter;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod introspect;
pub mod native;
pub mod registry;
pub mod server;
pub mod value;

/// Generated wire types for the `tagger_rpc` protocol.
pub mod proto {
    #![allow(clippy::all)]
    tonic::include_proto!("tagger_rpc");
}
