//! `searchpipe` crate (library surface).
//!
//! The primary entrypoint for end users is the `searchpipe` binary (CLI + MCP stdio).
//! This library module exists for embedding: it re-exports the core types and the
//! in-process client without depending on internal crate layout.

pub use searchpipe_core as core;
pub use searchpipe_local as local;

pub use searchpipe_core::{ApiError, ErrorKind, HealthStatus, Operation, ResponseSource, Served};
pub use searchpipe_local::{ClientConfig, SearchClient};
