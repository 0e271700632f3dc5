//! HTTP API Module
//!
//! Provides a REST API over the replicated store and node status.

mod http;

pub use http::{HttpServer, KvEntry, StatusResponse};
