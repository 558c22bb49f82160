//! Exposed MCP server
//!
//! `RelayHandler` implements the rmcp `ServerHandler` trait, presenting the
//! aggregated capability set and forwarding calls to upstream backends
//! through the registration table, interceptor chain, and client pool.

mod handler;

pub use handler::{GatewayContext, RelayHandler};
