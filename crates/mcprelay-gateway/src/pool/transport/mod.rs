//! Upstream transport connection
//!
//! Resolves a server spec into a concrete connection attempt: container
//! backends are spawned through the container runtime and spoken to over
//! stdio; remote backends are reached over streamable HTTP with an optional
//! bearer token from the OAuth token store.

mod http;
mod stdio;

pub use http::connect_http;
pub use stdio::{configure_child_process_platform, connect_stdio};
