//! Core error types

use thiserror::Error;

/// Errors produced by the core layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("secret '{name}' is not available for server '{server}'")]
    MissingSecret { server: String, name: String },

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
