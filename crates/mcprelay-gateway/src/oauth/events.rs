//! External OAuth notification parsing
//!
//! A collaborator connection delivers a JSON event stream whose records
//! carry at least `{operation, message, error?}`. Operations are mapped to
//! event kinds by exact match; the provider name is extracted from the
//! free-text message with deterministic patterns. Records that yield no
//! provider are dropped.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

lazy_static! {
    // "… for <name>" and "… of <name>"
    static ref PROVIDER_FOR: Regex = Regex::new(r"\bfor\s+([A-Za-z0-9_.-]+)").unwrap();
    static ref PROVIDER_OF: Regex = Regex::new(r"\bof\s+([A-Za-z0-9_.-]+)").unwrap();
}

/// Recognized external event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalEventKind {
    LoginStart,
    CodeReceived,
    LoginSuccess,
    TokenRefresh,
    LogoutSuccess,
    Error,
}

impl ExternalEventKind {
    /// Exact-match mapping from operation strings.
    pub fn from_operation(operation: &str) -> Option<Self> {
        match operation {
            "mcp-oauth-login-start" => Some(Self::LoginStart),
            "mcp-oauth-code-received" => Some(Self::CodeReceived),
            "mcp-oauth-login-success" => Some(Self::LoginSuccess),
            "mcp-oauth-token-refresh" => Some(Self::TokenRefresh),
            "mcp-oauth-logout-success" => Some(Self::LogoutSuccess),
            "mcp-oauth-error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A routed external event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub kind: ExternalEventKind,
    pub provider: String,
    pub message: String,
}

/// Raw record shape on the wire.
#[derive(Debug, Deserialize)]
pub struct EventRecord {
    pub operation: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Extract the provider name from a free-text message.
///
/// Matches `… for <name>` first, then `… of <name>`. No match yields an
/// empty string, which callers treat as a drop.
pub fn extract_provider(message: &str) -> String {
    PROVIDER_FOR
        .captures(message)
        .or_else(|| PROVIDER_OF.captures(message))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Parse one stream record into an event, or `None` when it must be
/// dropped (unknown operation or no extractable provider).
pub fn parse_record(record: &serde_json::Value) -> Option<ExternalEvent> {
    let record: EventRecord = serde_json::from_value(record.clone()).ok()?;
    let kind = ExternalEventKind::from_operation(&record.operation)?;
    let provider = extract_provider(&record.message);
    if provider.is_empty() {
        return None;
    }
    Some(ExternalEvent {
        kind,
        provider,
        message: record.message,
    })
}
