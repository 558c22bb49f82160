//! Secret redaction
//!
//! Holds the literal secret values of the current configuration snapshot
//! and scrubs them from log lines and outbound responses.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CallContext, Interceptor};

const REDACTED: &str = "***";

/// Snapshot-scoped set of literal secret values. Replaced on config reload.
#[derive(Default)]
pub struct SecretSet {
    values: RwLock<Vec<String>>,
}

impl SecretSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked values. Empty strings are ignored so they can
    /// never redact everything.
    pub fn replace(&self, values: Vec<String>) {
        *self.values.write() = values.into_iter().filter(|v| !v.is_empty()).collect();
    }

    /// Redact every tracked value from a string.
    pub fn redact(&self, text: &str) -> String {
        let values = self.values.read();
        let mut out = text.to_string();
        for value in values.iter() {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        out
    }

    /// Recursively redact every string in a JSON value. Returns whether
    /// anything was rewritten.
    pub fn scrub_value(&self, value: &mut serde_json::Value) -> bool {
        match value {
            serde_json::Value::String(s) => {
                let scrubbed = self.redact(s);
                if &scrubbed != s {
                    *s = scrubbed;
                    true
                } else {
                    false
                }
            }
            serde_json::Value::Array(items) => {
                let mut hit = false;
                for item in items {
                    hit |= self.scrub_value(item);
                }
                hit
            }
            serde_json::Value::Object(map) => {
                let mut hit = false;
                for (_, item) in map.iter_mut() {
                    hit |= self.scrub_value(item);
                }
                hit
            }
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

/// Scans outbound responses for literal secret values and redacts hits.
pub struct SecretBlockInterceptor {
    secrets: Arc<SecretSet>,
}

impl SecretBlockInterceptor {
    pub fn new(secrets: Arc<SecretSet>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl Interceptor for SecretBlockInterceptor {
    fn name(&self) -> &'static str {
        "block-secrets"
    }

    async fn after(&self, ctx: &CallContext, outcome: &mut Result<serde_json::Value, String>) {
        if self.secrets.is_empty() {
            return;
        }
        if let Ok(value) = outcome {
            if self.secrets.scrub_value(value) {
                tracing::warn!(
                    method = ctx.method,
                    target = %ctx.target,
                    "[Interceptor] Secret value redacted from response"
                );
            }
        }
    }
}
