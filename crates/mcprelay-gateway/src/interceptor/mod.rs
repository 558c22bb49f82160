//! Interceptor chain
//!
//! Middleware applied to every inbound MCP call in declared order:
//! `before` hooks run request-side (and may short-circuit with an error
//! returned to the client unchanged), `after` hooks run response-side in
//! reverse order.

mod logging;
mod oauth;
mod secrets;
mod telemetry;

pub use logging::LoggingInterceptor;
pub use oauth::OAuthPreflightInterceptor;
pub use secrets::{SecretBlockInterceptor, SecretSet};
pub use telemetry::TelemetryInterceptor;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;

/// Error surfaced by a short-circuiting interceptor.
#[derive(Debug, Clone, Error)]
pub enum InterceptError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Other(String),
}

/// Context for one inbound call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// MCP method, e.g. `tools/call`.
    pub method: &'static str,
    /// Client-visible capability name (or URI).
    pub target: String,
    /// Backend the call routes to, when known.
    pub server: Option<String>,
    /// OAuth provider bound to that backend, when any.
    pub oauth_provider: Option<String>,
    pub started: Instant,
}

impl CallContext {
    pub fn new(method: &'static str, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            server: None,
            oauth_provider: None,
            started: Instant::now(),
        }
    }

    pub fn with_route(mut self, server: &str, oauth_provider: Option<&str>) -> Self {
        self.server = Some(server.to_string());
        self.oauth_provider = oauth_provider.map(str::to_string);
        self
    }
}

/// One middleware stage.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Request side; an error stops the chain and is returned to the
    /// client unchanged.
    async fn before(&self, _ctx: &CallContext, _args: &serde_json::Value) -> Result<(), InterceptError> {
        Ok(())
    }

    /// Response side; may rewrite the outcome (e.g. redaction).
    async fn after(&self, _ctx: &CallContext, _outcome: &mut Result<serde_json::Value, String>) {}
}

/// Ordered interceptor pipeline.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { stages }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn before(
        &self,
        ctx: &CallContext,
        args: &serde_json::Value,
    ) -> Result<(), InterceptError> {
        for stage in &self.stages {
            stage.before(ctx, args).await?;
        }
        Ok(())
    }

    pub async fn after(&self, ctx: &CallContext, outcome: &mut Result<serde_json::Value, String>) {
        for stage in self.stages.iter().rev() {
            stage.after(ctx, outcome).await;
        }
    }
}

/// Interceptor names accepted in configuration, in default order.
pub const DEFAULT_CHAIN: &str = "log-calls,block-secrets,telemetry,oauth-preflight";

/// Build a chain from a comma-separated name list.
pub fn parse_chain(
    list: &str,
    secrets: &Arc<SecretSet>,
    metrics: &Arc<crate::telemetry::Metrics>,
    orchestrator: Option<&Arc<crate::oauth::OAuthOrchestrator>>,
) -> anyhow::Result<InterceptorChain> {
    let mut stages: Vec<Arc<dyn Interceptor>> = Vec::new();
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match name {
            "log-calls" => stages.push(Arc::new(LoggingInterceptor::new(Arc::clone(secrets)))),
            "block-secrets" => {
                stages.push(Arc::new(SecretBlockInterceptor::new(Arc::clone(secrets))))
            }
            "telemetry" => stages.push(Arc::new(TelemetryInterceptor::new(Arc::clone(metrics)))),
            "oauth-preflight" => match orchestrator {
                Some(orchestrator) => stages.push(Arc::new(OAuthPreflightInterceptor::new(
                    Arc::clone(orchestrator),
                ))),
                // OAuth disabled: preflight has nothing to guard
                None => continue,
            },
            other => anyhow::bail!("unknown interceptor '{other}'"),
        }
    }
    Ok(InterceptorChain::new(stages))
}
