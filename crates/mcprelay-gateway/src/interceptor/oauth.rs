//! OAuth preflight
//!
//! Tool calls bound to an OAuth backend must hold a valid token before the
//! call is forwarded. Demand is single-flight per backend; a stopped
//! refresh loop surfaces as an unauthorized error.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{CallContext, InterceptError, Interceptor};
use crate::oauth::{OAuthOrchestrator, RefreshError};

pub struct OAuthPreflightInterceptor {
    orchestrator: Arc<OAuthOrchestrator>,
}

impl OAuthPreflightInterceptor {
    pub fn new(orchestrator: Arc<OAuthOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Interceptor for OAuthPreflightInterceptor {
    fn name(&self) -> &'static str {
        "oauth-preflight"
    }

    async fn before(&self, ctx: &CallContext, _args: &serde_json::Value) -> Result<(), InterceptError> {
        // Only tool calls are gated on a valid token
        if ctx.method != "tools/call" {
            return Ok(());
        }
        let Some(provider) = &ctx.oauth_provider else {
            return Ok(());
        };
        debug!(provider = %provider, target = %ctx.target, "[Interceptor] OAuth preflight");
        match self.orchestrator.ensure_valid_token(provider).await {
            Ok(()) => Ok(()),
            Err(RefreshError::Unauthorized(p)) => Err(InterceptError::Unauthorized(format!(
                "authorization required for '{p}': run the OAuth login flow again"
            ))),
            Err(e) => Err(InterceptError::Other(e.to_string())),
        }
    }
}
