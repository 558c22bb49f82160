//! Call logging
//!
//! Records method and arguments for every inbound call, with secret values
//! redacted before anything reaches the log.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::secrets::SecretSet;
use super::{CallContext, InterceptError, Interceptor};

pub struct LoggingInterceptor {
    secrets: Arc<SecretSet>,
}

impl LoggingInterceptor {
    pub fn new(secrets: Arc<SecretSet>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "log-calls"
    }

    async fn before(&self, ctx: &CallContext, args: &serde_json::Value) -> Result<(), InterceptError> {
        let rendered = if args.is_null() {
            String::new()
        } else {
            self.secrets.redact(&args.to_string())
        };
        info!(
            method = ctx.method,
            target = %ctx.target,
            args = %rendered,
            "[Interceptor] Call"
        );
        Ok(())
    }

    async fn after(&self, ctx: &CallContext, outcome: &mut Result<serde_json::Value, String>) {
        debug!(
            method = ctx.method,
            target = %ctx.target,
            ok = outcome.is_ok(),
            elapsed_ms = ctx.started.elapsed().as_millis() as u64,
            "[Interceptor] Call finished"
        );
    }
}
