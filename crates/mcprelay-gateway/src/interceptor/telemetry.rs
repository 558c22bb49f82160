//! Telemetry interceptor
//!
//! Records latency, outcome, and backend attribution for every call.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CallContext, Interceptor};
use crate::telemetry::Metrics;

pub struct TelemetryInterceptor {
    metrics: Arc<Metrics>,
}

impl TelemetryInterceptor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Interceptor for TelemetryInterceptor {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn after(&self, ctx: &CallContext, outcome: &mut Result<serde_json::Value, String>) {
        let server = ctx.server.as_deref().unwrap_or("unrouted");
        self.metrics
            .record_call(server, ctx.started.elapsed(), outcome.is_ok());
    }
}
