//! Telemetry
//!
//! In-process counters with a periodic export task. The flush interval
//! comes from `DOCKER_MCP_METRICS_INTERVAL` (seconds, default 30);
//! `DOCKER_MCP_TELEMETRY_DEBUG` switches the export lines to per-backend
//! detail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const METRICS_INTERVAL_ENV: &str = "DOCKER_MCP_METRICS_INTERVAL";
const TELEMETRY_DEBUG_ENV: &str = "DOCKER_MCP_TELEMETRY_DEBUG";

/// Default export interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Shutdown flush bound.
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct BackendCounters {
    calls: AtomicU64,
    errors: AtomicU64,
    latency_us: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub calls: u64,
    pub errors: u64,
    pub backends: Vec<BackendSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub server: String,
    pub calls: u64,
    pub errors: u64,
    pub avg_latency_us: u64,
}

/// Process-wide call counters with per-backend attribution.
pub struct Metrics {
    calls: AtomicU64,
    errors: AtomicU64,
    backends: DashMap<String, BackendCounters>,
    verbose: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            backends: DashMap::new(),
            verbose: std::env::var(TELEMETRY_DEBUG_ENV).is_ok(),
        }
    }

    /// Export interval from the environment, defaulting to 30 s.
    pub fn flush_interval() -> Duration {
        std::env::var(METRICS_INTERVAL_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL)
    }

    /// Record one forwarded call.
    pub fn record_call(&self, server: &str, latency: Duration, ok: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let entry = self.backends.entry(server.to_string()).or_default();
        entry.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            entry.errors.fetch_add(1, Ordering::Relaxed);
        }
        entry
            .latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let backends = self
            .backends
            .iter()
            .map(|entry| {
                let calls = entry.calls.load(Ordering::Relaxed);
                BackendSnapshot {
                    server: entry.key().clone(),
                    calls,
                    errors: entry.errors.load(Ordering::Relaxed),
                    avg_latency_us: if calls > 0 {
                        entry.latency_us.load(Ordering::Relaxed) / calls
                    } else {
                        0
                    },
                }
            })
            .collect();
        MetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            backends,
        }
    }

    /// Emit one export line.
    pub fn flush(&self) {
        let snapshot = self.snapshot();
        if self.verbose {
            for backend in &snapshot.backends {
                debug!(
                    server = %backend.server,
                    calls = backend.calls,
                    errors = backend.errors,
                    avg_latency_us = backend.avg_latency_us,
                    "[Telemetry] Backend counters"
                );
            }
        }
        info!(
            calls = snapshot.calls,
            errors = snapshot.errors,
            backends = snapshot.backends.len(),
            "[Telemetry] Flush"
        );
    }

    /// Long-lived export task; final flush on cancellation.
    pub fn spawn_exporter(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        let interval = Self::flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        metrics.flush();
                        return;
                    }
                    _ = ticker.tick() => metrics.flush(),
                }
            }
        })
    }
}
