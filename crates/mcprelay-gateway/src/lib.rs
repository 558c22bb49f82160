//! MCP Relay Gateway
//!
//! Aggregating MCP proxy that exposes a fleet of upstream MCP servers
//! behind one endpoint:
//! - Lazy, reference-counted client pool with single-flight startup
//! - Capability reconciliation with collision tie-breaking
//! - Per-backend OAuth refresh orchestration
//! - Interceptor chain on every inbound MCP call

pub mod interceptor;
pub mod mcp;
pub mod oauth;
pub mod pool;
pub mod reconcile;
pub mod runtime;
pub mod server;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod test_support;

pub use mcp::RelayHandler;
pub use oauth::{
    ExternalEvent, ExternalEventKind, OAuthOrchestrator, OAuthToken, StateManager, TokenStore,
};
pub use pool::{ClientHandle, ClientPool, HandleState, PoolStats};
pub use reconcile::{CapabilityDiff, Reconciler, Registration, RegistrationTable};
pub use runtime::{ContainerRuntime, DockerCli, LaunchPlan};
pub use server::{Gateway, GatewayConfig, TransportMode};
pub use session::{SessionCache, SessionRegistry};
pub use telemetry::Metrics;
