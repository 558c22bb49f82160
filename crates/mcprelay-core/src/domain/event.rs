//! Domain events
//!
//! Events flow through the `EventBus` from producers (pool, reconciler,
//! OAuth orchestrator, config watcher) to consumers (the exposed server's
//! notifier, telemetry, tests).

use serde::Serialize;

use super::server::CapabilityKind;

/// Events emitted by gateway subsystems.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// The reconciler changed the exposed capability set.
    CapabilitiesChanged {
        server: String,
        kinds: Vec<CapabilityKind>,
        added: usize,
        removed: usize,
    },
    /// An upstream sent a `*/list_changed` notification.
    BackendListChanged {
        server: String,
        kind: CapabilityKind,
    },
    /// A pool handle finished its initialize handshake.
    BackendReady { server: String },
    /// A pool handle was closed.
    BackendClosed { server: String },
    /// A pool handle failed to start or died.
    BackendFailed { server: String, error: String },
    /// A refresh loop obtained a rotated token.
    OAuthRefreshed { provider: String },
    /// A refresh loop stopped (logout, config removal, or fatal backoff).
    OAuthStopped { provider: String, reason: String },
    /// A new configuration snapshot was published.
    ConfigReloaded { servers: usize },
}

impl DomainEvent {
    /// Stable name for logging and telemetry attribution.
    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::CapabilitiesChanged { .. } => "capabilities_changed",
            DomainEvent::BackendListChanged { .. } => "backend_list_changed",
            DomainEvent::BackendReady { .. } => "backend_ready",
            DomainEvent::BackendClosed { .. } => "backend_closed",
            DomainEvent::BackendFailed { .. } => "backend_failed",
            DomainEvent::OAuthRefreshed { .. } => "oauth_refreshed",
            DomainEvent::OAuthStopped { .. } => "oauth_stopped",
            DomainEvent::ConfigReloaded { .. } => "config_reloaded",
        }
    }

    /// The backend this event concerns, when there is one.
    pub fn server(&self) -> Option<&str> {
        match self {
            DomainEvent::CapabilitiesChanged { server, .. }
            | DomainEvent::BackendListChanged { server, .. }
            | DomainEvent::BackendReady { server }
            | DomainEvent::BackendClosed { server }
            | DomainEvent::BackendFailed { server, .. } => Some(server),
            DomainEvent::OAuthRefreshed { provider }
            | DomainEvent::OAuthStopped { provider, .. } => Some(provider),
            DomainEvent::ConfigReloaded { .. } => None,
        }
    }
}
