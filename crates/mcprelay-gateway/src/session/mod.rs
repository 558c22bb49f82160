//! Per-session client state
//!
//! The gateway caches, per connected MCP client session: the roots the
//! client advertises, its resource subscriptions, and its identity. Caches
//! are created on first reference and destroyed on session close.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use mcprelay_core::CapabilityKind;
use parking_lot::RwLock;
use rmcp::model::{Implementation, Root};
use rmcp::service::{Peer, RoleServer};
use tracing::{debug, info, warn};

/// Cached state for one client session.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    /// Roots advertised by the client. `None` records that the client does
    /// not support roots, distinct from an empty list.
    pub roots: Option<Vec<Root>>,
    /// Resource URIs the client subscribed to. Delivery bookkeeping is the
    /// MCP SDK's job; this cache exists for observability and cleanup.
    pub subscriptions: HashSet<String>,
    pub client_info: Option<Implementation>,
}

/// Session caches plus the peers used for server-initiated notifications.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionCache>>,
    peers: DashMap<String, Arc<Peer<RoleServer>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache for a session, created on first reference.
    pub fn get_session_cache(&self, session: &str) -> SessionCache {
        self.sessions
            .write()
            .entry(session.to_string())
            .or_default()
            .clone()
    }

    /// Mutate a session's cache in place (created on first reference).
    pub fn update<F: FnOnce(&mut SessionCache)>(&self, session: &str, f: F) {
        let mut sessions = self.sessions.write();
        f(sessions.entry(session.to_string()).or_default());
    }

    /// Destroy a session's cache and peer registration.
    pub fn remove_session_cache(&self, session: &str) {
        self.sessions.write().remove(session);
        self.peers.remove(session);
        debug!(session = %session, "[Session] Cache removed");
    }

    /// Register the peer for notification delivery.
    pub fn register_peer(&self, session: &str, peer: Peer<RoleServer>) {
        self.peers.insert(session.to_string(), Arc::new(peer));
    }

    pub fn subscribe(&self, session: &str, uri: &str) {
        self.update(session, |cache| {
            cache.subscriptions.insert(uri.to_string());
        });
    }

    pub fn unsubscribe(&self, session: &str, uri: &str) {
        self.update(session, |cache| {
            cache.subscriptions.remove(uri);
        });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Query the client's current roots and cache the outcome.
    ///
    /// Clients may not support `roots/list`; a failed query is recorded as
    /// `None` so later passes can tell "unsupported" from "no roots".
    pub async fn list_roots(&self, session: &str) -> Option<Vec<Root>> {
        let peer = self.peers.get(session).map(|p| Arc::clone(&p))?;
        match peer.list_roots().await {
            Ok(result) => {
                self.update(session, |cache| cache.roots = Some(result.roots.clone()));
                Some(result.roots)
            }
            Err(e) => {
                debug!(session = %session, error = %e, "[Session] Client does not expose roots");
                self.update(session, |cache| cache.roots = None);
                None
            }
        }
    }

    /// Send capability list-changed notifications to every connected
    /// session.
    pub async fn notify_capability_changes(&self, kinds: &[CapabilityKind]) {
        let peers: Vec<(String, Arc<Peer<RoleServer>>)> = self
            .peers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        if peers.is_empty() {
            return;
        }
        info!(
            sessions = peers.len(),
            kinds = ?kinds,
            "[Session] Broadcasting capability changes"
        );
        for (session, peer) in peers {
            for kind in kinds {
                let sent = match kind {
                    CapabilityKind::Tools => peer.notify_tool_list_changed().await,
                    CapabilityKind::Prompts => peer.notify_prompt_list_changed().await,
                    CapabilityKind::Resources | CapabilityKind::ResourceTemplates => {
                        peer.notify_resource_list_changed().await
                    }
                };
                if let Err(e) = sent {
                    warn!(session = %session, error = %e, "[Session] Notification failed");
                }
            }
        }
    }
}
