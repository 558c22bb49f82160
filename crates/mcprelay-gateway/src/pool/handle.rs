//! Upstream client handles
//!
//! One `ClientHandle` per configured backend. Handles are shared between
//! concurrent request tasks (reference-counted) and owned by the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mcprelay_core::{CapabilityKind, DomainEvent, EventSender};
use parking_lot::{Mutex, RwLock};
use rmcp::model::{
    ClientCapabilities, ClientInfo, Implementation, ListRootsResult, Root, RootsCapabilities,
};
use rmcp::service::{NotificationContext, RoleClient, RunningService};
use rmcp::ErrorData as McpError;
use tracing::{debug, info, warn};

/// Type alias for a connected upstream MCP client
pub type UpstreamClient = RunningService<RoleClient, RelayClientHandler>;

/// Lifecycle state of an upstream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// No connection; next `get` starts one
    Cold,
    /// Initialize handshake in progress (start lock held)
    Starting,
    /// Connected and usable
    Ready,
    /// Last start attempt failed; retriable after backoff
    Failing,
    /// Close requested, connection being torn down
    Closing,
    /// Closed; only configuration re-add revives the server
    Closed,
}

/// Mutable status block guarded by one lock.
#[derive(Debug)]
struct HandleStats {
    state: HandleState,
    last_error: Option<String>,
    /// Earliest instant a retry is allowed after a failure.
    retry_after: Option<Instant>,
}

/// Client handler the gateway presents to each upstream.
///
/// Advertises roots support and answers `roots/list` from the cached list
/// received from connected MCP clients. Backend `*/list_changed`
/// notifications are turned into domain events so the reconciler can
/// refresh a single server.
#[derive(Clone)]
pub struct RelayClientHandler {
    server: String,
    roots: Arc<RwLock<Option<Vec<Root>>>>,
    events: EventSender,
}

impl RelayClientHandler {
    pub fn new(server: &str, roots: Arc<RwLock<Option<Vec<Root>>>>, events: EventSender) -> Self {
        Self {
            server: server.to_string(),
            roots,
            events,
        }
    }

    fn emit_list_changed(&self, kind: CapabilityKind) {
        debug!(server = %self.server, kind = %kind, "[Pool] Backend sent list_changed");
        self.events.emit(DomainEvent::BackendListChanged {
            server: self.server.clone(),
            kind,
        });
    }
}

impl rmcp::ClientHandler for RelayClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities {
                roots: Some(RootsCapabilities {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            client_info: Implementation {
                name: format!("mcprelay-{}", self.server),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            meta: None,
        }
    }

    fn list_roots(
        &self,
        _context: rmcp::service::RequestContext<RoleClient>,
    ) -> impl std::future::Future<Output = Result<ListRootsResult, McpError>> + Send + '_ {
        let roots = self.roots.read().clone().unwrap_or_default();
        async move { Ok(ListRootsResult { roots }) }
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.emit_list_changed(CapabilityKind::Tools);
        async {}
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.emit_list_changed(CapabilityKind::Prompts);
        async {}
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.emit_list_changed(CapabilityKind::Resources);
        async {}
    }
}

/// A reference-counted connection slot for one backend.
pub struct ClientHandle {
    pub server: String,
    stats: RwLock<HandleStats>,
    client: tokio::sync::RwLock<Option<UpstreamClient>>,
    refcount: AtomicUsize,
    last_used: Mutex<Instant>,
    /// Roots cache shared with the upstream client handler.
    roots: Arc<RwLock<Option<Vec<Root>>>>,
    /// Single-flight guard: at most one start attempt per server.
    pub(crate) start_lock: tokio::sync::Mutex<()>,
    events: EventSender,
}

impl ClientHandle {
    pub fn new(server: &str, events: EventSender) -> Self {
        Self {
            server: server.to_string(),
            stats: RwLock::new(HandleStats {
                state: HandleState::Cold,
                last_error: None,
                retry_after: None,
            }),
            client: tokio::sync::RwLock::new(None),
            refcount: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            roots: Arc::new(RwLock::new(None)),
            start_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Handler wired to this handle's roots cache.
    pub fn handler(&self) -> RelayClientHandler {
        RelayClientHandler::new(&self.server, Arc::clone(&self.roots), self.events.clone())
    }

    pub fn state(&self) -> HandleState {
        self.stats.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.stats.read().state == HandleState::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.stats.read().last_error.clone()
    }

    /// Whether a failed handle may retry now.
    pub fn retry_allowed(&self, now: Instant) -> bool {
        match self.stats.read().retry_after {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        *self.last_used.lock() = Instant::now();
    }

    pub(crate) fn release_ref(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without matching get");
        *self.last_used.lock() = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub(crate) fn mark_starting(&self) {
        let mut stats = self.stats.write();
        stats.state = HandleState::Starting;
    }

    pub(crate) async fn mark_ready(&self, client: UpstreamClient) {
        *self.client.write().await = Some(client);
        let mut stats = self.stats.write();
        stats.state = HandleState::Ready;
        stats.last_error = None;
        stats.retry_after = None;
        drop(stats);
        info!(server = %self.server, "[Pool] Backend ready");
        self.events.emit(DomainEvent::BackendReady {
            server: self.server.clone(),
        });
    }

    pub(crate) fn mark_failing(&self, error: String, retry_after: Instant) {
        let mut stats = self.stats.write();
        stats.state = HandleState::Failing;
        stats.last_error = Some(error.clone());
        stats.retry_after = Some(retry_after);
        drop(stats);
        warn!(server = %self.server, error = %error, "[Pool] Backend failed");
        self.events.emit(DomainEvent::BackendFailed {
            server: self.server.clone(),
            error,
        });
    }

    /// Reset to cold so the next `get` rebuilds the connection (used after
    /// OAuth invalidation).
    pub(crate) async fn reset(&self) {
        self.shutdown_client().await;
        let mut stats = self.stats.write();
        stats.state = HandleState::Cold;
        stats.retry_after = None;
    }

    /// Peer handle for issuing MCP requests to the upstream.
    pub async fn peer(&self) -> Option<rmcp::service::Peer<RoleClient>> {
        self.client.read().await.as_ref().map(|c| c.peer().clone())
    }

    /// Replace the cached roots and notify the upstream.
    pub async fn update_roots(&self, roots: Vec<Root>) {
        *self.roots.write() = Some(roots);
        if let Some(peer) = self.peer().await {
            if let Err(e) = peer.notify_roots_list_changed().await {
                debug!(server = %self.server, error = %e, "[Pool] roots/list_changed notify failed");
            }
        }
    }

    pub fn cached_roots(&self) -> Option<Vec<Root>> {
        self.roots.read().clone()
    }

    async fn shutdown_client(&self) {
        if let Some(client) = self.client.write().await.take() {
            // Cancelling the running service sends the MCP shutdown where the
            // transport supports it and terminates the backing process.
            if let Err(e) = client.cancel().await {
                debug!(server = %self.server, error = %e, "[Pool] Client shutdown error");
            }
        }
    }

    /// Close the handle. Idempotent.
    pub(crate) async fn close(&self) {
        {
            let mut stats = self.stats.write();
            if matches!(stats.state, HandleState::Closed) {
                return;
            }
            stats.state = HandleState::Closing;
        }
        self.shutdown_client().await;
        self.stats.write().state = HandleState::Closed;
        info!(server = %self.server, "[Pool] Backend closed");
        self.events.emit(DomainEvent::BackendClosed {
            server: self.server.clone(),
        });
    }
}
