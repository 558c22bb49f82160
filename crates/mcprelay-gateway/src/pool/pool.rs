//! The client pool
//!
//! Lazy, reference-counted connections to upstream backends. `get` starts a
//! cold backend (single-flight per server), `release` drops the borrow, and
//! configuration changes close handles for removed servers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use mcprelay_core::{EventSender, ServerRuntime, SharedConfiguration};
use parking_lot::RwLock;
use rmcp::model::Root;
use tracing::{debug, info, warn};

use super::handle::{ClientHandle, HandleState};
use super::transport::{connect_http, connect_stdio};
use crate::oauth::TokenStore;
use crate::runtime::ContainerRuntime;

/// Upstream initialize handshake bound.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum delay before a failed backend may be started again.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Pool-wide counters for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub servers: usize,
    pub ready: usize,
    pub failing: usize,
}

/// Lazy, reference-counted pool of upstream MCP clients.
pub struct ClientPool {
    entries: DashMap<String, Arc<ClientHandle>>,
    snapshot: RwLock<SharedConfiguration>,
    runtime: Arc<dyn ContainerRuntime>,
    tokens: Arc<TokenStore>,
    /// Networks to attach container backends to (set at startup when the
    /// gateway itself runs in a container).
    networks: RwLock<Vec<String>>,
    events: EventSender,
    init_timeout: Duration,
    closed: AtomicBool,
}

impl ClientPool {
    pub fn new(
        snapshot: SharedConfiguration,
        runtime: Arc<dyn ContainerRuntime>,
        tokens: Arc<TokenStore>,
        events: EventSender,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            snapshot: RwLock::new(snapshot),
            runtime,
            tokens,
            networks: RwLock::new(Vec::new()),
            events,
            init_timeout: INIT_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Networks container backends should join.
    pub fn set_networks(&self, networks: Vec<String>) {
        *self.networks.write() = networks;
    }

    /// Borrow a live handle for `server`, starting the backend if cold.
    ///
    /// Safe to call concurrently: one start attempt proceeds per server,
    /// other callers wait on its outcome. The returned handle is `Ready`
    /// and its refcount has been incremented; pair with `release`.
    pub async fn get(&self, server: &str) -> Result<Arc<ClientHandle>> {
        if self.closed.load(Ordering::Acquire) {
            bail!("client pool is closed");
        }

        let handle = self
            .entries
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(ClientHandle::new(server, self.events.clone())))
            .clone();

        // Fast path without the start lock
        if handle.is_ready() {
            handle.acquire();
            return Ok(handle);
        }

        let _flight = handle.start_lock.lock().await;

        // A concurrent caller may have finished the start while we waited
        if handle.is_ready() {
            handle.acquire();
            drop(_flight);
            return Ok(handle);
        }

        match handle.state() {
            HandleState::Closed => bail!("server '{server}' has been removed"),
            HandleState::Failing if !handle.retry_allowed(Instant::now()) => {
                bail!(
                    "server '{server}' is failing: {}",
                    handle.last_error().unwrap_or_else(|| "unknown error".to_string())
                );
            }
            _ => {}
        }

        let (spec, secrets) = {
            let snapshot = self.snapshot.read();
            let (spec, secrets) = snapshot
                .find(server)
                .ok_or_else(|| anyhow!("unknown server '{server}'"))?;
            (spec.clone(), secrets.clone())
        };

        handle.mark_starting();
        let handler = handle.handler();

        let result = match &spec.runtime {
            ServerRuntime::Container { .. } => {
                let networks = self.networks.read().clone();
                match self.runtime.launch_plan(&spec, &secrets, &networks) {
                    Ok(plan) => connect_stdio(server, &plan, handler, self.init_timeout).await,
                    Err(e) => Err(e),
                }
            }
            ServerRuntime::RemoteHttp { url, headers } => {
                let bearer = match &spec.oauth_provider {
                    Some(provider) => self.tokens.access_token(provider).await.unwrap_or_else(|e| {
                        debug!(server = %server, error = %e, "[Pool] No stored token, connecting bare");
                        None
                    }),
                    None => None,
                };
                connect_http(
                    server,
                    url,
                    headers,
                    bearer.as_deref(),
                    handler,
                    self.init_timeout,
                )
                .await
            }
        };

        match result {
            Ok(client) => {
                handle.mark_ready(client).await;
                handle.acquire();
                drop(_flight);
                Ok(handle)
            }
            Err(e) => {
                handle.mark_failing(e.to_string(), Instant::now() + RETRY_BACKOFF);
                Err(e)
            }
        }
    }

    /// Return a borrow taken with `get`.
    pub fn release(&self, handle: &ClientHandle) {
        handle.release_ref();
    }

    /// Force the next `get` for `server` to rebuild its connection with a
    /// freshly-read token.
    pub async fn invalidate_oauth(&self, server: &str) {
        if let Some(handle) = self.entries.get(server).map(|e| e.clone()) {
            info!(server = %server, "[Pool] Invalidating connection after OAuth change");
            handle.reset().await;
        }
    }

    /// Fan a new roots list out to every connected upstream.
    pub async fn update_roots(&self, roots: Vec<Root>) {
        let handles: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            if handle.is_ready() {
                handle.update_roots(roots.clone()).await;
            }
        }
    }

    /// Publish a new snapshot: closes handles for removed servers and warms
    /// up long-lived backends that are new to the configuration.
    pub async fn apply_configuration(self: &Arc<Self>, snapshot: SharedConfiguration) {
        let removed: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| snapshot.find(name).is_none())
            .collect();

        *self.snapshot.write() = snapshot.clone();

        for name in removed {
            if let Some((_, handle)) = self.entries.remove(&name) {
                info!(server = %name, "[Pool] Server removed from configuration");
                handle.close().await;
            }
        }

        self.precreate_long_lived();
    }

    /// Start long-lived container backends ahead of demand.
    pub fn precreate_long_lived(self: &Arc<Self>) {
        let snapshot = self.snapshot.read().clone();
        for name in snapshot.server_names() {
            let Some((spec, _)) = snapshot.find(name) else {
                continue;
            };
            if !spec.runtime.is_long_lived() {
                continue;
            }
            if self.entries.get(name).is_some_and(|h| h.is_ready()) {
                continue;
            }
            let pool = Arc::clone(self);
            let name = name.clone();
            tokio::spawn(async move {
                match pool.get(&name).await {
                    Ok(handle) => pool.release(&handle),
                    Err(e) => warn!(server = %name, error = %e, "[Pool] Warm-up failed"),
                }
            });
        }
    }

    /// Close every handle. Subsequent `get` fails.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[Pool] Closing all backends");
        let handles: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.close().await;
        }
        self.entries.clear();
    }

    /// Register a pre-connected handle (in-process test backends).
    #[cfg(test)]
    pub(crate) fn insert_handle(&self, handle: Arc<ClientHandle>) {
        self.entries.insert(handle.server.clone(), handle);
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            servers: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.iter() {
            match entry.value().state() {
                HandleState::Ready => stats.ready += 1,
                HandleState::Failing => stats.failing += 1,
                _ => {}
            }
        }
        stats
    }
}
