//! OAuth refresh orchestration
//!
//! - **token / store**: token model and credential-store persistence
//! - **refresh**: per-backend refresh loops with single-flight demand
//! - **events**: external notification parsing and provider extraction
//! - **state**: pending-authorization nonces (PKCE)
//! - **flow**: authorization URL construction and code exchange
//!
//! The orchestrator owns the provider registry: one refresh loop per
//! OAuth-requiring backend, created from configuration or on external
//! login-success, and routed external events.

mod events;
mod flow;
mod refresh;
mod state;
mod store;
mod token;

pub use events::{extract_provider, parse_record, ExternalEvent, ExternalEventKind};
pub use flow::{callback_port, shorten_url, AuthorizeUrl, LoginFlow};
pub use refresh::{
    HttpTokenRefresher, LoopPhase, RefreshError, RefreshLoop, TokenRefresher,
    BACKOFF_BASE_SECS, MAX_UNCHANGED_REFRESHES, WAITER_TIMEOUT,
};
pub use state::{PendingAuth, PkcePair, StateManager};
pub use store::{DcrClient, TokenStore};
pub use token::{OAuthToken, TokenResponse, EXPIRY_SKEW_SECS};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mcprelay_core::{EventSender, SharedConfiguration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period between creating a loop for an unknown provider and
/// injecting the login event, letting the loop reach its park point.
pub const LOGIN_GRACE: Duration = Duration::from_millis(100);

/// Reconcile work the orchestrator requests from the gateway runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub server: String,
    /// Remove the backend's registrations instead of re-listing them.
    pub remove: bool,
}

/// Delivers external OAuth notification records.
#[async_trait]
pub trait NotificationSource: Send {
    /// Next JSON record, `None` at end of stream.
    async fn next_record(&mut self) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Line-delimited JSON over any async reader.
pub struct JsonLineSource<R> {
    lines: tokio::io::Lines<tokio::io::BufReader<R>>,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> JsonLineSource<R> {
    pub fn new(reader: R) -> Self {
        use tokio::io::AsyncBufReadExt;
        Self {
            lines: tokio::io::BufReader::new(reader).lines(),
        }
    }
}

#[async_trait]
impl<R: tokio::io::AsyncRead + Unpin + Send> NotificationSource for JsonLineSource<R> {
    async fn next_record(&mut self) -> anyhow::Result<Option<serde_json::Value>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str(&line) {
                    Ok(value) => return Ok(Some(value)),
                    Err(e) => {
                        debug!(error = %e, "[OAuth] Skipping malformed notification record");
                        continue;
                    }
                },
                None => return Ok(None),
            }
        }
    }
}

/// Owns the per-backend refresh loops and routes external events.
pub struct OAuthOrchestrator {
    loops: DashMap<String, Arc<RefreshLoop>>,
    store: Arc<TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    events: EventSender,
    reload_tx: mpsc::Sender<ReloadRequest>,
    cancel: CancellationToken,
}

impl OAuthOrchestrator {
    pub fn new(
        store: Arc<TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        events: EventSender,
        reload_tx: mpsc::Sender<ReloadRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            loops: DashMap::new(),
            store,
            refresher,
            events,
            reload_tx,
            cancel,
        }
    }

    pub fn store(&self) -> Arc<TokenStore> {
        Arc::clone(&self.store)
    }

    /// Create the refresh loop for a provider if absent.
    pub fn start_loop(&self, provider: &str) -> Arc<RefreshLoop> {
        self.loops
            .entry(provider.to_string())
            .or_insert_with(|| {
                RefreshLoop::spawn(
                    provider,
                    Arc::clone(&self.store),
                    Arc::clone(&self.refresher),
                    self.events.clone(),
                    &self.cancel,
                )
            })
            .clone()
    }

    /// Stop and drop a provider's loop, if it exists.
    pub fn stop_loop(&self, provider: &str, reason: &str) {
        if let Some((_, handle)) = self.loops.remove(provider) {
            handle.stop(reason);
        }
    }

    pub fn has_loop(&self, provider: &str) -> bool {
        self.loops.contains_key(provider)
    }

    /// Guarantee a non-expired token for `provider` (single-flight).
    pub async fn ensure_valid_token(&self, provider: &str) -> Result<(), RefreshError> {
        let handle = self
            .loops
            .get(provider)
            .map(|e| e.clone())
            .ok_or_else(|| RefreshError::Unauthorized(provider.to_string()))?;
        handle.ensure_valid(&self.store).await
    }

    /// Align running loops with a configuration snapshot: start loops for
    /// OAuth backends in the snapshot, stop loops for everything else.
    pub fn sync_configuration(&self, snapshot: &SharedConfiguration) {
        let wanted: Vec<String> = snapshot
            .oauth_servers()
            .iter()
            .filter_map(|s| s.oauth_provider.clone())
            .collect();
        for provider in &wanted {
            self.start_loop(provider);
        }
        let stale: Vec<String> = self
            .loops
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| !wanted.contains(p))
            .collect();
        for provider in stale {
            info!(provider = %provider, "[OAuth] Provider removed from configuration");
            self.stop_loop(&provider, "configuration removal");
        }
    }

    /// Route one parsed external event. Exactly one of
    /// {create-loop-and-reload, inject, stop-loop, ignore} happens.
    pub async fn route_event(&self, event: ExternalEvent) {
        match event.kind {
            ExternalEventKind::LoginSuccess => {
                let created = !self.has_loop(&event.provider);
                let handle = self.start_loop(&event.provider);
                if created {
                    // Let the fresh loop reach its park point first
                    tokio::time::sleep(LOGIN_GRACE).await;
                }
                handle.inject_external();
                info!(provider = %event.provider, "[OAuth] Login success, reloading backend");
                let _ = self
                    .reload_tx
                    .send(ReloadRequest {
                        server: event.provider,
                        remove: false,
                    })
                    .await;
            }
            ExternalEventKind::TokenRefresh => match self.loops.get(&event.provider) {
                Some(handle) => handle.inject_external(),
                // Another gateway instance or a disabled server
                None => debug!(provider = %event.provider, "[OAuth] No loop for token refresh, dropping"),
            },
            ExternalEventKind::LogoutSuccess => {
                info!(provider = %event.provider, "[OAuth] Logout, stopping loop");
                self.stop_loop(&event.provider, "logout");
                if let Err(e) = self.store.delete_token(&event.provider).await {
                    warn!(provider = %event.provider, error = %e, "[OAuth] Token cleanup failed");
                }
                let _ = self
                    .reload_tx
                    .send(ReloadRequest {
                        server: event.provider,
                        remove: true,
                    })
                    .await;
            }
            ExternalEventKind::LoginStart
            | ExternalEventKind::CodeReceived
            | ExternalEventKind::Error => {
                debug!(provider = %event.provider, kind = ?event.kind, "[OAuth] Ignoring event");
            }
        }
    }

    /// Long-lived monitor task over an external notification source.
    pub async fn run_monitor<S: NotificationSource>(self: Arc<Self>, mut source: S) {
        info!("[OAuth] External event monitor started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("[OAuth] Event monitor stopped");
                    return;
                }
                record = source.next_record() => match record {
                    Ok(Some(value)) => {
                        if let Some(event) = parse_record(&value) {
                            self.route_event(event).await;
                        }
                    }
                    Ok(None) => {
                        info!("[OAuth] Notification stream ended");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "[OAuth] Notification stream error");
                        return;
                    }
                },
            }
        }
    }

    /// Stop every loop (process shutdown).
    pub fn shutdown(&self) {
        for entry in self.loops.iter() {
            entry.value().stop("shutdown");
        }
        self.loops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mcprelay_core::{EventBus, MemoryCredentialStore};

    struct NoopRefresher;

    #[async_trait]
    impl TokenRefresher for NoopRefresher {
        async fn refresh(&self, _: &str, current: &OAuthToken) -> anyhow::Result<OAuthToken> {
            let mut next = current.clone();
            next.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
            Ok(next)
        }
    }

    fn orchestrator() -> (Arc<OAuthOrchestrator>, mpsc::Receiver<ReloadRequest>) {
        let (reload_tx, reload_rx) = mpsc::channel(8);
        let store = Arc::new(TokenStore::new(
            Arc::new(MemoryCredentialStore::new()),
            "https://auth.example.com",
        ));
        let orchestrator = Arc::new(OAuthOrchestrator::new(
            store,
            Arc::new(NoopRefresher),
            EventBus::new().sender(),
            reload_tx,
            CancellationToken::new(),
        ));
        (orchestrator, reload_rx)
    }

    #[tokio::test]
    async fn test_login_success_creates_loop_and_reloads() {
        let (orchestrator, mut reload_rx) = orchestrator();
        assert!(!orchestrator.has_loop("newserver"));

        orchestrator
            .route_event(ExternalEvent {
                kind: ExternalEventKind::LoginSuccess,
                provider: "newserver".to_string(),
                message: "login succeeded for newserver".to_string(),
            })
            .await;

        assert!(orchestrator.has_loop("newserver"));
        assert_eq!(
            reload_rx.recv().await.unwrap(),
            ReloadRequest {
                server: "newserver".to_string(),
                remove: false
            }
        );
    }

    #[tokio::test]
    async fn test_token_refresh_without_loop_is_dropped() {
        let (orchestrator, mut reload_rx) = orchestrator();
        orchestrator
            .route_event(ExternalEvent {
                kind: ExternalEventKind::TokenRefresh,
                provider: "ghost".to_string(),
                message: "refresh for ghost".to_string(),
            })
            .await;
        assert!(!orchestrator.has_loop("ghost"));
        assert!(reload_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_logout_stops_loop_and_removes() {
        let (orchestrator, mut reload_rx) = orchestrator();
        orchestrator.start_loop("github");

        orchestrator
            .route_event(ExternalEvent {
                kind: ExternalEventKind::LogoutSuccess,
                provider: "github".to_string(),
                message: "logout of github".to_string(),
            })
            .await;

        assert!(!orchestrator.has_loop("github"));
        assert_eq!(
            reload_rx.recv().await.unwrap(),
            ReloadRequest {
                server: "github".to_string(),
                remove: true
            }
        );
    }

    #[tokio::test]
    async fn test_ensure_without_loop_is_unauthorized() {
        let (orchestrator, _rx) = orchestrator();
        let err = orchestrator.ensure_valid_token("unknown").await.unwrap_err();
        assert!(matches!(err, RefreshError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_json_line_source_skips_garbage() {
        let input = b"not json\n\n{\"operation\":\"mcp-oauth-error\",\"message\":\"x for y\"}\n";
        let mut source = JsonLineSource::new(&input[..]);
        let record = source.next_record().await.unwrap().unwrap();
        assert_eq!(record["operation"], "mcp-oauth-error");
        assert!(source.next_record().await.unwrap().is_none());
    }
}
