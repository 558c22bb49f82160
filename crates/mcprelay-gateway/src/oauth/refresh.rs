//! Per-backend refresh loops
//!
//! One long-lived task per OAuth-requiring backend guarantees that at most
//! one refresh is in flight for that backend, regardless of concurrent
//! demand. The task parks until the token nears expiry (or an external
//! event arrives), refreshes, and broadcasts the outcome to waiters in
//! FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcprelay_core::{DomainEvent, EventSender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::TokenStore;
use super::token::{OAuthToken, EXPIRY_SKEW_SECS};

/// How long a single-flight waiter blocks before giving up.
pub const WAITER_TIMEOUT: Duration = Duration::from_secs(5);

/// Base backoff after a refresh that failed to rotate the token.
pub const BACKOFF_BASE_SECS: u64 = 30;

/// Unchanged-expiry refreshes tolerated before the loop stops.
pub const MAX_UNCHANGED_REFRESHES: u32 = 7;

/// Errors surfaced to token demand.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("unauthorized: re-login required for '{0}'")]
    Unauthorized(String),
    #[error("token refresh failed: {0}")]
    Failed(String),
    #[error("timed out waiting for token refresh")]
    Timeout,
}

/// Performs the actual token-endpoint call. Extracted so the state machine
/// is testable without a network.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, provider: &str, current: &OAuthToken) -> anyhow::Result<OAuthToken>;
}

/// Default refresher: `grant_type=refresh_token` against the token endpoint
/// recorded in the provider's DCR registration.
pub struct HttpTokenRefresher {
    http: reqwest::Client,
    store: Arc<TokenStore>,
}

impl HttpTokenRefresher {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, provider: &str, current: &OAuthToken) -> anyhow::Result<OAuthToken> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no refresh token for '{provider}'"))?;
        let client = self
            .store
            .load_client(provider)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no client registration for '{provider}'"))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", client.client_id.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&client.token_endpoint)
            .form(&form)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            anyhow::bail!("unauthorized");
        }
        if !response.status().is_success() {
            anyhow::bail!("token endpoint returned {}", response.status());
        }
        let parsed: super::token::TokenResponse = response.json().await?;
        let mut token: OAuthToken = parsed.into();
        // Providers may omit the refresh token on rotation; keep the old one
        if token.refresh_token.is_none() {
            token.refresh_token = current.refresh_token.clone();
        }
        Ok(token)
    }
}

/// Loop phases. `Backoff` covers the exponential sleep between unchanged
/// refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Waiting,
    Refreshing,
    Backoff,
    Stopped,
}

enum LoopSignal {
    /// A waiter wants a valid token now.
    Demand,
    /// An external login-success / token-refresh event was injected.
    External,
}

struct LoopState {
    phase: LoopPhase,
    refresh_in_progress: bool,
    waiters: VecDeque<oneshot::Sender<Result<(), RefreshError>>>,
    last_observed_expiry: Option<DateTime<Utc>>,
    retry_count: u32,
}

/// Handle to one backend's refresh loop.
pub struct RefreshLoop {
    provider: String,
    state: Mutex<LoopState>,
    signal_tx: mpsc::Sender<LoopSignal>,
    cancel: CancellationToken,
}

impl RefreshLoop {
    /// Spawn the loop task. The returned handle injects events and serves
    /// single-flight demand.
    pub fn spawn(
        provider: &str,
        store: Arc<TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        events: EventSender,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let this = Arc::new(Self {
            provider: provider.to_string(),
            state: Mutex::new(LoopState {
                phase: LoopPhase::Waiting,
                refresh_in_progress: false,
                waiters: VecDeque::new(),
                last_observed_expiry: None,
                retry_count: 0,
            }),
            signal_tx,
            cancel: parent_cancel.child_token(),
        });
        tokio::spawn(Arc::clone(&this).run(store, refresher, events, signal_rx));
        info!(provider = %provider, "[OAuth] Refresh loop started");
        this
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn phase(&self) -> LoopPhase {
        self.state.lock().phase
    }

    /// Inject an external login-success / token-refresh event.
    pub fn inject_external(&self) {
        let _ = self.signal_tx.try_send(LoopSignal::External);
    }

    /// Stop the loop (configuration removal, logout, shutdown).
    pub fn stop(&self, reason: &str) {
        debug!(provider = %self.provider, reason = %reason, "[OAuth] Stopping refresh loop");
        self.cancel.cancel();
    }

    /// Single-flight token demand.
    ///
    /// Returns immediately when the stored token is valid and not near
    /// expiry. Otherwise the caller becomes a waiter; the first waiter also
    /// triggers the refresh. Bounded by `WAITER_TIMEOUT`.
    pub async fn ensure_valid(&self, store: &TokenStore) -> Result<(), RefreshError> {
        if let Ok(Some(token)) = store.load_token(&self.provider).await {
            if !token.near_expiry() {
                return Ok(());
            }
        }

        let (tx, rx) = oneshot::channel();
        let lead = {
            let mut state = self.state.lock();
            if state.phase == LoopPhase::Stopped {
                return Err(RefreshError::Unauthorized(self.provider.clone()));
            }
            state.waiters.push_back(tx);
            !state.refresh_in_progress
        };
        if lead {
            let _ = self.signal_tx.try_send(LoopSignal::Demand);
        }

        match tokio::time::timeout(WAITER_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RefreshError::Failed("refresh loop exited".to_string())),
            Err(_) => Err(RefreshError::Timeout),
        }
    }

    fn broadcast(&self, result: Result<(), RefreshError>) {
        let waiters = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.waiters)
        };
        // FIFO order of subscription
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Time until the stored token needs refreshing; `None` parks on the
    /// event channel alone.
    async fn park_duration(&self, store: &TokenStore) -> Option<Duration> {
        let token = store.load_token(&self.provider).await.ok().flatten()?;
        let expires_at = token.expires_at?;
        let wake_at = expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECS);
        let remaining = wake_at - Utc::now();
        Some(remaining.to_std().unwrap_or(Duration::ZERO))
    }

    async fn run(
        self: Arc<Self>,
        store: Arc<TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        events: EventSender,
        mut signals: mpsc::Receiver<LoopSignal>,
    ) {
        loop {
            let park = self.park_duration(&store).await;
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.finish(&events, "shutdown");
                    return;
                }
                signal = signals.recv() => match signal {
                    Some(signal) => Some(signal),
                    None => {
                        self.finish(&events, "channel closed");
                        return;
                    }
                },
                _ = park_timer(park) => None,
            };

            // Demand raised after a concurrent refresh already succeeded:
            // answer from the store without another refresh.
            if matches!(signal, Some(LoopSignal::Demand)) {
                if let Ok(Some(token)) = store.load_token(&self.provider).await {
                    if !token.near_expiry() {
                        self.broadcast(Ok(()));
                        continue;
                    }
                }
            }

            // Refresh cycle, retrying through backoff until rotated,
            // stopped, or out of attempts.
            loop {
                {
                    let mut state = self.state.lock();
                    state.phase = LoopPhase::Refreshing;
                    state.refresh_in_progress = true;
                }

                let current = match store.load_token(&self.provider).await {
                    Ok(Some(token)) => token,
                    _ => {
                        // Nothing to refresh yet (login not completed)
                        self.clear_in_progress(LoopPhase::Waiting);
                        self.broadcast(Err(RefreshError::Failed(format!(
                            "no stored token for '{}'",
                            self.provider
                        ))));
                        break;
                    }
                };

                let outcome = refresher.refresh(&self.provider, &current).await;
                match outcome {
                    Ok(token) => {
                        let previous = self.state.lock().last_observed_expiry;
                        let unchanged =
                            previous.is_some() && token.expires_at == previous;
                        if unchanged {
                            if self.count_retry(&events) {
                                return;
                            }
                            if self.backoff().await {
                                self.finish(&events, "shutdown");
                                return;
                            }
                            continue;
                        }

                        if let Err(e) = store.save_token(&self.provider, &token).await {
                            warn!(provider = %self.provider, error = %e, "[OAuth] Failed to persist token");
                        }
                        {
                            let mut state = self.state.lock();
                            state.last_observed_expiry = token.expires_at;
                            state.retry_count = 0;
                            state.refresh_in_progress = false;
                            state.phase = LoopPhase::Waiting;
                        }
                        info!(provider = %self.provider, "[OAuth] Token refreshed");
                        events.emit(DomainEvent::OAuthRefreshed {
                            provider: self.provider.clone(),
                        });
                        self.broadcast(Ok(()));
                        break;
                    }
                    Err(e) if is_unauthorized(&e) => {
                        warn!(provider = %self.provider, "[OAuth] Refresh unauthorized, stopping loop");
                        self.stop_with_unauthorized(&events, "unauthorized refresh");
                        return;
                    }
                    Err(e) => {
                        debug!(provider = %self.provider, error = %e, "[OAuth] Refresh attempt failed");
                        if self.count_retry(&events) {
                            return;
                        }
                        if self.backoff().await {
                            self.finish(&events, "shutdown");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Increment the retry counter; returns true when the loop must stop.
    fn count_retry(&self, events: &EventSender) -> bool {
        let retries = {
            let mut state = self.state.lock();
            state.retry_count += 1;
            state.retry_count
        };
        if retries >= MAX_UNCHANGED_REFRESHES {
            warn!(
                provider = %self.provider,
                retries,
                "[OAuth] Token never rotated, stopping loop"
            );
            self.stop_with_unauthorized(events, "token not rotating");
            return true;
        }
        false
    }

    /// Exponential sleep `30 * 2^(retry-1)`; returns true when cancelled.
    async fn backoff(&self) -> bool {
        let retries = {
            let mut state = self.state.lock();
            state.phase = LoopPhase::Backoff;
            state.refresh_in_progress = false;
            state.retry_count
        };
        let secs = BACKOFF_BASE_SECS * 2u64.pow(retries.saturating_sub(1));
        debug!(provider = %self.provider, seconds = secs, "[OAuth] Backing off");
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(Duration::from_secs(secs)) => false,
        }
    }

    fn clear_in_progress(&self, phase: LoopPhase) {
        let mut state = self.state.lock();
        state.refresh_in_progress = false;
        state.phase = phase;
    }

    fn stop_with_unauthorized(&self, events: &EventSender, reason: &str) {
        self.clear_in_progress(LoopPhase::Stopped);
        self.broadcast(Err(RefreshError::Unauthorized(self.provider.clone())));
        events.emit(DomainEvent::OAuthStopped {
            provider: self.provider.clone(),
            reason: reason.to_string(),
        });
    }

    fn finish(&self, events: &EventSender, reason: &str) {
        self.clear_in_progress(LoopPhase::Stopped);
        self.broadcast(Err(RefreshError::Failed(format!(
            "refresh loop stopped: {reason}"
        ))));
        events.emit(DomainEvent::OAuthStopped {
            provider: self.provider.clone(),
            reason: reason.to_string(),
        });
    }
}

/// Pending future for the optional park timer.
async fn park_timer(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn is_unauthorized(error: &anyhow::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("unauthorized") || text.contains("invalid_grant")
}
