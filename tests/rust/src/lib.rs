//! Shared fixtures for MCP Relay integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mcprelay_core::MemoryCredentialStore;
use mcprelay_gateway::oauth::{OAuthToken, TokenRefresher, TokenStore};

/// Fresh in-memory token store.
pub fn token_store() -> Arc<TokenStore> {
    Arc::new(TokenStore::new(
        Arc::new(MemoryCredentialStore::new()),
        "https://auth.test",
    ))
}

/// Token expiring `expires_in_secs` from now (negative = already expired).
pub fn token(expires_in_secs: i64) -> OAuthToken {
    OAuthToken {
        access_token: "access".to_string(),
        token_type: "Bearer".to_string(),
        refresh_token: Some("refresh".to_string()),
        expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
        scope: None,
    }
}

/// Counts refresh invocations and rotates the expiry on each call.
#[derive(Default)]
pub struct RotatingRefresher {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenRefresher for RotatingRefresher {
    async fn refresh(&self, _provider: &str, current: &OAuthToken) -> anyhow::Result<OAuthToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut next = current.clone();
        next.access_token = format!("access-{}", self.calls.load(Ordering::SeqCst));
        next.expires_at = Some(Utc::now() + Duration::hours(1));
        Ok(next)
    }
}

impl RotatingRefresher {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Returns the same expiry on every call (upstream fails to rotate).
pub struct StuckRefresher;

#[async_trait]
impl TokenRefresher for StuckRefresher {
    async fn refresh(&self, _provider: &str, current: &OAuthToken) -> anyhow::Result<OAuthToken> {
        Ok(current.clone())
    }
}

/// Refresher that never completes inside the waiter timeout.
pub struct HangingRefresher;

#[async_trait]
impl TokenRefresher for HangingRefresher {
    async fn refresh(&self, _provider: &str, current: &OAuthToken) -> anyhow::Result<OAuthToken> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(current.clone())
    }
}
