//! Token and DCR client persistence
//!
//! Two key namespaces in the credential store:
//!
//! - `{auth_endpoint}/{provider}` - token sets
//! - `https://{server}.mcp-dcr` - DCR client registrations
//!
//! Payloads are base64-encoded JSON blobs.

use std::sync::Arc;

use anyhow::{Context, Result};
use mcprelay_core::{decode_blob, encode_blob, CredentialStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::token::OAuthToken;

/// A dynamically registered OAuth client (RFC 7591).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcrClient {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    /// Token endpoint discovered during registration.
    pub token_endpoint: String,
}

/// Credential-store-backed persistence for OAuth state.
pub struct TokenStore {
    store: Arc<dyn CredentialStore>,
    auth_endpoint: String,
}

impl TokenStore {
    pub fn new(store: Arc<dyn CredentialStore>, auth_endpoint: impl Into<String>) -> Self {
        Self {
            store,
            auth_endpoint: auth_endpoint.into(),
        }
    }

    fn token_key(&self, provider: &str) -> String {
        format!("{}/{}", self.auth_endpoint, provider)
    }

    fn dcr_key(server: &str) -> String {
        format!("https://{server}.mcp-dcr")
    }

    pub async fn save_token(&self, provider: &str, token: &OAuthToken) -> Result<()> {
        let blob = encode_blob(token)?;
        self.store
            .add(&self.token_key(provider), provider, &blob)
            .await
            .with_context(|| format!("failed to store token for '{provider}'"))?;
        debug!(provider = %provider, "[TokenStore] Stored token");
        Ok(())
    }

    pub async fn load_token(&self, provider: &str) -> Result<Option<OAuthToken>> {
        match self.store.get(&self.token_key(provider)).await? {
            Some((_, blob)) => Ok(Some(decode_blob(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_token(&self, provider: &str) -> Result<()> {
        self.store.delete(&self.token_key(provider)).await?;
        debug!(provider = %provider, "[TokenStore] Deleted token");
        Ok(())
    }

    /// Current access token for a provider, if one is stored and unexpired.
    pub async fn access_token(&self, provider: &str) -> Result<Option<String>> {
        Ok(self
            .load_token(provider)
            .await?
            .filter(|t| !t.is_expired())
            .map(|t| t.access_token))
    }

    pub async fn save_client(&self, server: &str, client: &DcrClient) -> Result<()> {
        let blob = encode_blob(client)?;
        self.store
            .add(&Self::dcr_key(server), &client.client_id, &blob)
            .await
            .with_context(|| format!("failed to store DCR client for '{server}'"))?;
        Ok(())
    }

    pub async fn load_client(&self, server: &str) -> Result<Option<DcrClient>> {
        match self.store.get(&Self::dcr_key(server)).await? {
            Some((_, blob)) => Ok(Some(decode_blob(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_client(&self, server: &str) -> Result<()> {
        self.store.delete(&Self::dcr_key(server)).await?;
        Ok(())
    }
}
