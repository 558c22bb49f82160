//! Authorization-code flow helpers
//!
//! The interactive login itself is driven externally (CLI / browser); the
//! gateway's part is building the authorization URL, holding the PKCE
//! verifier until the code comes back, and exchanging the code for tokens.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use super::state::{PkcePair, StateManager};
use super::store::TokenStore;
use super::token::OAuthToken;

/// Fixed local callback port, when pinned via environment.
const CALLBACK_PORT_ENV: &str = "MCP_GATEWAY_OAUTH_PORT";

/// Bitly access token enabling URL shortening for OAuth flows.
const BITLY_TOKEN_ENV: &str = "BITLY_ACCESS_TOKEN";

/// The port the local OAuth callback listener should bind; `None` lets the
/// OS pick one.
pub fn callback_port() -> Option<u16> {
    std::env::var(CALLBACK_PORT_ENV).ok()?.parse().ok()
}

/// Shorten an authorization URL through Bitly when a token is configured;
/// any failure falls back to the original URL.
pub async fn shorten_url(url: &str) -> String {
    let Ok(token) = std::env::var(BITLY_TOKEN_ENV) else {
        return url.to_string();
    };

    #[derive(serde::Deserialize)]
    struct Shortened {
        link: String,
    }

    let response = reqwest::Client::new()
        .post("https://api-ssl.bitly.com/v4/shorten")
        .bearer_auth(token)
        .json(&serde_json::json!({ "long_url": url }))
        .send()
        .await;

    match response {
        Ok(r) if r.status().is_success() => match r.json::<Shortened>().await {
            Ok(s) => s.link,
            Err(_) => url.to_string(),
        },
        _ => {
            debug!("[OAuth] URL shortening failed, using full URL");
            url.to_string()
        }
    }
}

/// A ready-to-open authorization URL and its state nonce.
#[derive(Debug, Clone)]
pub struct AuthorizeUrl {
    pub url: String,
    pub state: String,
}

/// Builds authorization URLs and exchanges returned codes.
pub struct LoginFlow {
    store: Arc<TokenStore>,
    states: Arc<StateManager>,
    http: reqwest::Client,
}

impl LoginFlow {
    pub fn new(store: Arc<TokenStore>, states: Arc<StateManager>) -> Self {
        Self {
            store,
            states,
            http: reqwest::Client::new(),
        }
    }

    /// Build the PKCE-protected authorization URL for a server. Registers
    /// the verifier under a fresh nonce consumed by `exchange_code`.
    pub async fn begin_login(
        &self,
        server: &str,
        authorize_endpoint: &str,
        scopes: &[&str],
    ) -> Result<AuthorizeUrl> {
        let client = self
            .store
            .load_client(server)
            .await?
            .ok_or_else(|| anyhow!("no client registration for '{server}'"))?;

        let pkce = PkcePair::generate();
        let nonce = self.states.begin(server, &pkce.verifier);

        let mut url = url::Url::parse(authorize_endpoint)
            .with_context(|| format!("invalid authorize endpoint for '{server}'"))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", &client.redirect_uri)
            .append_pair("state", &nonce)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");
        if !scopes.is_empty() {
            url.query_pairs_mut()
                .append_pair("scope", &scopes.join(" "));
        }

        // Shortened only when a Bitly token is configured
        let url = shorten_url(url.as_str()).await;

        Ok(AuthorizeUrl {
            url,
            state: nonce,
        })
    }

    /// Exchange an authorization code for tokens. The state nonce resolves
    /// exactly once; replays fail.
    pub async fn exchange_code(&self, state: &str, code: &str) -> Result<String> {
        let pending = self
            .states
            .consume(state)
            .ok_or_else(|| anyhow!("unknown or already-used authorization state"))?;

        let client = self
            .store
            .load_client(&pending.server)
            .await?
            .ok_or_else(|| anyhow!("no client registration for '{}'", pending.server))?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", client.redirect_uri.clone()),
            ("client_id", client.client_id.clone()),
            ("code_verifier", pending.verifier.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&client.token_endpoint)
            .form(&form)
            .send()
            .await
            .context("token endpoint unreachable")?;
        if !response.status().is_success() {
            anyhow::bail!("code exchange failed with {}", response.status());
        }

        let parsed: super::token::TokenResponse = response.json().await?;
        let token: OAuthToken = parsed.into();
        self.store.save_token(&pending.server, &token).await?;

        info!(server = %pending.server, "[OAuth] Authorization code exchanged");
        Ok(pending.server)
    }
}
