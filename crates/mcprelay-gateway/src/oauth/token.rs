//! OAuth token model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Seconds before expiry at which a token counts as near-expired and the
/// refresh loop wakes.
pub const EXPIRY_SKEW_SECS: i64 = 10;

/// A stored OAuth token set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Access token for API calls
    pub access_token: String,

    /// Token type (usually "Bearer")
    pub token_type: String,

    /// Refresh token for getting new access tokens
    pub refresh_token: Option<String>,

    /// Token expiry time
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted
    #[serde(default)]
    pub scope: Option<String>,
}

/// Token endpoint response shape.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
}

impl From<TokenResponse> for OAuthToken {
    fn from(response: TokenResponse) -> Self {
        let expires_at = response
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        Self {
            access_token: response.access_token,
            token_type: response.token_type,
            refresh_token: response.refresh_token,
            expires_at,
            scope: response.scope,
        }
    }
}

impl OAuthToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() >= expires_at,
            None => false, // No expiry = never expires
        }
    }

    /// True within `EXPIRY_SKEW_SECS` of expiry.
    pub fn near_expiry(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) >= expires_at,
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}
