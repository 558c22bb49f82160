//! Streamable HTTP transport for remote backends

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ServiceExt;
use tracing::info;

use super::super::handle::{RelayClientHandler, UpstreamClient};

/// Connect to a remote MCP endpoint over streamable HTTP.
///
/// The bearer token, when present, is injected as a default header; token
/// refresh is the OAuth orchestrator's job, so an expired token here simply
/// fails the connect and the handle is rebuilt on the next `get`.
pub async fn connect_http(
    server: &str,
    url: &str,
    headers: &HashMap<String, String>,
    bearer: Option<&str>,
    handler: RelayClientHandler,
    timeout: Duration,
) -> Result<UpstreamClient> {
    info!(server = %server, url = %url, "[Pool] Connecting to remote backend");

    let mut default_headers = HeaderMap::new();
    for (name, value) in headers {
        let name: HeaderName = name
            .parse()
            .with_context(|| format!("invalid header name '{name}' for backend '{server}'"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for backend '{server}'"))?;
        default_headers.insert(name, value);
    }
    if let Some(token) = bearer {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("bearer token is not a valid header value")?;
        value.set_sensitive(true);
        default_headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
        .default_headers(default_headers)
        .build()
        .context("failed to build HTTP client")?;

    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig {
            uri: url.to_string().into(),
            ..Default::default()
        },
    );

    let client = tokio::time::timeout(timeout, handler.serve(transport))
        .await
        .map_err(|_| anyhow!("initialize timeout after {timeout:?} for backend '{server}'"))?
        .with_context(|| format!("MCP handshake failed for backend '{server}'"))?;

    info!(server = %server, "[Pool] Remote backend connected");
    Ok(client)
}
