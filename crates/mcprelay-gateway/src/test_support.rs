//! In-process fixtures for crate tests
//!
//! Backends are real rmcp servers spoken to over `tokio::io::duplex`, so
//! reconcile and routing tests exercise the same client plumbing as
//! production without containers or sockets.

use std::collections::HashMap;
use std::sync::Arc;

use mcprelay_core::{
    CapabilitySet, Configuration, EventSender, GlobalOptions, MemoryCredentialStore, SecretMap,
    ServerRuntime, ServerSpec, SharedConfiguration,
};
use rmcp::model::*;
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, ServiceExt};

use crate::oauth::TokenStore;
use crate::pool::{ClientHandle, ClientPool};
use crate::runtime::{ContainerRuntime, LaunchPlan};

/// Runtime stub for tests that never launch containers.
pub struct NoRuntime;

#[async_trait::async_trait]
impl ContainerRuntime for NoRuntime {
    async fn pull(&self, _image: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn verify(&self, _image: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn gateway_networks(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }

    fn launch_plan(
        &self,
        spec: &ServerSpec,
        _secrets: &SecretMap,
        _networks: &[String],
    ) -> anyhow::Result<LaunchPlan> {
        anyhow::bail!("test runtime cannot launch '{}'", spec.name)
    }
}

/// A scripted upstream MCP server.
#[derive(Clone, Default)]
pub struct FixtureBackend {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    /// Canned responses per tool name.
    pub responses: HashMap<String, String>,
    /// Make tools/list fail, exercising the retention edge case.
    pub fail_tool_listing: bool,
}

impl FixtureBackend {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| tool(n)).collect(),
            ..Default::default()
        }
    }

    pub fn with_resource(mut self, uri: &str) -> Self {
        self.resources.push(resource(uri));
        self
    }

    pub fn respond(mut self, tool: &str, text: &str) -> Self {
        self.responses.insert(tool.to_string(), text.to_string());
        self
    }
}

/// Minimal tool descriptor.
pub fn tool(name: &str) -> Tool {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "description": format!("fixture tool {name}"),
        "inputSchema": { "type": "object" }
    }))
    .expect("valid tool descriptor")
}

/// Minimal resource descriptor.
pub fn resource(uri: &str) -> Resource {
    serde_json::from_value(serde_json::json!({
        "uri": uri,
        "name": format!("fixture resource {uri}"),
    }))
    .expect("valid resource descriptor")
}

impl ServerHandler for FixtureBackend {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "fixture".to_string(),
                version: "0.0.0".to_string(),
                ..Default::default()
            },
            instructions: None,
        }
    }

    async fn list_tools(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        if self.fail_tool_listing {
            return Err(McpError::internal_error("listing disabled", None));
        }
        Ok(ListToolsResult::with_all_items(self.tools.clone()))
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let text = self
            .responses
            .get(params.name.as_ref())
            .cloned()
            .unwrap_or_else(|| format!("{}:{:?}", params.name, params.arguments));
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    async fn list_prompts(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult::with_all_items(self.prompts.clone()))
    }

    async fn list_resources(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult::with_all_items(self.resources.clone()))
    }
}

/// Remote-http spec so the pool never tries to launch anything.
pub fn spec(name: &str) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        runtime: ServerRuntime::RemoteHttp {
            url: format!("https://{name}.test/mcp"),
            headers: HashMap::new(),
        },
        capabilities: CapabilitySet {
            tools: true,
            prompts: true,
            resources: false,
            resource_templates: false,
        },
        secrets: vec![],
        oauth_provider: None,
        allowed_tools: None,
    }
}

pub fn snapshot(specs: Vec<ServerSpec>) -> SharedConfiguration {
    Arc::new(Configuration::new(
        specs,
        HashMap::new(),
        GlobalOptions::default(),
    ))
}

/// Pool with no reachable transports; backends are injected ready.
pub fn pool(snapshot: SharedConfiguration, events: EventSender) -> Arc<ClientPool> {
    let store = Arc::new(TokenStore::new(
        Arc::new(MemoryCredentialStore::new()),
        "https://auth.test",
    ));
    Arc::new(ClientPool::new(snapshot, Arc::new(NoRuntime), store, events))
}

/// Serve `backend` in-process and register a ready handle for it.
pub async fn connect_fixture(
    pool: &Arc<ClientPool>,
    events: EventSender,
    server: &str,
    backend: FixtureBackend,
) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        if let Ok(service) = backend.serve(server_io).await {
            let _ = service.waiting().await;
        }
    });

    let handle = Arc::new(ClientHandle::new(server, events));
    let client = handle
        .handler()
        .serve(client_io)
        .await
        .expect("fixture handshake");
    handle.mark_ready(client).await;
    pool.insert_handle(handle);
}
