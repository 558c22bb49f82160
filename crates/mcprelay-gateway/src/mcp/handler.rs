//! Relay MCP handler
//!
//! Routes inbound MCP requests: registration-table lookup, interceptor
//! chain, pool borrow, forward, release. Responses flow back through the
//! chain's `after` hooks (redaction, telemetry).

use std::sync::Arc;

use mcprelay_core::{CapabilityKind, SharedConfiguration};
use parking_lot::RwLock;
use rmcp::{
    model::*,
    service::{NotificationContext, RequestContext},
    ErrorData as McpError, RoleServer, ServerHandler,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::interceptor::{CallContext, InterceptError, InterceptorChain};
use crate::pool::ClientPool;
use crate::reconcile::{Registration, RegistrationTable};
use crate::session::SessionRegistry;

/// Shared state behind every handler instance.
pub struct GatewayContext {
    pub table: Arc<RegistrationTable>,
    pub pool: Arc<ClientPool>,
    pub sessions: Arc<SessionRegistry>,
    pub chain: InterceptorChain,
    /// Current snapshot, replaced atomically on reload.
    pub snapshot: RwLock<SharedConfiguration>,
}

impl GatewayContext {
    fn oauth_provider_for(&self, server: &str) -> Option<String> {
        let snapshot = self.snapshot.read();
        snapshot
            .find(server)
            .and_then(|(spec, _)| spec.oauth_provider.clone())
    }
}

/// One handler instance per client session.
#[derive(Clone)]
pub struct RelayHandler {
    ctx: Arc<GatewayContext>,
    session_id: String,
}

impl RelayHandler {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Table lookup, with a protocol error for unknown or mismatched names.
    fn route(&self, kind: CapabilityKind, exposed: &str) -> Result<Registration, McpError> {
        let registration = self.ctx.table.lookup(exposed).ok_or_else(|| {
            McpError::invalid_params(format!("unknown {}: '{}'", kind, exposed), None)
        })?;
        if registration.kind != kind {
            return Err(McpError::invalid_params(
                format!("'{}' is a {}, not a {}", exposed, registration.kind, kind),
                None,
            ));
        }
        Ok(registration)
    }

    fn intercept_error(error: InterceptError) -> McpError {
        match error {
            InterceptError::Unauthorized(message) => {
                McpError::new(ErrorCode::INVALID_REQUEST, message, None)
            }
            InterceptError::Other(message) => McpError::internal_error(message, None),
        }
    }

    /// Run one forwarded call through the interceptor chain.
    ///
    /// `forward` performs the upstream call and returns the raw response as
    /// JSON so the chain's `after` hooks can inspect and rewrite it.
    async fn intercepted<F, Fut>(
        &self,
        call_ctx: CallContext,
        args: serde_json::Value,
        forward: F,
    ) -> Result<serde_json::Value, McpError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>>,
    {
        self.ctx
            .chain
            .before(&call_ctx, &args)
            .await
            .map_err(Self::intercept_error)?;

        let mut outcome = forward().await;
        self.ctx.chain.after(&call_ctx, &mut outcome).await;

        outcome.map_err(|message| McpError::internal_error(message, None))
    }

    /// Borrow the backend, run `operation` against its peer, release.
    async fn with_backend<T, F, Fut>(&self, server: &str, operation: F) -> Result<T, String>
    where
        F: FnOnce(rmcp::service::Peer<rmcp::RoleClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T, rmcp::ServiceError>>,
    {
        let handle = self
            .ctx
            .pool
            .get(server)
            .await
            .map_err(|e| format!("backend '{server}' unavailable: {e}"))?;
        let peer = match handle.peer().await {
            Some(peer) => peer,
            None => {
                self.ctx.pool.release(&handle);
                return Err(format!("backend '{server}' lost its connection"));
            }
        };
        let result = operation(peer).await;
        self.ctx.pool.release(&handle);
        result.map_err(|e| e.to_string())
    }

    /// List one capability kind through the interceptor chain.
    async fn intercepted_list<T: serde::de::DeserializeOwned>(
        &self,
        method: &'static str,
        kind: CapabilityKind,
    ) -> Result<Vec<T>, McpError> {
        let value = self
            .intercepted(
                CallContext::new(method, "*"),
                serde_json::Value::Null,
                || async {
                    serde_json::to_value(self.ctx.table.list(kind))
                        .map_err(|e| format!("listing encoding: {e}"))
                },
            )
            .await?;
        let descriptors: Vec<serde_json::Value> = serde_json::from_value(value)
            .map_err(|e| McpError::internal_error(format!("listing decoding: {e}"), None))?;
        Ok(descriptors
            .into_iter()
            .filter_map(|d| serde_json::from_value(d).ok())
            .collect())
    }
}

impl ServerHandler for RelayHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools_with(ToolsCapability {
                    list_changed: Some(true),
                })
                .enable_prompts_with(PromptsCapability {
                    list_changed: Some(true),
                })
                .enable_resources_with(ResourcesCapability {
                    subscribe: Some(true),
                    list_changed: Some(true),
                })
                .build(),
            server_info: Implementation {
                name: "mcprelay".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "mcprelay aggregates multiple MCP servers behind one endpoint. \
                 Tools, prompts, and resources are routed to their backends."
                    .to_string(),
            ),
        }
    }

    async fn initialize(
        &self,
        params: InitializeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        info!(
            session = %self.session_id,
            client = %params.client_info.name,
            version = %params.client_info.version,
            "[MCP] Client initializing"
        );
        self.ctx.sessions.update(&self.session_id, |cache| {
            cache.client_info = Some(params.client_info.clone());
        });
        let info = self.get_info();
        Ok(InitializeResult {
            protocol_version: info.protocol_version,
            capabilities: info.capabilities,
            server_info: info.server_info,
            instructions: info.instructions,
        })
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        self.ctx
            .sessions
            .register_peer(&self.session_id, context.peer);
        debug!(session = %self.session_id, "[MCP] Session peer registered");
    }

    async fn list_tools(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools: Vec<Tool> = self
            .intercepted_list("tools/list", CapabilityKind::Tools)
            .await?;
        debug!(count = tools.len(), "[MCP] list_tools");
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let registration = self.route(CapabilityKind::Tools, &params.name)?;
        let call_ctx = CallContext::new("tools/call", params.name.to_string()).with_route(
            &registration.server,
            self.ctx
                .oauth_provider_for(&registration.server)
                .as_deref(),
        );
        let args = serde_json::to_value(params.arguments.clone()).unwrap_or_default();

        let value = self
            .intercepted(call_ctx, args, || async {
                self.with_backend(&registration.server, |peer| async move {
                    peer.call_tool(CallToolRequestParams {
                        name: registration.upstream_name.clone().into(),
                        arguments: params.arguments,
                        task: None,
                        meta: None,
                    })
                    .await
                })
                .await
                .and_then(|result| {
                    serde_json::to_value(result).map_err(|e| format!("response encoding: {e}"))
                })
            })
            .await?;

        serde_json::from_value(value)
            .map_err(|e| McpError::internal_error(format!("response decoding: {e}"), None))
    }

    async fn list_prompts(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let prompts: Vec<Prompt> = self
            .intercepted_list("prompts/list", CapabilityKind::Prompts)
            .await?;
        debug!(count = prompts.len(), "[MCP] list_prompts");
        Ok(ListPromptsResult::with_all_items(prompts))
    }

    async fn get_prompt(
        &self,
        params: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let registration = self.route(CapabilityKind::Prompts, &params.name)?;
        // OAuth preflight is scoped to tool calls; no provider binding here
        let call_ctx =
            CallContext::new("prompts/get", params.name.clone()).with_route(&registration.server, None);
        let args = serde_json::to_value(params.arguments.clone()).unwrap_or_default();

        let value = self
            .intercepted(call_ctx, args, || async {
                self.with_backend(&registration.server, |peer| async move {
                    peer.get_prompt(GetPromptRequestParams {
                        name: registration.upstream_name.clone().into(),
                        arguments: params.arguments,
                        meta: None,
                    })
                    .await
                })
                .await
                .and_then(|result| {
                    serde_json::to_value(result).map_err(|e| format!("response encoding: {e}"))
                })
            })
            .await?;

        serde_json::from_value(value)
            .map_err(|e| McpError::internal_error(format!("response decoding: {e}"), None))
    }

    async fn list_resources(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let resources: Vec<Resource> = self
            .intercepted_list("resources/list", CapabilityKind::Resources)
            .await?;
        debug!(count = resources.len(), "[MCP] list_resources");
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn list_resource_templates(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let templates: Vec<ResourceTemplate> = self
            .intercepted_list("resources/templates/list", CapabilityKind::ResourceTemplates)
            .await?;
        Ok(ListResourceTemplatesResult::with_all_items(templates))
    }

    async fn read_resource(
        &self,
        params: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let registration = self.route(CapabilityKind::Resources, &params.uri)?;
        // OAuth preflight is scoped to tool calls; no provider binding here
        let call_ctx =
            CallContext::new("resources/read", params.uri.clone()).with_route(&registration.server, None);

        let value = self
            .intercepted(call_ctx, serde_json::Value::Null, || async {
                self.with_backend(&registration.server, |peer| async move {
                    peer.read_resource(ReadResourceRequestParams {
                        uri: registration.upstream_name.clone().into(),
                        meta: None,
                    })
                    .await
                })
                .await
                .and_then(|result| {
                    serde_json::to_value(result).map_err(|e| format!("response encoding: {e}"))
                })
            })
            .await?;

        serde_json::from_value(value)
            .map_err(|e| McpError::internal_error(format!("response decoding: {e}"), None))
    }

    async fn subscribe(
        &self,
        params: SubscribeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        // Session bookkeeping only; subscription delivery is tracked by the
        // MCP SDK, no upstream fan-out
        self.ctx.sessions.subscribe(&self.session_id, &params.uri);
        debug!(session = %self.session_id, uri = %params.uri, "[MCP] subscribe");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        params: UnsubscribeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        self.ctx.sessions.unsubscribe(&self.session_id, &params.uri);
        debug!(session = %self.session_id, uri = %params.uri, "[MCP] unsubscribe");
        Ok(())
    }

    fn on_roots_list_changed(
        &self,
        _context: NotificationContext<RoleServer>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let handler = self.clone();
        async move {
            // Query the session's current roots and fan out to upstreams
            match handler.ctx.sessions.list_roots(&handler.session_id).await {
                Some(roots) => {
                    info!(
                        session = %handler.session_id,
                        roots = roots.len(),
                        "[MCP] Propagating updated roots"
                    );
                    handler.ctx.pool.update_roots(roots).await;
                }
                None => {
                    warn!(session = %handler.session_id, "[MCP] roots/list query failed");
                }
            }
        }
    }
}
