//! Gateway runtime
//!
//! Wires configuration, pool, reconciler, OAuth orchestration, and the
//! exposed MCP server together, then serves one transport until the root
//! context is cancelled. Resources are acquired in startup order (listener,
//! config watcher, telemetry, pool) and released in reverse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use mcprelay_core::{
    Configurator, CredentialStore, EventBus, ServerRuntime, SharedConfiguration,
};
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::ServiceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::interceptor::{parse_chain, SecretSet, DEFAULT_CHAIN};
use crate::mcp::{GatewayContext, RelayHandler};
use crate::oauth::{
    HttpTokenRefresher, NotificationSource, OAuthOrchestrator, ReloadRequest, TokenStore,
};
use crate::pool::ClientPool;
use crate::reconcile::{Reconciler, RegistrationTable};
use crate::runtime::ContainerRuntime;
use crate::session::SessionRegistry;
use crate::telemetry::{Metrics, SHUTDOWN_FLUSH_TIMEOUT};

/// Enables Docker-network auto-join when the gateway runs inside a container.
const IN_CONTAINER_ENV: &str = "DOCKER_MCP_IN_CONTAINER";

/// Transport the exposed server speaks. Modes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Sse,
    StreamableHttp,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streaming" | "streamable-http" => Ok(Self::StreamableHttp),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub transport: TransportMode,
    pub host: String,
    pub port: u16,
    /// Comma-separated interceptor names, applied in order.
    pub interceptors: String,
    /// Auth endpoint namespace for stored OAuth tokens.
    pub auth_endpoint: String,
    /// Short-circuit after the initial reconcile without serving.
    pub dry_run: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::StreamableHttp,
            host: "127.0.0.1".to_string(),
            port: 8811,
            interceptors: DEFAULT_CHAIN.to_string(),
            auth_endpoint: "https://oauth.mcprelay.dev".to_string(),
            dry_run: false,
        }
    }
}

impl GatewayConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

/// The gateway runtime.
pub struct Gateway {
    config: GatewayConfig,
    configurator: Arc<dyn Configurator>,
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<dyn CredentialStore>,
    notifications: Option<Box<dyn NotificationSource + 'static>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        configurator: Arc<dyn Configurator>,
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            configurator,
            runtime,
            credentials,
            notifications: None,
        }
    }

    /// Attach an external OAuth notification source; the event monitor only
    /// runs when one is present.
    pub fn with_notification_source(mut self, source: Box<dyn NotificationSource>) -> Self {
        self.notifications = Some(source);
        self
    }

    /// Run until the root context is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        // Telemetry first so every later step is counted
        let metrics = Arc::new(Metrics::new());

        // Bind the listener before the slower configuration read so clients
        // never see connection refused during startup
        let mut listener = None;
        let mut sse_server = None;
        match self.config.transport {
            TransportMode::Stdio => {}
            TransportMode::StreamableHttp => {
                let addr = self.config.addr()?;
                listener = Some(
                    tokio::net::TcpListener::bind(addr)
                        .await
                        .with_context(|| format!("failed to bind {addr}"))?,
                );
                info!(addr = %addr, "[Gateway] Listener bound");
            }
            TransportMode::Sse => {
                let addr = self.config.addr()?;
                sse_server = Some(
                    SseServer::serve(addr)
                        .await
                        .with_context(|| format!("failed to bind {addr}"))?,
                );
                info!(addr = %addr, "[Gateway] SSE listener bound");
            }
        }

        let mut config_handle = self.configurator.read(cancel.child_token()).await?;
        let snapshot = Arc::clone(&config_handle.snapshot);
        info!(
            servers = snapshot.server_names().len(),
            oauth = snapshot.options().oauth_enabled,
            "[Gateway] Configuration loaded"
        );

        let bus = EventBus::new();
        let events = bus.sender();

        let token_store = Arc::new(TokenStore::new(
            Arc::clone(&self.credentials),
            self.config.auth_endpoint.clone(),
        ));

        let (reload_tx, reload_rx) = mpsc::channel::<ReloadRequest>(16);
        let orchestrator = if snapshot.options().oauth_enabled {
            Some(Arc::new(OAuthOrchestrator::new(
                Arc::clone(&token_store),
                Arc::new(HttpTokenRefresher::new(Arc::clone(&token_store))),
                events.clone(),
                reload_tx,
                cancel.child_token(),
            )))
        } else {
            None
        };

        let pool = Arc::new(ClientPool::new(
            Arc::clone(&snapshot),
            Arc::clone(&self.runtime),
            Arc::clone(&token_store),
            events.clone(),
        ));
        let table = Arc::new(RegistrationTable::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&table),
            Arc::clone(&pool),
            events.clone(),
        ));

        // Interceptor chain, in declared order
        let secrets = Arc::new(SecretSet::new());
        secrets.replace(snapshot.secret_values().iter().map(|s| s.to_string()).collect());
        let chain = parse_chain(
            &self.config.interceptors,
            &secrets,
            &metrics,
            orchestrator.as_ref(),
        )?;
        info!(interceptors = ?chain.names(), "[Gateway] Interceptor chain ready");

        let sessions = Arc::new(SessionRegistry::new());
        let ctx = Arc::new(GatewayContext {
            table,
            pool: Arc::clone(&pool),
            sessions: Arc::clone(&sessions),
            chain,
            snapshot: parking_lot::RwLock::new(Arc::clone(&snapshot)),
        });

        // Image pull + signature verification (skipped in static mode)
        if !snapshot.options().static_mode {
            self.prepare_images(&snapshot).await;
        }

        // Join the gateway's own Docker networks so backends reach mutually
        if std::env::var(IN_CONTAINER_ENV).is_ok() {
            match self.runtime.gateway_networks().await {
                Ok(networks) if !networks.is_empty() => {
                    info!(networks = ?networks, "[Gateway] Joining container networks");
                    pool.set_networks(networks);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "[Gateway] Network detection failed"),
            }
        }

        // Initial full reconcile; per-backend failures are retriable, not fatal
        pool.precreate_long_lived();
        if let Err(e) = reconciler.reconcile(&snapshot, None).await {
            warn!(error = %e, "[Gateway] Initial reconcile failed");
        }

        // OAuth orchestration
        if let Some(orchestrator) = &orchestrator {
            orchestrator.sync_configuration(&snapshot);
            if let Some(source) = self.notifications.take() {
                tokio::spawn(run_monitor(Arc::clone(orchestrator), source));
            }
        }

        // Long-lived consumers
        spawn_event_consumer(
            bus.subscribe(),
            Arc::clone(&ctx),
            Arc::clone(&reconciler),
            cancel.child_token(),
        );
        spawn_reload_consumer(
            reload_rx,
            Arc::clone(&ctx),
            Arc::clone(&reconciler),
            cancel.child_token(),
        );
        if config_handle.updates.is_some() {
            spawn_config_watcher(
                config_handle.updates.take().unwrap(),
                Arc::clone(&ctx),
                Arc::clone(&reconciler),
                orchestrator.clone(),
                Arc::clone(&secrets),
                cancel.child_token(),
            );
        }

        // Telemetry exporter
        let telemetry_cancel = cancel.child_token();
        let exporter = metrics.spawn_exporter(telemetry_cancel.clone());

        if self.config.dry_run {
            info!("[Gateway] Dry run complete, not serving");
            self.shutdown(
                &mut config_handle,
                orchestrator.as_deref(),
                &pool,
                telemetry_cancel,
                exporter,
            )
            .await;
            return Ok(());
        }

        // Serve the selected transport until cancelled
        let serve_result = match self.config.transport {
            TransportMode::Stdio => serve_stdio(Arc::clone(&ctx), cancel.clone()).await,
            TransportMode::StreamableHttp => {
                serve_streamable_http(
                    listener.expect("listener bound for streamable HTTP"),
                    Arc::clone(&ctx),
                    cancel.clone(),
                )
                .await
            }
            TransportMode::Sse => {
                serve_sse(
                    sse_server.expect("SSE server bound"),
                    Arc::clone(&ctx),
                    cancel.clone(),
                )
                .await
            }
        };

        self.shutdown(
            &mut config_handle,
            orchestrator.as_deref(),
            &pool,
            telemetry_cancel,
            exporter,
        )
        .await;
        serve_result
    }

    /// Pull (and optionally verify) every container image in the snapshot.
    async fn prepare_images(&self, snapshot: &SharedConfiguration) {
        for name in snapshot.server_names() {
            let Some((spec, _)) = snapshot.find(name) else {
                continue;
            };
            let ServerRuntime::Container { image, .. } = &spec.runtime else {
                continue;
            };
            if let Err(e) = self.runtime.pull(image).await {
                warn!(server = %name, image = %image, error = %e, "[Gateway] Image pull failed");
                continue;
            }
            if snapshot.options().verify_signatures {
                if let Err(e) = self.runtime.verify(image).await {
                    warn!(server = %name, image = %image, error = %e, "[Gateway] Signature verification failed");
                }
            }
        }
    }

    /// Release resources in reverse acquisition order: pool, telemetry,
    /// config watcher (the listener drops with the serve future).
    async fn shutdown(
        &self,
        config_handle: &mut mcprelay_core::ConfigHandle,
        orchestrator: Option<&OAuthOrchestrator>,
        pool: &ClientPool,
        telemetry_cancel: CancellationToken,
        exporter: tokio::task::JoinHandle<()>,
    ) {
        info!("[Gateway] Shutting down");
        if let Some(orchestrator) = orchestrator {
            orchestrator.shutdown();
        }
        pool.close().await;

        telemetry_cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, exporter)
            .await
            .is_err()
        {
            warn!("[Gateway] Telemetry flush timed out");
        }

        config_handle.stop();
        info!("[Gateway] Shutdown complete");
    }
}

/// Consume domain events: capability changes fan out to sessions, backend
/// list-changed notifications trigger a single-server reconcile.
fn spawn_event_consumer(
    mut receiver: mcprelay_core::EventReceiver,
    ctx: Arc<GatewayContext>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                mcprelay_core::DomainEvent::CapabilitiesChanged { kinds, .. } => {
                    ctx.sessions.notify_capability_changes(&kinds).await;
                }
                mcprelay_core::DomainEvent::BackendListChanged { server, .. } => {
                    let snapshot = ctx.snapshot.read().clone();
                    if let Err(e) = reconciler.reconcile(&snapshot, Some(&server)).await {
                        warn!(server = %server, error = %e, "[Gateway] List-changed reconcile failed");
                    }
                }
                _ => {}
            }
        }
    });
}

/// Consume reload requests from the OAuth orchestrator.
fn spawn_reload_consumer(
    mut reload_rx: mpsc::Receiver<ReloadRequest>,
    ctx: Arc<GatewayContext>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return,
                request = reload_rx.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            };
            if request.remove {
                reconciler.remove_server(&request.server).await;
                continue;
            }
            // Fresh token first, then re-list just this backend
            ctx.pool.invalidate_oauth(&request.server).await;
            let snapshot = ctx.snapshot.read().clone();
            if let Err(e) = reconciler.reconcile(&snapshot, Some(&request.server)).await {
                warn!(server = %request.server, error = %e, "[Gateway] OAuth reload reconcile failed");
            }
        }
    });
}

/// Reconcile on every configuration update.
fn spawn_config_watcher(
    mut updates: mpsc::Receiver<SharedConfiguration>,
    ctx: Arc<GatewayContext>,
    reconciler: Arc<Reconciler>,
    orchestrator: Option<Arc<OAuthOrchestrator>>,
    secrets: Arc<SecretSet>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let snapshot = tokio::select! {
                _ = cancel.cancelled() => return,
                snapshot = updates.recv() => match snapshot {
                    Some(snapshot) => snapshot,
                    None => return,
                },
            };
            info!(
                servers = snapshot.server_names().len(),
                "[Gateway] Applying configuration update"
            );
            secrets.replace(snapshot.secret_values().iter().map(|s| s.to_string()).collect());
            ctx.pool.apply_configuration(Arc::clone(&snapshot)).await;
            if let Some(orchestrator) = &orchestrator {
                orchestrator.sync_configuration(&snapshot);
            }
            *ctx.snapshot.write() = Arc::clone(&snapshot);
            if let Err(e) = reconciler.reconcile(&snapshot, None).await {
                warn!(error = %e, "[Gateway] Reload reconcile failed");
            }
        }
    });
}

async fn run_monitor(orchestrator: Arc<OAuthOrchestrator>, source: Box<dyn NotificationSource>) {
    // Box is consumed by value; the monitor owns the stream
    struct Boxed(Box<dyn NotificationSource>);

    #[async_trait::async_trait]
    impl NotificationSource for Boxed {
        async fn next_record(&mut self) -> anyhow::Result<Option<serde_json::Value>> {
            self.0.next_record().await
        }
    }

    orchestrator.run_monitor(Boxed(source)).await;
}

/// Serve MCP over the process's stdio.
async fn serve_stdio(ctx: Arc<GatewayContext>, cancel: CancellationToken) -> Result<()> {
    info!("[Gateway] Serving on stdio");
    let handler = RelayHandler::new(ctx);
    let service = handler
        .serve(rmcp::transport::stdio())
        .await
        .context("stdio serve failed")?;
    tokio::select! {
        // Dropping the waiting future tears the session down
        _ = cancel.cancelled() => {
            debug!("[Gateway] Stdio serve cancelled");
        }
        reason = service.waiting() => {
            debug!(reason = ?reason, "[Gateway] Stdio session ended");
        }
    }
    Ok(())
}

/// Serve MCP over streamable HTTP (stateful sessions, SSE streams for
/// server-initiated notifications).
async fn serve_streamable_http(
    listener: tokio::net::TcpListener,
    ctx: Arc<GatewayContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let service = StreamableHttpService::new(
        move || Ok(RelayHandler::new(Arc::clone(&ctx))),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig {
            stateful_mode: true,
            sse_keep_alive: Some(Duration::from_secs(30)),
            sse_retry: Some(Duration::from_secs(3)),
            cancellation_token: cancel.child_token(),
        },
    );

    let router = Router::new()
        .nest_service("/mcp", service)
        .layer(TraceLayer::new_for_http());

    info!(addr = ?listener.local_addr().ok(), "[Gateway] Serving streamable HTTP at /mcp");
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("http serve failed")?;
    Ok(())
}

/// Serve MCP over server-sent events.
async fn serve_sse(
    sse_server: SseServer,
    ctx: Arc<GatewayContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let ct = sse_server.with_service(move || RelayHandler::new(Arc::clone(&ctx)));
    info!("[Gateway] Serving SSE at /sse");
    cancel.cancelled().await;
    ct.cancel();
    Ok(())
}
