//! OAuth orchestration integration tests

use std::sync::Arc;
use std::time::Duration;

use mcprelay_core::{DomainEvent, EventBus, MemoryCredentialStore};
use mcprelay_gateway::oauth::{
    DcrClient, ExternalEvent, ExternalEventKind, LoginFlow, OAuthOrchestrator, RefreshError,
    RefreshLoop, StateManager, TokenRefresher, TokenStore,
};
use tests::{token, token_store, HangingRefresher, RotatingRefresher, StuckRefresher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn orchestrator(
    store: Arc<TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
) -> (
    Arc<OAuthOrchestrator>,
    mpsc::Receiver<mcprelay_gateway::oauth::ReloadRequest>,
    EventBus,
    CancellationToken,
) {
    let (reload_tx, reload_rx) = mpsc::channel(8);
    let bus = EventBus::new();
    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(OAuthOrchestrator::new(
        store,
        refresher,
        bus.sender(),
        reload_tx,
        cancel.clone(),
    ));
    (orchestrator, reload_rx, bus, cancel)
}

#[tokio::test]
async fn test_refresh_storm_single_flight() {
    let store = token_store();
    // Expires in 3 s: inside the 10 s refresh skew, so every caller demands
    store.save_token("github", &token(3)).await.unwrap();

    let refresher = Arc::new(RotatingRefresher::default());
    let (orchestrator, _reload, _bus, cancel) =
        orchestrator(Arc::clone(&store), Arc::clone(&refresher) as _);
    orchestrator.start_loop("github");

    let mut joins = Vec::new();
    for _ in 0..100 {
        let orchestrator = Arc::clone(&orchestrator);
        joins.push(tokio::spawn(async move {
            orchestrator.ensure_valid_token("github").await
        }));
    }

    for join in joins {
        join.await.unwrap().expect("all waiters observe success");
    }
    assert_eq!(refresher.count(), 1, "exactly one refresh for 100 callers");
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_waiter_timeout_fires_at_five_seconds() {
    let store = token_store();
    store.save_token("github", &token(3)).await.unwrap();

    let (orchestrator, _reload, _bus, cancel) =
        orchestrator(Arc::clone(&store), Arc::new(HangingRefresher));
    orchestrator.start_loop("github");

    let started = tokio::time::Instant::now();
    let err = orchestrator.ensure_valid_token("github").await.unwrap_err();
    assert_eq!(err, RefreshError::Timeout);
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_unrotated_token_stops_loop_after_seven_retries() {
    let store = token_store();
    store.save_token("github", &token(3)).await.unwrap();

    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let cancel = CancellationToken::new();
    let handle = RefreshLoop::spawn(
        "github",
        Arc::clone(&store),
        Arc::new(StuckRefresher),
        bus.sender(),
        &cancel,
    );
    handle.inject_external();

    let reason = loop {
        match events.recv().await {
            Some(DomainEvent::OAuthStopped { reason, .. }) => break reason,
            Some(_) => continue,
            None => panic!("event bus closed early"),
        }
    };
    assert_eq!(reason, "token not rotating");

    let err = handle.ensure_valid(&store).await.unwrap_err();
    assert!(matches!(err, RefreshError::Unauthorized(_)));
    cancel.cancel();
}

#[tokio::test]
async fn test_login_success_for_unknown_server_creates_loop_and_reloads() {
    let store = token_store();
    let (orchestrator, mut reload_rx, _bus, cancel) =
        orchestrator(store, Arc::new(RotatingRefresher::default()));

    assert!(!orchestrator.has_loop("newserver"));
    orchestrator
        .route_event(ExternalEvent {
            kind: ExternalEventKind::LoginSuccess,
            provider: "newserver".to_string(),
            message: "oauth login succeeded for newserver".to_string(),
        })
        .await;

    assert!(orchestrator.has_loop("newserver"));
    let request = reload_rx.recv().await.unwrap();
    assert_eq!(request.server, "newserver");
    assert!(!request.remove, "login reloads rather than removes");
    cancel.cancel();
}

#[tokio::test]
async fn test_logout_removes_registrations_and_token() {
    let store = token_store();
    store.save_token("github", &token(3600)).await.unwrap();

    let (orchestrator, mut reload_rx, _bus, cancel) =
        orchestrator(Arc::clone(&store), Arc::new(RotatingRefresher::default()));
    orchestrator.start_loop("github");

    orchestrator
        .route_event(ExternalEvent {
            kind: ExternalEventKind::LogoutSuccess,
            provider: "github".to_string(),
            message: "logout of github complete".to_string(),
        })
        .await;

    assert!(!orchestrator.has_loop("github"));
    assert!(store.load_token("github").await.unwrap().is_none());
    let request = reload_rx.recv().await.unwrap();
    assert!(request.remove);
    cancel.cancel();
}

#[tokio::test]
async fn test_http_refresher_rotates_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("client_id=cid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "rotated",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let store = token_store();
    store
        .save_client(
            "github",
            &DcrClient {
                client_id: "cid".to_string(),
                client_secret: None,
                redirect_uri: "http://127.0.0.1:1/callback".to_string(),
                token_endpoint: format!("{}/token", server.uri()),
            },
        )
        .await
        .unwrap();

    let refresher = mcprelay_gateway::oauth::HttpTokenRefresher::new(Arc::clone(&store));
    let rotated = refresher.refresh("github", &token(3)).await.unwrap();
    assert_eq!(rotated.access_token, "rotated");
    // Response omitted the refresh token; the old one is carried forward
    assert_eq!(rotated.refresh_token.as_deref(), Some("refresh"));
}

#[tokio::test]
async fn test_http_refresher_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let store = token_store();
    store
        .save_client(
            "github",
            &DcrClient {
                client_id: "cid".to_string(),
                client_secret: None,
                redirect_uri: "http://127.0.0.1:1/callback".to_string(),
                token_endpoint: format!("{}/token", server.uri()),
            },
        )
        .await
        .unwrap();

    let refresher = mcprelay_gateway::oauth::HttpTokenRefresher::new(store);
    let err = refresher.refresh("github", &token(3)).await.unwrap_err();
    assert!(err.to_string().contains("unauthorized"));
}

#[tokio::test]
async fn test_code_exchange_consumes_state_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "first-token",
            "token_type": "Bearer",
            "refresh_token": "first-refresh",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let credentials = Arc::new(MemoryCredentialStore::new());
    let store = Arc::new(TokenStore::new(credentials, "https://auth.test"));
    store
        .save_client(
            "notion",
            &DcrClient {
                client_id: "cid".to_string(),
                client_secret: None,
                redirect_uri: "http://127.0.0.1:1/callback".to_string(),
                token_endpoint: format!("{}/token", server.uri()),
            },
        )
        .await
        .unwrap();

    let flow = LoginFlow::new(Arc::clone(&store), Arc::new(StateManager::new()));
    let authorize = flow
        .begin_login("notion", &format!("{}/authorize", server.uri()), &["mcp"])
        .await
        .unwrap();

    let logged_in = flow.exchange_code(&authorize.state, "abc").await.unwrap();
    assert_eq!(logged_in, "notion");
    let stored = store.load_token("notion").await.unwrap().unwrap();
    assert_eq!(stored.access_token, "first-token");

    // The nonce resolves exactly once
    assert!(flow.exchange_code(&authorize.state, "abc").await.is_err());
}
