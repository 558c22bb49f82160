//! Gateway component integration tests

use std::sync::Arc;

use mcprelay_core::CapabilityKind;
use mcprelay_gateway::interceptor::{
    parse_chain, CallContext, InterceptError, SecretSet, DEFAULT_CHAIN,
};
use mcprelay_gateway::oauth::{OAuthOrchestrator, RefreshError};
use mcprelay_gateway::reconcile::{Registration, RegistrationTable};
use mcprelay_gateway::telemetry::Metrics;
use mcprelay_gateway::SessionRegistry;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn registration(server: &str, kind: CapabilityKind, name: &str) -> (String, Registration) {
    (
        name.to_string(),
        Registration {
            server: server.to_string(),
            kind,
            upstream_name: name.to_string(),
            descriptor: serde_json::json!({ "name": name }),
        },
    )
}

#[test]
fn test_registration_table_unique_exposed_names() {
    let table = RegistrationTable::new();
    let (key, first) = registration("s1", CapabilityKind::Tools, "lookup");
    // Same exposed name from another backend under a different kind:
    // uniqueness holds across the whole mapping, not per kind
    let (_, second) = registration("s2", CapabilityKind::Resources, "lookup");

    table.apply(&[(key.clone(), first)], &[]);
    table.apply(&[(key.clone(), second)], &[]);

    assert_eq!(table.len(), 1);
    let kept = table.lookup("lookup").unwrap();
    assert_eq!(kept.server, "s2");
    assert_eq!(kept.kind, CapabilityKind::Resources);
    assert!(table.list(CapabilityKind::Tools).is_empty());
}

#[tokio::test]
async fn test_chain_redacts_secrets_from_responses() {
    let secrets = Arc::new(SecretSet::new());
    secrets.replace(vec!["s3cret-value".to_string()]);
    let metrics = Arc::new(Metrics::new());
    let chain = parse_chain(DEFAULT_CHAIN, &secrets, &metrics, None).unwrap();

    let ctx = CallContext::new("tools/call", "lookup").with_route("github", None);
    chain.before(&ctx, &serde_json::Value::Null).await.unwrap();

    let mut outcome = Ok(serde_json::json!({
        "content": [{ "type": "text", "text": "leaked s3cret-value here" }]
    }));
    chain.after(&ctx, &mut outcome).await;

    assert_eq!(
        outcome.unwrap()["content"][0]["text"],
        "leaked *** here"
    );
    assert_eq!(metrics.snapshot().calls, 1);
}

#[tokio::test]
async fn test_oauth_preflight_blocks_stopped_provider() {
    let (reload_tx, _reload_rx) = mpsc::channel(1);
    let orchestrator = Arc::new(OAuthOrchestrator::new(
        tests::token_store(),
        Arc::new(tests::RotatingRefresher::default()),
        mcprelay_core::EventBus::new().sender(),
        reload_tx,
        CancellationToken::new(),
    ));

    // No loop for this provider: demand is unauthorized
    let err = orchestrator.ensure_valid_token("gone").await.unwrap_err();
    assert!(matches!(err, RefreshError::Unauthorized(_)));

    let secrets = Arc::new(SecretSet::new());
    let metrics = Arc::new(Metrics::new());
    let chain = parse_chain(DEFAULT_CHAIN, &secrets, &metrics, Some(&orchestrator)).unwrap();

    let ctx = CallContext::new("tools/call", "lookup").with_route("backend", Some("gone"));
    let err = chain.before(&ctx, &serde_json::Value::Null).await.unwrap_err();
    assert!(matches!(err, InterceptError::Unauthorized(_)));

    // Only tool calls are gated; prompt and resource reads pass untouched
    let ctx = CallContext::new("prompts/get", "greet").with_route("backend", Some("gone"));
    assert!(chain.before(&ctx, &serde_json::Value::Null).await.is_ok());
    let ctx = CallContext::new("resources/read", "file:///x").with_route("backend", Some("gone"));
    assert!(chain.before(&ctx, &serde_json::Value::Null).await.is_ok());
}

#[test]
fn test_session_registry_lifecycle() {
    let sessions = SessionRegistry::new();
    sessions.subscribe("sess-1", "file:///notes.txt");
    sessions.update("sess-1", |cache| {
        cache.roots = Some(vec![]);
    });

    let cache = sessions.get_session_cache("sess-1");
    assert!(cache.subscriptions.contains("file:///notes.txt"));
    assert_eq!(cache.roots.map(|r| r.len()), Some(0));

    sessions.remove_session_cache("sess-1");
    assert_eq!(sessions.session_count(), 0);
}
