//! End-to-end scenarios over in-process backends
//!
//! These tests run the full path: reconcile against fixture MCP servers,
//! then drive the exposed handler through a real rmcp client connection.

use std::sync::Arc;

use mcprelay_core::{CapabilityKind, EventBus};
use rmcp::model::CallToolRequestParams;
use rmcp::ServiceExt;

use crate::interceptor::{parse_chain, SecretSet, DEFAULT_CHAIN};
use crate::mcp::{GatewayContext, RelayHandler};
use crate::reconcile::{Reconciler, RegistrationTable};
use crate::telemetry::Metrics;
use crate::test_support::{connect_fixture, pool, snapshot, spec, FixtureBackend};

struct Rig {
    bus: EventBus,
    pool: Arc<crate::pool::ClientPool>,
    reconciler: Reconciler,
    snapshot: mcprelay_core::SharedConfiguration,
}

async fn rig(servers: &[(&str, FixtureBackend)]) -> Rig {
    let bus = EventBus::new();
    let snapshot = snapshot(servers.iter().map(|(name, _)| spec(name)).collect());
    let pool = pool(Arc::clone(&snapshot), bus.sender());
    for (name, backend) in servers {
        connect_fixture(&pool, bus.sender(), name, backend.clone()).await;
    }
    let table = Arc::new(RegistrationTable::new());
    let reconciler = Reconciler::new(table, Arc::clone(&pool), bus.sender());
    Rig {
        bus,
        pool,
        reconciler,
        snapshot,
    }
}

#[tokio::test]
async fn test_cold_start_exposes_and_routes_tools() {
    let rig = rig(&[(
        "search",
        FixtureBackend::with_tools(&["a", "b"]).respond("a", "a-result"),
    )])
    .await;

    let diff = rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();
    assert_eq!(diff.added.len(), 2);

    // Serve the relay and talk to it with a real MCP client
    let secrets = Arc::new(SecretSet::new());
    let metrics = Arc::new(Metrics::new());
    let ctx = Arc::new(GatewayContext {
        table: rig.reconciler.table(),
        pool: Arc::clone(&rig.pool),
        sessions: Arc::new(crate::session::SessionRegistry::new()),
        chain: parse_chain(DEFAULT_CHAIN, &secrets, &metrics, None).unwrap(),
        snapshot: parking_lot::RwLock::new(Arc::clone(&rig.snapshot)),
    });

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let handler = RelayHandler::new(ctx);
    tokio::spawn(async move {
        if let Ok(service) = handler.serve(server_io).await {
            let _ = service.waiting().await;
        }
    });

    let client = ().serve(client_io).await.expect("client handshake");

    let tools = client.list_all_tools().await.unwrap();
    let mut names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
    names.sort();
    assert_eq!(names, ["a", "b"]);

    let result = client
        .call_tool(CallToolRequestParams {
            name: "a".into(),
            arguments: serde_json::json!({ "x": 1 }).as_object().cloned(),
            task: None,
            meta: None,
        })
        .await
        .unwrap();
    let text = serde_json::to_value(&result.content).unwrap();
    assert!(text.to_string().contains("a-result"));

    // Telemetry attributed the forwarded call to its backend
    let stats = metrics.snapshot();
    assert!(stats
        .backends
        .iter()
        .any(|b| b.server == "search" && b.calls == 1 && b.errors == 0));

    let _ = client.cancel().await;
}

#[tokio::test]
async fn test_name_collision_earlier_server_wins() {
    let rig = rig(&[
        ("s1", FixtureBackend::with_tools(&["lookup"]).respond("lookup", "from-s1")),
        ("s2", FixtureBackend::with_tools(&["lookup"])),
    ])
    .await;

    rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();

    let table = rig.reconciler.table();
    assert_eq!(table.len(), 1);
    let registration = table.lookup("lookup").unwrap();
    assert_eq!(registration.server, "s1");
    assert_eq!(registration.kind, CapabilityKind::Tools);
    assert_eq!(registration.upstream_name, "lookup");
}

#[tokio::test]
async fn test_name_collision_across_kinds() {
    // s1 exposes a tool named "notes"; s2 exposes a resource under the
    // same name. Exposed names are unique across the whole mapping, so the
    // earlier backend's tool wins and the resource is dropped.
    let bus = EventBus::new();
    let mut s2 = spec("s2");
    s2.capabilities.resources = true;
    let snapshot = snapshot(vec![spec("s1"), s2]);
    let pool = pool(Arc::clone(&snapshot), bus.sender());
    connect_fixture(&pool, bus.sender(), "s1", FixtureBackend::with_tools(&["notes"])).await;
    connect_fixture(
        &pool,
        bus.sender(),
        "s2",
        FixtureBackend::default().with_resource("notes"),
    )
    .await;

    let reconciler = Reconciler::new(Arc::new(RegistrationTable::new()), pool, bus.sender());
    reconciler.reconcile(&snapshot, None).await.unwrap();

    let table = reconciler.table();
    assert_eq!(table.len(), 1);
    let registration = table.lookup("notes").unwrap();
    assert_eq!(registration.server, "s1");
    assert_eq!(registration.kind, CapabilityKind::Tools);
    assert!(table.list(CapabilityKind::Resources).is_empty());
}

#[tokio::test]
async fn test_reapplying_snapshot_is_idempotent() {
    let rig = rig(&[("s1", FixtureBackend::with_tools(&["a"]))]).await;

    let first = rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();
    assert!(!first.is_empty());

    // Drain events from the first pass, then re-apply
    let mut events = rig.bus.subscribe();
    let second = rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();
    assert!(second.is_empty());
    assert!(
        events.try_recv().is_none(),
        "second application must not notify"
    );
}

#[tokio::test]
async fn test_enable_disable_round_trip() {
    let rig = rig(&[("s1", FixtureBackend::with_tools(&["a", "b"]))]).await;

    rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();
    assert_eq!(rig.reconciler.table().len(), 2);

    // Disable: a snapshot without s1 removes all its registrations
    let empty = snapshot(vec![]);
    let diff = rig.reconciler.reconcile(&empty, None).await.unwrap();
    assert_eq!(diff.removed.len(), 2);
    assert!(rig.reconciler.table().is_empty());
}

#[tokio::test]
async fn test_failed_listing_retains_prior_registrations() {
    let rig = rig(&[("s1", FixtureBackend::with_tools(&["a"]))]).await;
    rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();
    assert_eq!(rig.reconciler.table().len(), 1);

    // Swap in a backend whose tools/list errors; prompts still list fine
    let broken = FixtureBackend {
        fail_tool_listing: true,
        ..FixtureBackend::with_tools(&["a"])
    };
    connect_fixture(&rig.pool, rig.bus.sender(), "s1", broken).await;

    let diff = rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();
    assert!(diff.is_empty(), "failed listing must not drop registrations");
    assert!(rig.reconciler.table().lookup("a").is_some());
}

#[tokio::test]
async fn test_single_server_pass_leaves_others_untouched() {
    let rig = rig(&[
        ("s1", FixtureBackend::with_tools(&["a"])),
        ("s2", FixtureBackend::with_tools(&["b"])),
    ])
    .await;
    rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();

    // s2 grows a tool; a single-server pass for s2 must not re-list s1
    connect_fixture(
        &rig.pool,
        rig.bus.sender(),
        "s2",
        FixtureBackend::with_tools(&["b", "c"]),
    )
    .await;

    let diff = rig
        .reconciler
        .reconcile(&rig.snapshot, Some("s2"))
        .await
        .unwrap();
    assert_eq!(diff.added.len(), 1);
    assert!(diff.removed.is_empty());

    let table = rig.reconciler.table();
    assert!(table.lookup("a").is_some());
    assert!(table.lookup("c").is_some());
}

#[tokio::test]
async fn test_remove_server_drops_registrations() {
    let rig = rig(&[
        ("s1", FixtureBackend::with_tools(&["a"])),
        ("s2", FixtureBackend::with_tools(&["b"])),
    ])
    .await;
    rig.reconciler.reconcile(&rig.snapshot, None).await.unwrap();

    let diff = rig.reconciler.remove_server("s1").await;
    assert_eq!(diff.removed.len(), 1);
    assert!(rig.reconciler.table().lookup("a").is_none());
    assert!(rig.reconciler.table().lookup("b").is_some());

    let mut events = rig.bus.subscribe();
    // Removing again is a no-op and emits nothing
    let again = rig.reconciler.remove_server("s1").await;
    assert!(again.is_empty());
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_allow_list_filters_tools() {
    let bus = EventBus::new();
    let mut filtered = spec("s1");
    filtered.allowed_tools = Some(vec!["keep".to_string()]);
    let snapshot = snapshot(vec![filtered]);
    let pool = pool(Arc::clone(&snapshot), bus.sender());
    connect_fixture(
        &pool,
        bus.sender(),
        "s1",
        FixtureBackend::with_tools(&["keep", "drop"]),
    )
    .await;

    let reconciler = Reconciler::new(Arc::new(RegistrationTable::new()), pool, bus.sender());
    reconciler.reconcile(&snapshot, None).await.unwrap();

    let table = reconciler.table();
    assert!(table.lookup("keep").is_some());
    assert!(table.lookup("drop").is_none());
}

#[tokio::test]
async fn test_server_prefix_policy() {
    let bus = EventBus::new();
    let snapshot = Arc::new(mcprelay_core::Configuration::new(
        vec![spec("s1")],
        Default::default(),
        mcprelay_core::GlobalOptions {
            tool_names: mcprelay_core::ToolNamePolicy::ServerPrefix,
            ..Default::default()
        },
    ));
    let pool = pool(Arc::clone(&snapshot), bus.sender());
    connect_fixture(&pool, bus.sender(), "s1", FixtureBackend::with_tools(&["a"])).await;

    let reconciler = Reconciler::new(Arc::new(RegistrationTable::new()), pool, bus.sender());
    reconciler.reconcile(&snapshot, None).await.unwrap();

    let table = reconciler.table();
    let registration = table.lookup("s1_a").unwrap();
    assert_eq!(registration.upstream_name, "a");

    // Listing advertises the prefixed name
    let descriptor = &table.list(CapabilityKind::Tools)[0];
    assert_eq!(descriptor["name"], "s1_a");
}
