//! Configuration loading and watching

use std::io::Write;
use std::time::Duration;

use mcprelay_core::{load_configuration, Configurator, FileConfigurator};
use tokio_util::sync::CancellationToken;

fn write_file(path: &std::path::Path, content: &str) {
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.sync_all().unwrap();
}

const INITIAL: &str = r#"{
    "servers": {
        "fetch": { "type": "container", "image": "mcp/fetch:latest" },
        "notion": { "type": "remoteHttp", "url": "https://mcp.notion.so/mcp", "oauthProvider": "notion" }
    },
    "secrets": { "fetch": { "api_key": "k3y" } },
    "options": { "oauthEnabled": true }
}"#;

#[test]
fn test_load_full_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcprelay.json");
    write_file(&path, INITIAL);

    let config = load_configuration(&path).unwrap();
    assert_eq!(config.server_names(), ["fetch", "notion"]);
    assert!(config.options().oauth_enabled);
    assert_eq!(config.secret_values(), ["k3y"]);

    let oauth: Vec<_> = config
        .oauth_servers()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    assert_eq!(oauth, ["notion"]);
}

#[tokio::test]
async fn test_watch_publishes_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcprelay.json");
    write_file(&path, INITIAL);

    let cancel = CancellationToken::new();
    let configurator = FileConfigurator::new(&path).with_watch(true);
    let mut handle = configurator.read(cancel.clone()).await.unwrap();
    assert_eq!(handle.snapshot.server_names().len(), 2);

    let mut updates = handle.updates.take().unwrap();

    // Remove one server
    write_file(
        &path,
        r#"{ "servers": { "fetch": { "type": "container", "image": "mcp/fetch:latest" } } }"#,
    );

    let updated = tokio::time::timeout(Duration::from_secs(10), updates.recv())
        .await
        .expect("watcher should publish within the timeout")
        .expect("update stream open");
    assert_eq!(updated.server_names(), ["fetch"]);

    handle.stop();
    cancel.cancel();
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcprelay.json");
    write_file(&path, INITIAL);

    let cancel = CancellationToken::new();
    let configurator = FileConfigurator::new(&path).with_watch(true);
    let mut handle = configurator.read(cancel.clone()).await.unwrap();
    let mut updates = handle.updates.take().unwrap();

    // Broken JSON must not publish a snapshot
    write_file(&path, "{ this is not json");
    let nothing = tokio::time::timeout(Duration::from_secs(2), updates.recv()).await;
    assert!(nothing.is_err(), "malformed reload must be swallowed");

    // A later good write still comes through
    write_file(&path, r#"{ "servers": {} }"#);
    let updated = tokio::time::timeout(Duration::from_secs(10), updates.recv())
        .await
        .expect("recovery reload should publish")
        .expect("update stream open");
    assert!(updated.server_names().is_empty());

    handle.stop();
    cancel.cancel();
}
