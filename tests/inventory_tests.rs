//! Inventory store tests for Broker
//!
//! Exercises the persisted inventory file directly:
//! - Loading tolerant of bad entries
//! - Lock-protected concurrent mutation
//! - Provider sync merging

use std::sync::Arc;
use std::time::Duration;

use broker::inventory::{HostRecord, InventoryError, InventoryLock, InventoryStore};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn store(dir: &TempDir) -> InventoryStore {
    InventoryStore::new(dir.path().join("inventory.yaml"), Duration::from_secs(5))
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_missing_file_is_empty_inventory() {
    let dir = TempDir::new().unwrap();
    assert!(store(&dir).load().unwrap().is_empty());
}

#[test]
fn test_bad_entries_are_discarded() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    std::fs::write(
        store.path(),
        r#"
- hostname: a.example.com
  _broker_provider: TestProvider
- just a string
- {cpus: 4}
- hostname: a.example.com
- name: b-container
"#,
    )
    .unwrap();

    let hosts = store.load().unwrap();
    let ids: Vec<&str> = hosts.iter().map(HostRecord::identity).collect();
    assert_eq!(ids, vec!["a.example.com", "b-container"]);
    assert_eq!(hosts[0].provider.as_deref(), Some("TestProvider"));
}

#[test]
fn test_non_sequence_is_malformed() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    std::fs::write(store.path(), "hosts: {}\n").unwrap();
    assert!(matches!(
        store.load(),
        Err(InventoryError::Malformed { .. })
    ));
}

#[test]
fn test_save_round_trips_attributes() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let host = HostRecord::new("a.example.com")
        .with_provider("TestProvider", Some("lab".into()))
        .with_attribute("os", json!({"family": "rhel"}));
    store.save(std::slice::from_ref(&host)).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded, vec![host]);
    let text = std::fs::read_to_string(store.path()).unwrap();
    assert!(text.contains("_broker_provider_instance: lab"));
}

// ============================================================================
// Mutation
// ============================================================================

#[tokio::test]
async fn test_add_merges_by_identity_and_remove() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store
        .add(vec![
            HostRecord::new("a.example.com").with_attribute("cpus", json!(2)),
            HostRecord::new("b.example.com"),
        ])
        .await
        .unwrap();
    store
        .add(vec![HostRecord::new("a.example.com").with_attribute("memory", json!("4G"))])
        .await
        .unwrap();

    let hosts = store.load().unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0].attribute("cpus"), Some(&json!(2)));
    assert_eq!(hosts[0].attribute("memory"), Some(&json!("4G")));

    let removed = store.remove(&["b.example.com".to_string()]).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(store.load().unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_writers_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("inventory.yaml");

    // Separate stores share only the file lock
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::new(InventoryStore::new(path.clone(), Duration::from_secs(10)));
            tokio::spawn(async move {
                store
                    .add(vec![HostRecord::new(format!("host{i}.example.com"))])
                    .await
            })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }

    let hosts = InventoryStore::new(path, Duration::from_secs(1)).load().unwrap();
    assert_eq!(hosts.len(), 16);
}

#[tokio::test]
async fn test_lock_timeout() {
    let dir = TempDir::new().unwrap();
    let store = InventoryStore::new(dir.path().join("inventory.yaml"), Duration::from_millis(200));
    let _held = InventoryLock::acquire(store.path(), Duration::from_secs(1))
        .await
        .unwrap();

    let err = store.add(vec![HostRecord::new("late.example.com")]).await.unwrap_err();
    assert!(matches!(err, InventoryError::LockTimeout { .. }));
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test]
async fn test_sync_merges_reported_hosts() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store
        .add(vec![
            HostRecord::new("kept.example.com")
                .with_provider("TestProvider", None)
                .with_attribute("note", json!("local only")),
            HostRecord::new("gone.example.com").with_provider("TestProvider", None),
            HostRecord::new("other.example.com").with_provider("Container", None),
        ])
        .await
        .unwrap();

    let reported = vec![
        HostRecord::new("kept.example.com").with_attribute("status", json!("running")),
        HostRecord::new("new.example.com"),
    ];
    let summary = store
        .sync("TestProvider", None, reported, false)
        .await
        .unwrap();
    assert_eq!(summary.added, vec!["new.example.com"]);
    assert_eq!(summary.updated, vec!["kept.example.com"]);
    assert_eq!(summary.removed, vec!["gone.example.com"]);

    let hosts = store.load().unwrap();
    let kept = hosts.iter().find(|h| h.identity() == "kept.example.com").unwrap();
    assert_eq!(kept.attribute("note"), Some(&json!("local only")));
    assert_eq!(kept.attribute("status"), Some(&json!("running")));
    assert!(hosts.iter().any(|h| h.identity() == "other.example.com"));
    let added = hosts.iter().find(|h| h.identity() == "new.example.com").unwrap();
    assert_eq!(added.provider.as_deref(), Some("TestProvider"));
}
