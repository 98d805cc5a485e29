#![forbid(unsafe_code)]

use std::time::Duration;

use drift_core::{Delta, DeltaKind, ResourceKey};
use drift_store::spawn_ingest;

fn cm(name: &str, value: &str) -> Delta {
    Delta {
        key: ResourceKey::new("", "ConfigMap", "prod", name),
        kind: DeltaKind::Applied,
        raw: serde_json::json!({ "metadata": { "name": name, "namespace": "prod" }, "data": { "k": value } }),
    }
}

#[tokio::test]
async fn ingest_publishes_snapshots_and_epochs() {
    let (tx, handle) = spawn_ingest(64);
    let mut epochs = handle.subscribe_epoch();
    assert_eq!(handle.current().epoch, 0);

    tx.send(cm("a", "1")).await.expect("send");
    tx.send(cm("b", "1")).await.expect("send");
    tx.send(cm("a", "2")).await.expect("send");

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if handle.current().len() == 2
                && handle.current().get(&ResourceKey::new("", "ConfigMap", "prod", "a")).map(|l| l.object["data"]["k"] == "2").unwrap_or(false)
            {
                break;
            }
            epochs.changed().await.expect("ingest alive");
        }
    })
    .await
    .expect("snapshot converged");
    assert!(handle.current().epoch >= 1);
}

#[tokio::test]
async fn ingest_drains_on_close() {
    let (tx, handle) = spawn_ingest(64);
    let mut epochs = handle.subscribe_epoch();
    tx.send(cm("a", "1")).await.expect("send");
    tx.send(Delta { key: ResourceKey::new("", "ConfigMap", "prod", "a"), kind: DeltaKind::Deleted, raw: serde_json::json!({}) })
        .await
        .expect("send");
    tx.send(cm("c", "1")).await.expect("send");
    drop(tx);

    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.current().get(&ResourceKey::new("", "ConfigMap", "prod", "c")).is_none() {
            if epochs.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("drained");
    let snap = handle.current();
    assert!(snap.get(&ResourceKey::new("", "ConfigMap", "prod", "a")).is_none());
    assert!(snap.get(&ResourceKey::new("", "ConfigMap", "prod", "c")).is_some());
}
