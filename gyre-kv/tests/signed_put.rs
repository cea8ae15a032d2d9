//! Signed-put acceptance over a live in-process ring.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use gyre_kv::predicate::{Ed25519Predicate, sign_put};
use gyre_kv::{KvConfig, KvError, KvStore};
use gyre_overlay::raw::memory::MemoryHub;
use gyre_overlay::{ConnectTarget, Key, Node, NodeConfig};

async fn build_ring(hub: &Arc<MemoryHub>, n: usize) -> Vec<(Arc<Node>, Arc<KvStore>)> {
    let mut out = Vec::new();
    for i in 0..n {
        let url = format!("mem://kv{i}");
        let config = NodeConfig {
            node_id: Some(format!("node-kv{i}")),
            my_url: Some(url.clone()),
            ..NodeConfig::for_tests()
        };
        let (node, _events) = Node::new(config, hub.clone(), None);
        hub.serve(&node, &url);
        let store = KvStore::register(&node, KvConfig::default(), Arc::new(Ed25519Predicate));
        let introducer = if i == 0 {
            None
        } else {
            Some(ConnectTarget::Url("mem://kv0".to_string()))
        };
        node.add_key(Key::from(format!("{i}").as_str()), introducer)
            .await
            .unwrap_or_else(|e| panic!("node {i} failed to join: {e}"));
        out.push((node, store));
    }
    out
}

#[tokio::test]
async fn signed_put_protects_against_overwrites() {
    let hub = MemoryHub::new();
    let ring = build_ring(&hub, 3).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut rng = rand::thread_rng();
    let owner = ed25519_dalek::SigningKey::generate(&mut rng);
    let stranger = ed25519_dalek::SigningKey::generate(&mut rng);

    let (node, store) = &ring[1];
    let hello = Value::String("Hello".to_string());

    // Signed put lands.
    let proof = sign_put(&owner, "000", &hello);
    store
        .put(node, "000", hello.clone(), Some(proof))
        .await
        .expect("signed put");

    // A different signature is a verification failure.
    let forged = sign_put(&stranger, "000", &hello);
    let err = store
        .put(node, "000", hello.clone(), Some(forged))
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::VerifyError), "got {err:?}");

    // No signature at all may not overwrite an owned key.
    let err = store
        .put(node, "000", Value::String("Hijack".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::OverwriteForbidden), "got {err:?}");

    // The value is unchanged and readable from any member.
    for (node, store) in &ring {
        let values = store.get(node, "000").await.expect("get");
        assert_eq!(values, vec![hello.clone()]);
    }

    for (node, _) in &ring {
        node.destroy();
    }
}

#[tokio::test]
async fn puts_replicate_to_the_successor() {
    let hub = MemoryHub::new();
    let ring = build_ring(&hub, 3).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // "000" is owned by node 0 (keys "0" < "000" < "1"); its successor
    // is node 1.
    let (node, store) = &ring[2];
    store
        .put(node, "000", json!({"v": 1}), None)
        .await
        .expect("put");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        ring[1].1.replica_keys().contains(&"000".to_string()),
        "successor should hold a replica"
    );

    for (node, _) in &ring {
        node.destroy();
    }
}
