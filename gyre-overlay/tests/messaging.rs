//! Unicast and range-query behavior over a live in-process ring.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;

use gyre_overlay::raw::memory::MemoryHub;
use gyre_overlay::ring::rq::RqEvent;
use gyre_overlay::{AppHandler, ConnectTarget, Delivery, Key, Node, NodeConfig};

/// Records every delivery; replies `"TEST{key}"` only when it owns the
/// fragment start (unicast targets always do).
struct RecordingApp {
    received: Mutex<Vec<(Key, Value)>>,
}

impl RecordingApp {
    fn new() -> Arc<Self> {
        Arc::new(RecordingApp {
            received: Mutex::new(Vec::new()),
        })
    }

    fn deliveries(&self) -> Vec<(Key, Value)> {
        self.received.lock().unwrap().clone()
    }
}

impl AppHandler for RecordingApp {
    fn on_receive(&self, _node: &Arc<Node>, delivery: Delivery) -> Option<Value> {
        self.received
            .lock()
            .unwrap()
            .push((delivery.local_key.clone(), delivery.data.clone()));
        if delivery.from == delivery.local_key {
            Some(Value::String(format!("TEST{}", delivery.local_key)))
        } else {
            None
        }
    }
}

async fn build_ring(hub: &Arc<MemoryHub>, n: usize) -> (Vec<Arc<Node>>, Vec<Arc<RecordingApp>>) {
    let mut nodes = Vec::new();
    let mut apps = Vec::new();
    for i in 0..n {
        let url = format!("mem://n{i}");
        let config = NodeConfig {
            node_id: Some(format!("node-n{i}")),
            my_url: Some(url.clone()),
            ..NodeConfig::for_tests()
        };
        let (node, _events) = Node::new(config, hub.clone(), None);
        hub.serve(&node, &url);
        let app = RecordingApp::new();
        node.register_app("probe", app.clone());
        let introducer = if i == 0 {
            None
        } else {
            Some(ConnectTarget::Url("mem://n0".to_string()))
        };
        node.add_key(Key::from(format!("{i}").as_str()), introducer)
            .await
            .unwrap_or_else(|e| panic!("node {i} failed to join: {e}"));
        nodes.push(node);
        apps.push(app);
    }
    (nodes, apps)
}

#[tokio::test]
async fn unicast_reaches_only_the_responsible_node() {
    let hub = MemoryHub::new();
    let (nodes, apps) = build_ring(&hub, 5).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reply = nodes[0]
        .unicast(Key::from("3"), "probe", json!("x"))
        .await
        .expect("unicast");
    assert_eq!(reply, Value::String("TEST3".to_string()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    for (i, app) in apps.iter().enumerate() {
        let hits = app.deliveries();
        if i == 3 {
            assert_eq!(hits.len(), 1, "node 3 receives exactly once");
            assert_eq!(hits[0].1, json!("x"));
        } else {
            assert!(hits.is_empty(), "node {i} should not receive the unicast");
        }
    }

    for node in &nodes {
        node.destroy();
    }
}

/// Drain the event stream until a terminal event, collecting values.
async fn collect(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<RqEvent>,
    budget: Duration,
) -> (Vec<String>, Option<RqEvent>) {
    let mut bag = Vec::new();
    let terminal = timeout(budget, async {
        while let Some(event) = rx.recv().await {
            match event {
                RqEvent::Values(values) => {
                    bag.extend(
                        values
                            .into_iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string())),
                    );
                }
                done @ (RqEvent::End { .. } | RqEvent::Failed { .. }) => return Some(done),
            }
        }
        None
    })
    .await
    .ok()
    .flatten();
    bag.sort();
    (bag, terminal)
}

#[tokio::test]
async fn range_query_covers_exactly_the_range() {
    let hub = MemoryHub::new();
    let (nodes, apps) = build_ring(&hub, 10).await;
    // Let the finger tables settle so partitioning can shortcut.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let mut rx = nodes[0].range_query(Key::from("2"), Key::from("5"), "probe", json!("probe"));
    let (bag, terminal) = collect(&mut rx, Duration::from_secs(8)).await;

    assert_eq!(bag, vec!["TEST2", "TEST3", "TEST4"]);
    match terminal {
        Some(RqEvent::End { retransmissions }) => assert_eq!(retransmissions, 0),
        other => panic!("expected clean end of reply, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in [2usize, 3, 4] {
        assert!(
            !apps[i].deliveries().is_empty(),
            "node {i} should have received the probe"
        );
    }
    for i in [0usize, 1, 5, 6, 7, 8, 9] {
        assert!(
            apps[i].deliveries().is_empty(),
            "node {i} should not have received the probe"
        );
    }

    for node in &nodes {
        node.destroy();
    }
}

#[tokio::test]
async fn muted_member_forces_retransmission() {
    let hub = MemoryHub::new();
    let (nodes, _apps) = build_ring(&hub, 10).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Node 2 still receives but transmits nothing: its replies (and acks)
    // stay buffered.
    nodes[2].mute();

    let mut rx = nodes[0].range_query(Key::from("2"), Key::from("5"), "probe", json!("probe"));
    let (bag, terminal) = collect(&mut rx, Duration::from_secs(15)).await;

    assert!(!bag.contains(&"TEST2".to_string()), "muted node must not answer");
    assert!(
        bag.contains(&"TEST3".to_string()) && bag.contains(&"TEST4".to_string()),
        "the live part of the range still answers: {bag:?}"
    );
    let retransmissions = match terminal {
        Some(RqEvent::End { retransmissions }) | Some(RqEvent::Failed { retransmissions }) => {
            retransmissions
        }
        other => panic!("no terminal event: {other:?}"),
    };
    assert!(retransmissions > 0, "initiator must have retransmitted");

    nodes[2].unmute();
    for node in &nodes {
        node.destroy();
    }
}
