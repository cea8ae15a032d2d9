//! Relay-path establishment and redundancy.
//!
//! Topology from the relay acceptance scenario: five nodes where the
//! requestor reaches its target only through relays at first, the
//! maintenance loop widens the path set as new edges appear, and the
//! connection survives muting all but one relay.

use std::sync::Arc;
use std::time::Duration;

use gyre_overlay::raw::memory::MemoryHub;
use gyre_overlay::{ConnectTarget, Key, Node, NodeConfig, NodeId, Path};

fn spawn(hub: &Arc<MemoryHub>, name: &str, portal: bool, always_relay: bool) -> Arc<Node> {
    let url = format!("mem://{name}");
    let config = NodeConfig {
        node_id: Some(format!("node-{name}")),
        my_url: portal.then(|| url.clone()),
        always_relay,
        ..NodeConfig::for_tests()
    };
    let (node, _events) = Node::new(config, hub.clone(), None);
    if portal {
        hub.serve(&node, &url);
    }
    node
}

fn id(name: &str) -> NodeId {
    NodeId::from(format!("node-{name}").as_str())
}

#[tokio::test]
async fn relay_paths_widen_and_survive_failures() {
    let hub = MemoryHub::new();
    // n0 portal relay; n1/n2 plain relays; n3 target (always-relay
    // policy); n4 requestor.
    let n0 = spawn(&hub, "n0", true, false);
    let n1 = spawn(&hub, "n1", false, false);
    let n2 = spawn(&hub, "n2", false, false);
    let n3 = spawn(&hub, "n3", true, true);
    let n4 = spawn(&hub, "n4", true, false);

    // Base edges: both ends know the portal.
    n4.connect(Key::from("k4"), ConnectTarget::Url("mem://n0".into()))
        .await
        .expect("n4-n0");
    n3.connect(Key::from("k3"), ConnectTarget::Url("mem://n0".into()))
        .await
        .expect("n3-n0");

    // The requestor reaches the target through the portal; the target's
    // always-relay policy forces a relayed connection.
    let route = Path::new(vec![id("n4"), id("n0"), id("n3")]);
    let pc = n4
        .connect(Key::from("k4"), ConnectTarget::Path(route))
        .await
        .expect("relayed peer connection");
    assert!(pc.is_connected());
    let primary = pc.primary_path().expect("primary path");
    assert_eq!(primary.nodes, vec![id("n4"), id("n0"), id("n3")]);

    // Introduce the alternative relays on both sides.
    n1.connect(Key::from("k1"), ConnectTarget::Url("mem://n4".into()))
        .await
        .expect("n1-n4");
    n1.connect(Key::from("k1"), ConnectTarget::Url("mem://n3".into()))
        .await
        .expect("n1-n3");
    n2.connect(Key::from("k2"), ConnectTarget::Url("mem://n4".into()))
        .await
        .expect("n2-n4");
    n2.connect(Key::from("k2"), ConnectTarget::Url("mem://n3".into()))
        .await
        .expect("n2-n3");

    // Within two maintenance periods the path set reaches the minimum.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        if pc.paths().len() >= 3 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("paths never widened: {:?}", pc.paths());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let paths = pc.paths();
    assert!(paths.iter().all(|p| p.nodes.len() == 3), "all relay routes are one hop");

    // Kill two of the three relays: the connection still answers.
    n0.mute();
    n1.mute();
    let mut ok = false;
    for attempt in 0..6 {
        match n4.query_neighbors(&pc).await {
            Ok(_) => {
                ok = true;
                break;
            }
            Err(e) => {
                tracing::debug!(attempt, "query failed while paths die off: {e}");
            }
        }
    }
    assert!(ok, "request must succeed over the surviving relay");

    n0.unmute();
    n1.unmute();
    for node in [&n0, &n1, &n2, &n3, &n4] {
        node.destroy();
    }
}
