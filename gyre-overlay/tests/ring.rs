//! Ring membership over in-process transports.
//!
//! Nodes talk through a `MemoryHub`, so whole multi-node topologies run
//! in one test process with fast timers.

use std::sync::Arc;
use std::time::Duration;

use gyre_overlay::raw::memory::MemoryHub;
use gyre_overlay::{ConnectTarget, Key, Node, NodeConfig, RingStatus};

fn spawn_node(hub: &Arc<MemoryHub>, name: &str) -> Arc<Node> {
    let url = format!("mem://{name}");
    let config = NodeConfig {
        node_id: Some(format!("node-{name}")),
        my_url: Some(url.clone()),
        ..NodeConfig::for_tests()
    };
    let (node, _events) = Node::new(config, hub.clone(), None);
    hub.serve(&node, &url);
    node
}

fn key_of(i: usize, _n: usize) -> Key {
    Key::from(format!("{i:02}").as_str())
}

/// Join `n` nodes sequentially through the first as introducer.
async fn build_ring(hub: &Arc<MemoryHub>, n: usize) -> Vec<Arc<Node>> {
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let node = spawn_node(hub, &format!("n{i}"));
        let introducer = if i == 0 {
            None
        } else {
            Some(ConnectTarget::Url("mem://n0".to_string()))
        };
        node.add_key(key_of(i, n), introducer)
            .await
            .unwrap_or_else(|e| panic!("node {i} failed to join: {e}"));
        nodes.push(node);
    }
    nodes
}

fn neighbors(nodes: &[Arc<Node>], i: usize, n: usize) -> (Key, Key) {
    let ring = nodes[i].ring_node(&key_of(i, n)).expect("ring node");
    let left = nodes[i]
        .ring_left_pc(&ring)
        .and_then(|pc| pc.remote_key())
        .unwrap_or_else(|| panic!("node {i} has no left"));
    let right = nodes[i]
        .ring_right_pc(&ring)
        .and_then(|pc| pc.remote_key())
        .unwrap_or_else(|| panic!("node {i} has no right"));
    (left, right)
}

#[tokio::test]
async fn sequential_joins_close_the_ring() {
    let hub = MemoryHub::new();
    let n = 7;
    let nodes = build_ring(&hub, n).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    for i in 0..n {
        let (left, right) = neighbors(&nodes, i, n);
        assert_eq!(right, key_of((i + 1) % n, n), "right of node {i}");
        assert_eq!(left, key_of((i + n - 1) % n, n), "left of node {i}");
    }

    // Adjacent link sequences agree: u.rseq == v.lseq.
    for i in 0..n {
        let u = nodes[i].ring_node(&key_of(i, n)).unwrap();
        let v = nodes[(i + 1) % n].ring_node(&key_of((i + 1) % n, n)).unwrap();
        assert_eq!(u.rseq(), v.lseq(), "link seq between {i} and {}", (i + 1) % n);
        assert_eq!(u.status(), RingStatus::In);
    }

    // Following right links visits every member and returns home.
    let mut at = key_of(0, n);
    for _ in 0..n {
        let idx = at.as_str()[..2.min(at.as_str().len())].parse::<usize>().unwrap();
        let (_, right) = neighbors(&nodes, idx, n);
        at = right;
    }
    assert_eq!(at, key_of(0, n), "ring closure after {n} hops");

    for node in &nodes {
        node.destroy();
    }
}

#[tokio::test]
async fn singleton_has_itself_on_both_sides() {
    let hub = MemoryHub::new();
    let node = spawn_node(&hub, "solo");
    let key = Key::from("42");
    let ring = node.add_key(key.clone(), None).await.unwrap();
    let left = node.ring_left_pc(&ring).unwrap();
    let right = node.ring_right_pc(&ring).unwrap();
    assert_eq!(left.local_id, right.local_id, "singleton left == right");
    assert_eq!(left.remote_key(), Some(key.clone()));
    assert_eq!(ring.status(), RingStatus::In);
    node.destroy();
}

#[tokio::test]
async fn leave_splices_the_neighbors_together() {
    let hub = MemoryHub::new();
    let n = 4;
    let nodes = build_ring(&hub, n).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    nodes[2].remove_key(&key_of(2, n)).await.expect("leave");
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(nodes[2].ring_node(&key_of(2, n)).is_none(), "key forgotten");
    let (_, right_of_1) = neighbors(&nodes, 1, n);
    let (left_of_3, _) = neighbors(&nodes, 3, n);
    assert_eq!(right_of_1, key_of(3, n), "node 1 spliced to node 3");
    assert_eq!(left_of_3, key_of(1, n), "node 3 spliced to node 1");

    let u = nodes[1].ring_node(&key_of(1, n)).unwrap();
    let v = nodes[3].ring_node(&key_of(3, n)).unwrap();
    assert_eq!(u.rseq(), v.lseq());

    for node in &nodes {
        node.destroy();
    }
}

#[tokio::test]
async fn crash_of_a_member_is_repaired() {
    let hub = MemoryHub::new();
    let n = 4;
    let nodes = build_ring(&hub, n).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let before = nodes[1].ring_node(&key_of(1, n)).unwrap().lseq();

    // Kill node 0: its raw links die abruptly.
    hub.unbind("mem://n0");
    nodes[0].destroy();

    // ack timeout + ping period + recovery retry, with slack.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // The survivors form a consistent three-ring.
    let order = [1usize, 2, 3];
    for (pos, &i) in order.iter().enumerate() {
        let (left, right) = neighbors(&nodes, i, n);
        let next = order[(pos + 1) % order.len()];
        let prev = order[(pos + order.len() - 1) % order.len()];
        assert_eq!(right, key_of(next, n), "right of node {i} after repair");
        assert_eq!(left, key_of(prev, n), "left of node {i} after repair");
    }
    for (pos, &i) in order.iter().enumerate() {
        let next = order[(pos + 1) % order.len()];
        let u = nodes[i].ring_node(&key_of(i, n)).unwrap();
        let v = nodes[next].ring_node(&key_of(next, n)).unwrap();
        assert_eq!(u.rseq(), v.lseq(), "link seq {i}->{next} after repair");
    }

    // The node whose left neighbor crashed went through a recovery.
    let after = nodes[1].ring_node(&key_of(1, n)).unwrap().lseq();
    assert!(
        after.recovery > before.recovery,
        "node 1 should have incremented its recovery number ({before} -> {after})"
    );

    for node in &nodes[1..] {
        node.destroy();
    }
}
