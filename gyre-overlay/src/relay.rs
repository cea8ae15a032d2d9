//! Relay-path construction and maintenance.
//!
//! When no direct transport is possible, the connect side folds every
//! candidate route (the accept side's known paths, its own, and the path
//! the reply travelled) into a graph and probes routes end-to-end in
//! increasing hop budgets until enough disjoint paths are live. A
//! periodic maintainer re-validates paths with `GetNeighbors` and rebuilds
//! the set when links rot away; a relay connection with zero live paths is
//! destroyed.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::{OverlayError, Result};
use crate::id::NodeId;
use crate::node::Node;
use crate::path::{Path, PathGraph};
use crate::peer::{PcState, PeerConnection};
use crate::wire::{Body, ConnectAccept};

/// Cap on concurrently outstanding probes.
const MAX_OUTSTANDING_PROBES: usize = 4;
/// How many Yen candidates to consider per hop budget.
const YEN_CANDIDATES: usize = 8;
/// Upper bound on the hop budget sweep.
const MAX_HOP_BUDGET: usize = 6;

impl Node {
    /// Build relay paths for a peer connection until the configured
    /// minimum is live. Succeeds with fewer if the graph has no more
    /// routes but at least one probe landed.
    pub(crate) async fn establish_relay(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        accept: &ConnectAccept,
        reply_source: &Path,
    ) -> Result<()> {
        if !self.config.enable_relay {
            return Err(OverlayError::Rejected(crate::error::RejectReason::NoRelayIsOn));
        }
        let mut graph = PathGraph::new();
        for path in &accept.paths {
            graph.add_path(path);
        }
        for path in self.own_known_paths() {
            graph.add_path(&path);
        }
        if reply_source.score() > 1 {
            graph.add_path(reply_source);
        }

        self.build_relay_paths(pc, &accept.node, &graph).await;

        if pc.paths().is_empty() {
            return Err(OverlayError::Timeout("relay establish"));
        }
        if !pc.is_connected() {
            pc.set_state(PcState::Connected);
        }
        tracing::info!(conn = %pc.local_id, peer = %accept.node.short(),
            paths = pc.paths().len(), "connected (relay)");
        self.start_relay_maintenance(pc);
        Ok(())
    }

    /// The hop-budget sweep: try established paths, then Yen candidates,
    /// then detours through directly-dialed intermediates.
    async fn build_relay_paths(self: &Arc<Self>, pc: &Arc<PeerConnection>, target: &NodeId, graph: &PathGraph) {
        let minimum = self.config.minimum_relay_paths;

        for budget in 2..=MAX_HOP_BUDGET {
            if pc.paths().len() >= minimum {
                break;
            }
            let want_len = budget + 1; // nodes on a path of `budget` hops

            // (a) already-known paths of exactly this length, re-probed.
            let known: Vec<Path> = pc
                .paths()
                .into_iter()
                .filter(|p| p.score() == want_len)
                .collect();
            self.probe_batch(pc, known).await;
            if pc.paths().len() >= minimum {
                break;
            }

            // (b) Yen's top-K shortest loopless routes of this length.
            let candidates: Vec<Path> = graph
                .k_shortest_paths(&self.node_id, target, YEN_CANDIDATES)
                .into_iter()
                .filter(|p| p.score() == want_len)
                .filter(|p| !pc.paths().contains(p))
                .collect();
            self.probe_batch(pc, candidates).await;
            if pc.paths().len() >= minimum {
                break;
            }

            // (c) dial intermediates at distance budget-1 from the target
            // and route through them.
            let intermediates = graph.nodes_at_distance(target, budget - 1);
            for mid in intermediates {
                if pc.paths().len() >= minimum {
                    break;
                }
                if mid == self.node_id || mid == *target {
                    continue;
                }
                let no_ban = BTreeSet::new();
                let Some(to_mid) = graph.shortest_path(&self.node_id, &mid, &no_ban, &no_ban_edges())
                else {
                    continue;
                };
                let Some(mid_to_target) = graph.shortest_path(&mid, target, &no_ban, &no_ban_edges())
                else {
                    continue;
                };
                let mut nodes = to_mid.nodes.clone();
                nodes.extend(mid_to_target.nodes.into_iter().skip(1));
                let mut detour = Path::new(nodes);
                detour.collapse_loops();
                if detour.score() != want_len || pc.paths().contains(&detour) {
                    continue;
                }
                // Make sure the first hop is dialable before probing: a
                // path connection request opens the leg to the
                // intermediate when none exists.
                if self.raw_by_node(detour.nodes.get(1).unwrap_or(&mid)).is_none() {
                    let setup = Box::pin(
                        self.connect(pc.local_key.clone(), crate::manager::ConnectTarget::Path(to_mid)),
                    )
                    .await;
                    if setup.is_err() {
                        continue;
                    }
                }
                self.probe_batch(pc, vec![detour]).await;
            }
        }
    }

    /// Probe candidate paths with bounded concurrency; live ones are added
    /// to the connection by the reply handler.
    async fn probe_batch(self: &Arc<Self>, pc: &Arc<PeerConnection>, candidates: Vec<Path>) {
        let mut set: JoinSet<()> = JoinSet::new();
        for path in candidates {
            while set.len() >= MAX_OUTSTANDING_PROBES {
                let _ = set.join_next().await;
            }
            let node = Arc::clone(self);
            let pc = Arc::clone(pc);
            set.spawn(async move {
                let _ = node.probe_candidate(&pc, path).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Send one probe along a candidate route. On reply, the route is a
    /// live path of this connection.
    pub(crate) async fn probe_candidate(self: &Arc<Self>, pc: &Arc<PeerConnection>, path: Path) -> Result<()> {
        if path.first() != Some(&self.node_id) {
            return Err(OverlayError::Internal("probe path must start here".into()));
        }
        let mut dest = path.clone();
        dest.conn = pc.remote_conn();
        let body = Body::ProbePath {
            probe: path.nodes.clone(),
        };
        let reply = self
            .request_along_path(&dest, body, "probe_path_reply", self.config.relay_connection_timeout)
            .await;
        match reply {
            Ok(_) => {
                let mut live = path;
                live.conn = pc.remote_conn();
                if pc.add_path(live) {
                    tracing::debug!(conn = %pc.local_id, "probe confirmed new relay path");
                }
                if !pc.is_connected() && !pc.state().is_terminal() {
                    pc.set_state(PcState::Connected);
                }
                Ok(())
            }
            Err(e) => {
                tracing::debug!(conn = %pc.local_id, "probe failed: {e}");
                Err(e)
            }
        }
    }

    /// Arm the periodic maintainer on a relay connection.
    pub(crate) fn start_relay_maintenance(self: &Arc<Self>, pc: &Arc<PeerConnection>) {
        let node = Arc::clone(self);
        let conn = pc.local_id;
        pc.cleaner.set_interval(
            "relay-maintenance",
            self.config.relay_path_maintenance_period,
            move || {
                let node = Arc::clone(&node);
                async move {
                    let Some(pc) = node.peer_by_id(conn) else {
                        return;
                    };
                    node.maintain_relay(&pc).await;
                }
            },
        );
    }

    /// One maintenance round: validate every path with `GetNeighbors`,
    /// rebuild the candidate graph from what answered, and top the set
    /// back up. Zero live paths destroys the connection.
    pub(crate) async fn maintain_relay(self: &Arc<Self>, pc: &Arc<PeerConnection>) {
        if !pc.is_connected() {
            return;
        }
        let Some(remote) = pc.remote_node() else {
            return;
        };
        let paths = pc.paths();
        if paths.is_empty() {
            self.destroy_pc(pc, false);
            return;
        }
        // Direct connections do not need path upkeep.
        if pc.raw().and_then(|id| self.raw_by_id(id)).is_some_and(|r| !r.is_closed()) {
            return;
        }

        let mut live: Vec<Path> = Vec::new();
        let mut remote_paths: Vec<Path> = Vec::new();
        for path in &paths {
            let mut dest = path.clone();
            dest.conn = pc.remote_conn();
            match self
                .request_along_path(
                    &dest,
                    Body::GetNeighbors,
                    "get_neighbors_reply",
                    self.config.relay_connection_timeout,
                )
                .await
            {
                Ok((env, _)) => {
                    live.push(path.clone());
                    if let Body::GetNeighborsReply { paths, .. } = env.body {
                        remote_paths.extend(paths);
                    }
                }
                Err(e) => {
                    tracing::debug!(conn = %pc.local_id, path = %path, "maintenance probe failed: {e}");
                }
            }
        }

        if live.is_empty() {
            tracing::warn!(conn = %pc.local_id, peer = %remote.short(),
                "no relay path answered maintenance, destroying connection");
            self.destroy_pc(pc, true);
            return;
        }

        let mut with_conn: Vec<Path> = live
            .iter()
            .cloned()
            .map(|mut p| {
                p.conn = pc.remote_conn();
                p
            })
            .collect();
        with_conn.sort_by_key(|p| p.score());
        pc.set_paths(with_conn);

        if pc.paths().len() < self.config.minimum_relay_paths {
            let mut graph = PathGraph::new();
            for path in &live {
                graph.add_path(path);
            }
            for path in &remote_paths {
                graph.add_path(path);
            }
            for path in self.own_known_paths() {
                graph.add_path(&path);
            }
            self.build_relay_paths(pc, &remote, &graph).await;
        }
    }
}

fn no_ban_edges() -> BTreeSet<(NodeId, NodeId)> {
    BTreeSet::new()
}
