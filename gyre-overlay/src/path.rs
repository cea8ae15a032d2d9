//! Multi-hop paths and the candidate graph used for relay construction.
//!
//! A [`Path`] is the ordered node sequence a message travels, optionally
//! terminated by the destination's connection id. Path equality ignores the
//! connection id. The [`PathGraph`] folds candidate paths into a set of
//! unique edges; relay establishment asks it for shortest and K-shortest
//! loopless routes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::id::{LocalConnId, NodeId};

/// An ordered sequence of node ids, optionally ending at a remote
/// connection id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    pub nodes: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<LocalConnId>,
}

impl Path {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Path { nodes, conn: None }
    }

    pub fn with_conn(nodes: Vec<NodeId>, conn: LocalConnId) -> Self {
        Path {
            nodes,
            conn: Some(conn),
        }
    }

    pub fn single(node: NodeId) -> Self {
        Path::new(vec![node])
    }

    /// Lower is better.
    pub fn score(&self) -> usize {
        self.nodes.len()
    }

    pub fn first(&self) -> Option<&NodeId> {
        self.nodes.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.nodes.last()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// The hop following `node`, if any.
    pub fn next_hop(&self, node: &NodeId) -> Option<&NodeId> {
        let idx = self.nodes.iter().position(|n| n == node)?;
        self.nodes.get(idx + 1)
    }

    /// Whether the path traverses the directed edge `from → to`.
    pub fn has_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        self.nodes
            .windows(2)
            .any(|w| &w[0] == from && &w[1] == to)
    }

    /// Same nodes in reverse order. The connection id does not survive
    /// reversal; it addressed the far end.
    pub fn reversed(&self) -> Path {
        let mut nodes = self.nodes.clone();
        nodes.reverse();
        Path::new(nodes)
    }

    /// Prepend a hop (used while building `source` on receive).
    pub fn prepend(&mut self, node: NodeId) {
        self.nodes.insert(0, node);
    }

    /// Remove loops by collapsing the span between equal nodes.
    /// `[a, b, c, b, d]` becomes `[a, b, d]`.
    pub fn collapse_loops(&mut self) {
        let mut out: Vec<NodeId> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            if let Some(i) = out.iter().position(|n| *n == node) {
                out.truncate(i);
            }
            out.push(node);
        }
        self.nodes = out;
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        // Two paths are the same route regardless of which connection id
        // they happen to end at.
        self.nodes == other.nodes
    }
}

impl Eq for Path {}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hops: Vec<&str> = self.nodes.iter().map(|n| n.short()).collect();
        write!(f, "[{}]", hops.join(" > "))?;
        if let Some(conn) = self.conn {
            write!(f, "#{conn}")?;
        }
        Ok(())
    }
}

/// Undirected graph of unique edges folded from candidate paths.
#[derive(Debug, Default, Clone)]
pub struct PathGraph {
    adj: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl PathGraph {
    pub fn new() -> Self {
        PathGraph::default()
    }

    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Self {
        let mut g = PathGraph::new();
        for p in paths {
            g.add_path(p);
        }
        g
    }

    pub fn add_edge(&mut self, a: &NodeId, b: &NodeId) {
        if a == b {
            return;
        }
        self.adj.entry(a.clone()).or_default().insert(b.clone());
        self.adj.entry(b.clone()).or_default().insert(a.clone());
    }

    pub fn add_path(&mut self, path: &Path) {
        for w in path.nodes.windows(2) {
            self.add_edge(&w[0], &w[1]);
        }
    }

    pub fn neighbors(&self, node: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.adj.get(node).into_iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.adj.is_empty()
    }

    /// Unweighted shortest path via BFS, skipping `banned` interior nodes
    /// and `banned_edges` (undirected).
    pub fn shortest_path(
        &self,
        src: &NodeId,
        dst: &NodeId,
        banned: &BTreeSet<NodeId>,
        banned_edges: &BTreeSet<(NodeId, NodeId)>,
    ) -> Option<Path> {
        if src == dst {
            return Some(Path::single(src.clone()));
        }
        let edge_banned = |a: &NodeId, b: &NodeId| {
            banned_edges.contains(&(a.clone(), b.clone()))
                || banned_edges.contains(&(b.clone(), a.clone()))
        };
        let mut prev: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(src.clone());
        while let Some(cur) = queue.pop_front() {
            for next in self.neighbors(&cur) {
                if prev.contains_key(next) || next == src {
                    continue;
                }
                if edge_banned(&cur, next) {
                    continue;
                }
                if next != dst && banned.contains(next) {
                    continue;
                }
                prev.insert(next.clone(), cur.clone());
                if next == dst {
                    let mut nodes = vec![dst.clone()];
                    let mut at = dst.clone();
                    while let Some(p) = prev.get(&at) {
                        nodes.push(p.clone());
                        at = p.clone();
                    }
                    nodes.reverse();
                    return Some(Path::new(nodes));
                }
                queue.push_back(next.clone());
            }
        }
        None
    }

    /// Top-K shortest loopless paths (Yen's algorithm over BFS hops).
    pub fn k_shortest_paths(&self, src: &NodeId, dst: &NodeId, k: usize) -> Vec<Path> {
        let no_nodes = BTreeSet::new();
        let no_edges = BTreeSet::new();
        let Some(first) = self.shortest_path(src, dst, &no_nodes, &no_edges) else {
            return Vec::new();
        };
        let mut found = vec![first];
        let mut candidates: Vec<Path> = Vec::new();

        while found.len() < k {
            let last = found.last().unwrap().clone();
            for spur_idx in 0..last.nodes.len() - 1 {
                let spur_node = last.nodes[spur_idx].clone();
                let root: Vec<NodeId> = last.nodes[..=spur_idx].to_vec();

                // Ban edges used by previously found paths that share this root.
                let mut banned_edges = BTreeSet::new();
                for p in &found {
                    if p.nodes.len() > spur_idx && p.nodes[..=spur_idx] == root[..] {
                        if let Some(next) = p.nodes.get(spur_idx + 1) {
                            banned_edges.insert((spur_node.clone(), next.clone()));
                        }
                    }
                }
                // Ban root nodes so spur paths stay loopless.
                let banned: BTreeSet<NodeId> = root[..spur_idx].iter().cloned().collect();

                if let Some(spur) = self.shortest_path(&spur_node, dst, &banned, &banned_edges) {
                    let mut nodes = root.clone();
                    nodes.extend(spur.nodes.into_iter().skip(1));
                    let candidate = Path::new(nodes);
                    if !found.contains(&candidate) && !candidates.contains(&candidate) {
                        candidates.push(candidate);
                    }
                }
            }
            candidates.sort_by_key(|p| p.score());
            if candidates.is_empty() {
                break;
            }
            found.push(candidates.remove(0));
        }
        found
    }

    /// All nodes at exactly `distance` hops from `src`.
    pub fn nodes_at_distance(&self, src: &NodeId, distance: usize) -> Vec<NodeId> {
        let mut dist: HashMap<NodeId, usize> = HashMap::new();
        dist.insert(src.clone(), 0);
        let mut queue = VecDeque::new();
        queue.push_back(src.clone());
        while let Some(cur) = queue.pop_front() {
            let d = dist[&cur];
            if d >= distance {
                continue;
            }
            for next in self.neighbors(&cur) {
                if !dist.contains_key(next) {
                    dist.insert(next.clone(), d + 1);
                    queue.push_back(next.clone());
                }
            }
        }
        let mut out: Vec<NodeId> = dist
            .into_iter()
            .filter(|(_, d)| *d == distance)
            .map(|(n, _)| n)
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn p(ids: &[&str]) -> Path {
        Path::new(ids.iter().map(|s| n(s)).collect())
    }

    #[test]
    fn equality_ignores_conn_id() {
        let a = Path::with_conn(vec![n("a"), n("b")], LocalConnId(1));
        let b = Path::with_conn(vec![n("a"), n("b")], LocalConnId(2));
        assert_eq!(a, b);
    }

    #[test]
    fn collapse_removes_loops() {
        let mut path = p(&["a", "b", "c", "b", "d"]);
        path.collapse_loops();
        assert_eq!(path, p(&["a", "b", "d"]));

        let mut path = p(&["a", "b", "a", "c"]);
        path.collapse_loops();
        assert_eq!(path, p(&["a", "c"]));

        let mut clean = p(&["a", "b", "c"]);
        clean.collapse_loops();
        assert_eq!(clean, p(&["a", "b", "c"]));
    }

    #[test]
    fn shortest_path_prefers_fewest_hops() {
        let g = PathGraph::from_paths([&p(&["a", "b", "c", "d"]), &p(&["a", "x", "d"])]);
        let sp = g
            .shortest_path(&n("a"), &n("d"), &BTreeSet::new(), &BTreeSet::new())
            .unwrap();
        assert_eq!(sp, p(&["a", "x", "d"]));
    }

    #[test]
    fn k_shortest_finds_disjoint_routes() {
        let g = PathGraph::from_paths([
            &p(&["s", "a", "t"]),
            &p(&["s", "b", "t"]),
            &p(&["s", "c", "d", "t"]),
        ]);
        let paths = g.k_shortest_paths(&n("s"), &n("t"), 3);
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].score(), 3);
        assert_eq!(paths[1].score(), 3);
        assert_eq!(paths[2], p(&["s", "c", "d", "t"]));
        // Loopless
        for path in &paths {
            let uniq: BTreeSet<_> = path.nodes.iter().collect();
            assert_eq!(uniq.len(), path.nodes.len());
        }
    }

    #[test]
    fn nodes_at_distance_bfs() {
        let g = PathGraph::from_paths([&p(&["a", "b", "c"]), &p(&["a", "d"])]);
        assert_eq!(g.nodes_at_distance(&n("a"), 1), vec![n("b"), n("d")]);
        assert_eq!(g.nodes_at_distance(&n("a"), 2), vec![n("c")]);
    }
}
