//! Ring membership and the layers on top of it.
//!
//! [`ddll`] is the distributed doubly-linked-list protocol (join, leave,
//! repair, ping); [`ft`] maintains the finger tables; [`rq`] runs range
//! queries over the ring. A [`RingNode`] is this process's membership
//! under one local key.

pub mod ddll;
pub mod ft;
pub mod rq;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::cleaner::Cleaner;
use crate::id::{Key, LocalConnId, NodeId};
use crate::keyspace::{self, PivotMode};
use crate::node::Node;
use crate::peer::PeerConnection;

use ddll::{LinkSeq, RepairStatus, RingStatus};

/// Local membership under one ring key.
pub struct RingNode {
    pub key: Key,
    pub cleaner: Arc<Cleaner>,

    status: Mutex<RingStatus>,
    left: Mutex<Option<LocalConnId>>,
    right: Mutex<Option<LocalConnId>>,
    lseq: Mutex<LinkSeq>,
    rseq: Mutex<LinkSeq>,
    repair_status: Mutex<RepairStatus>,
    repairing: AtomicBool,
    leave_interrupted: AtomicBool,
    /// Successor keys rightward, seeded at join; replication targets for
    /// the KV collaborator.
    p_successors: Mutex<Vec<Key>>,
    /// Finger tables; level 0 is the DDLL right/left.
    pub(crate) fft: Mutex<Vec<Option<LocalConnId>>>,
    pub(crate) bft: Mutex<Vec<Option<LocalConnId>>>,
}

impl RingNode {
    pub(crate) fn new(key: Key, parent: &Arc<Cleaner>) -> Arc<Self> {
        Arc::new(RingNode {
            cleaner: parent.child(format!("ring-{key}")),
            key,
            status: Mutex::new(RingStatus::Out),
            left: Mutex::new(None),
            right: Mutex::new(None),
            lseq: Mutex::new(LinkSeq::ZERO),
            rseq: Mutex::new(LinkSeq::ZERO),
            repair_status: Mutex::new(RepairStatus::WaitPeriod),
            repairing: AtomicBool::new(false),
            leave_interrupted: AtomicBool::new(false),
            p_successors: Mutex::new(Vec::new()),
            fft: Mutex::new(Vec::new()),
            bft: Mutex::new(Vec::new()),
        })
    }

    pub fn status(&self) -> RingStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: RingStatus) {
        *self.status.lock() = status;
    }

    pub fn left(&self) -> Option<LocalConnId> {
        *self.left.lock()
    }

    pub fn right(&self) -> Option<LocalConnId> {
        *self.right.lock()
    }

    pub(crate) fn set_left(&self, conn: Option<LocalConnId>) -> Option<LocalConnId> {
        std::mem::replace(&mut *self.left.lock(), conn)
    }

    pub(crate) fn set_right(&self, conn: Option<LocalConnId>) -> Option<LocalConnId> {
        std::mem::replace(&mut *self.right.lock(), conn)
    }

    pub fn lseq(&self) -> LinkSeq {
        *self.lseq.lock()
    }

    pub fn rseq(&self) -> LinkSeq {
        *self.rseq.lock()
    }

    pub(crate) fn set_lseq(&self, seq: LinkSeq) {
        *self.lseq.lock() = seq;
    }

    pub(crate) fn set_rseq(&self, seq: LinkSeq) {
        *self.rseq.lock() = seq;
    }

    pub fn repair_status(&self) -> RepairStatus {
        *self.repair_status.lock()
    }

    pub(crate) fn set_repair_status(&self, status: RepairStatus) {
        *self.repair_status.lock() = status;
    }

    pub(crate) fn begin_repair(&self) -> bool {
        !self.repairing.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_repair(&self) {
        self.repairing.store(false, Ordering::SeqCst);
        self.set_repair_status(RepairStatus::WaitPeriod);
    }

    pub fn is_repairing(&self) -> bool {
        self.repairing.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_leave_interrupted(&self) {
        self.leave_interrupted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_leave_interrupted(&self) -> bool {
        self.leave_interrupted.swap(false, Ordering::SeqCst)
    }

    pub fn successors(&self) -> Vec<Key> {
        self.p_successors.lock().clone()
    }

    pub(crate) fn set_successors(&self, succ: Vec<Key>) {
        *self.p_successors.lock() = succ;
    }
}

impl std::fmt::Debug for RingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingNode")
            .field("key", &self.key)
            .field("status", &self.status())
            .field("lseq", &self.lseq())
            .field("rseq", &self.rseq())
            .finish()
    }
}

/// Result of a closest-preceding lookup.
pub(crate) enum Closest {
    /// One of our own keys wins: handle the target locally.
    Local(Arc<RingNode>),
    /// Forward over this connection.
    Conn(Arc<PeerConnection>),
}

impl Node {
    /// Left peer connection of a ring node, if set and alive.
    pub fn ring_left_pc(&self, ring: &RingNode) -> Option<Arc<PeerConnection>> {
        ring.left().and_then(|id| self.peer_by_id(id))
    }

    pub fn ring_right_pc(&self, ring: &RingNode) -> Option<Arc<PeerConnection>> {
        ring.right().and_then(|id| self.peer_by_id(id))
    }

    /// Whether this node is responsible for `key` under `ring`:
    /// `is_ordered(self, inclusive, key, right, exclusive)`.
    pub fn is_responsible(&self, ring: &RingNode, key: &Key) -> bool {
        let Some(right) = self.ring_right_pc(ring).and_then(|pc| pc.remote_key()) else {
            // No right link: broken ring, claim nothing beyond our own key.
            return *key == ring.key;
        };
        keyspace::is_ordered(&ring.key, true, key, &right, false)
    }

    /// The closest-preceding-connection rule: among all valid peer
    /// connections of locally inserted ring nodes (suspicious remotes
    /// excluded) plus the local keys themselves, circularly sorted
    /// relative to `target`, the last key that precedes the target —
    /// strictly or not, per `strict`.
    pub(crate) fn closest_preceding(&self, target: &Key, strict: bool) -> Option<Closest> {
        enum Cand {
            Local(Arc<RingNode>),
            Conn(Arc<PeerConnection>),
        }
        let mut cands: Vec<(Key, Cand)> = Vec::new();
        for pc in self.all_peers() {
            if !pc.is_connected() {
                continue;
            }
            let Some(key) = pc.remote_key() else {
                continue;
            };
            let Some(remote) = pc.remote_node() else {
                continue;
            };
            if remote != self.node_id && self.is_suspicious(&remote) {
                continue;
            }
            // Connections belong to a locally inserted ring node.
            if self.ring_node(&pc.local_key).is_none() {
                continue;
            }
            cands.push((key, Cand::Conn(pc)));
        }
        // Local keys go last so a key tie resolves to the local ring node
        // rather than a connection back to ourselves (the stable sort
        // preserves this order).
        for ring in self.ring_nodes() {
            match ring.status() {
                RingStatus::In | RingStatus::Del => {}
                RingStatus::Out | RingStatus::Ins => continue,
            }
            cands.push((ring.key.clone(), Cand::Local(Arc::clone(&ring))));
        }
        if cands.is_empty() {
            return None;
        }
        // Rotating the circular order so keys equal to the target land at
        // the front (strict) or the back (non-strict) makes the last
        // element exactly the closest preceding candidate.
        let mode = if strict { PivotMode::Inclusive } else { PivotMode::Exclusive };
        keyspace::circular_sort(target, &mut cands, mode, |(k, _)| k.clone());
        let (_, winner) = cands.pop()?;
        match winner {
            Cand::Local(ring) => Some(Closest::Local(ring)),
            Cand::Conn(pc) => Some(Closest::Conn(pc)),
        }
    }

    /// Connected peers (across all inserted ring nodes) whose remote key
    /// falls inside `[from, to)`, plus their keys, for range partitioning.
    pub(crate) fn peers_in_range(&self, range: &crate::keyspace::KeyRange) -> Vec<(Key, Arc<PeerConnection>)> {
        let mut out: Vec<(Key, Arc<PeerConnection>)> = Vec::new();
        for pc in self.all_peers() {
            if !pc.is_connected() {
                continue;
            }
            let Some(key) = pc.remote_key() else {
                continue;
            };
            let Some(remote) = pc.remote_node() else {
                continue;
            };
            if remote != self.node_id && self.is_suspicious(&remote) {
                continue;
            }
            if !range.contains(&key) {
                continue;
            }
            if out.iter().any(|(k, _)| *k == key) {
                continue;
            }
            out.push((key, pc));
        }
        out
    }

    /// All remote node ids currently reachable over connected peers.
    pub fn connected_remotes(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        for pc in self.all_peers() {
            if !pc.is_connected() {
                continue;
            }
            if let Some(remote) = pc.remote_node() {
                if !out.contains(&remote) {
                    out.push(remote);
                }
            }
        }
        out
    }
}
