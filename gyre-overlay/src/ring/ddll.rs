//! The distributed doubly-linked-list protocol.
//!
//! Each member of the ring keeps exactly one left and one right neighbor
//! per local key. Link changes are ordered by `(recovery, seq)` pairs;
//! overlapping operations resolve by protocol-level nak and retry rather
//! than by transport ordering. Joins route a connection request to the
//! closest preceding node, splice with `SetRJoin`/`SetL`, and verify with
//! a periodic leftward ping; failures recover by re-joining from the
//! survivor's own connections.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::retry_backoff;
use crate::error::{OverlayError, RejectReason, Result};
use crate::id::{Key, NodeId};
use crate::keyspace::is_ordered;
use crate::manager::ConnectTarget;
use crate::node::{Ctx, Delivery, Node, NodeEvent};
use crate::path::Path;
use crate::peer::{PcState, PeerConnection};
use crate::ring::{Closest, RingNode};
use crate::wire::{AppPayload, Body, CReq, Envelope};

/// Orders successive changes to a ring link. Recovery jumps dominate
/// ordinary updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkSeq {
    pub recovery: u32,
    pub seq: u32,
}

impl LinkSeq {
    pub const ZERO: LinkSeq = LinkSeq { recovery: 0, seq: 0 };

    /// Ordinary update: next sequence number.
    pub fn next(self) -> LinkSeq {
        LinkSeq {
            recovery: self.recovery,
            seq: self.seq + 1,
        }
    }

    /// Recovery update: bump the recovery number, reset the sequence.
    pub fn next_recovery(self) -> LinkSeq {
        LinkSeq {
            recovery: self.recovery + 1,
            seq: 0,
        }
    }
}

impl std::fmt::Display for LinkSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.recovery, self.seq)
    }
}

/// Membership status of a local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingStatus {
    Out,
    Ins,
    In,
    Del,
}

/// Where a repair currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    WaitPeriod,
    WaitPong,
    WaitConnect,
    WaitRightReply,
    WaitAck,
}

impl Node {
    // ── Public ring operations ───────────────────────────────────

    /// Join the ring under `key`. With no introducer this creates the
    /// first (singleton) member.
    pub async fn add_key(self: &Arc<Self>, key: Key, introducer: Option<ConnectTarget>) -> Result<Arc<RingNode>> {
        if self.rings.lock().contains_key(&key) {
            return Err(OverlayError::Rejected(RejectReason::DuplicatedKey));
        }
        let ring = RingNode::new(key.clone(), &self.cleaner);
        self.rings.lock().insert(key.clone(), Arc::clone(&ring));

        let result = match introducer {
            None => {
                self.insert_initial(&ring);
                Ok(())
            }
            Some(target) => self.join(&ring, target).await,
        };
        match result {
            Ok(()) => {
                self.start_ping(&ring);
                self.start_finger_maintenance(&ring);
                Ok(ring)
            }
            Err(e) => {
                self.rings.lock().remove(&key);
                ring.cleaner.clean();
                Err(e)
            }
        }
    }

    /// Leave the ring under `key` and release its resources.
    pub async fn remove_key(self: &Arc<Self>, key: &Key) -> Result<()> {
        let ring = self
            .ring_node(key)
            .ok_or(OverlayError::Rejected(RejectReason::NoExactKey))?;
        self.leave(&ring).await
    }

    // ── Initial insertion ────────────────────────────────────────

    /// Become a singleton ring: left and right are one loopback peer
    /// connection to ourselves.
    fn insert_initial(self: &Arc<Self>, ring: &Arc<RingNode>) {
        let pc = self.make_self_pc(&ring.key);
        ring.set_left(Some(pc.local_id));
        ring.set_right(Some(pc.local_id));
        ring.set_lseq(LinkSeq::ZERO);
        ring.set_rseq(LinkSeq::ZERO);
        ring.set_status(RingStatus::In);
        ring.set_successors(vec![ring.key.clone()]);
        self.emit(NodeEvent::RingStatusChanged {
            key: ring.key.clone(),
            status: RingStatus::In,
        });
        tracing::info!(node = %self.node_id.short(), key = %ring.key, "inserted as singleton ring");
    }

    fn make_self_pc(self: &Arc<Self>, key: &Key) -> Arc<PeerConnection> {
        let pc = self.new_peer_connection(key.clone(), PcState::Connected);
        pc.set_remote_node(self.node_id.clone());
        pc.set_remote_key(key.clone());
        pc.set_remote_conn(pc.local_id);
        pc.set_raw(Some(self.loopback().id));
        pc.add_path(Path::with_conn(vec![self.node_id.clone()], pc.local_id));
        pc
    }

    // ── Join ─────────────────────────────────────────────────────

    async fn join(self: &Arc<Self>, ring: &Arc<RingNode>, introducer: ConnectTarget) -> Result<()> {
        let mut last = OverlayError::Timeout("join");
        for attempt in 0..=self.config.number_of_retry {
            match self.join1(ring, introducer.clone(), false, false).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() => {
                    tracing::debug!(key = %ring.key, attempt, "join retrying: {e}");
                    last = e;
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// One join attempt. For repairs (`is_repair`), the existing right
    /// link is kept and only the left side is rebuilt, with the recovery
    /// number incremented.
    pub(crate) async fn join1(
        self: &Arc<Self>,
        ring: &Arc<RingNode>,
        introducer: ConnectTarget,
        is_repair: bool,
        allow_singleton: bool,
    ) -> Result<()> {
        let key = ring.key.clone();
        if !is_repair {
            ring.set_status(RingStatus::Ins);
            self.emit(NodeEvent::RingStatusChanged {
                key: key.clone(),
                status: RingStatus::Ins,
            });
        }

        // 1. Reach the future left neighbor via predecessor routing.
        let target = key.clone();
        let left_pc = self
            .connect_with_body(
                key.clone(),
                introducer,
                Some(Box::new(move |creq| Body::ForwardToPredecessor {
                    target_key: target.clone(),
                    inner: Box::new(Body::JoinLeftCReq {
                        creq: CReq {
                            target_key: Some(target),
                            ..creq
                        },
                        is_repair,
                        allow_singleton,
                    }),
                })),
            )
            .await?;
        let lkey = left_pc
            .remote_key()
            .ok_or_else(|| OverlayError::Internal("left neighbor without key".into()))?;

        // 2. Reach the future right neighbor through the left. Repairs
        //    keep their existing right link.
        let (right_pc, rkey) = if is_repair {
            match self.ring_right_pc(ring).and_then(|pc| {
                pc.remote_key().map(|k| (pc, k))
            }) {
                Some((pc, k)) => (Some(pc), k),
                // Right died as well; the node to our right repairs
                // toward us. Treat the ring as wrapping straight back.
                None => (None, lkey.clone()),
            }
        } else {
            let target = key.clone();
            let pc = self
                .connect_with_body(
                    key.clone(),
                    ConnectTarget::Pc(left_pc.local_id),
                    Some(Box::new(move |creq| Body::JoinRightCReq {
                        creq: CReq {
                            target_key: Some(target),
                            ..creq
                        },
                    })),
                )
                .await?;
            let k = pc
                .remote_key()
                .ok_or_else(|| OverlayError::Internal("right neighbor without key".into()))?;
            (Some(pc), k)
        };

        // 3. Positional validity on the circle.
        let valid = lkey == rkey || is_ordered(&lkey, false, &key, &rkey, false);
        if !valid {
            tracing::debug!(key = %key, left = %lkey, right = %rkey, "join position invalid, retrying");
            self.destroy_pc(&left_pc, true);
            if !is_repair {
                if let Some(pc) = right_pc {
                    self.destroy_pc(&pc, true);
                }
            }
            return Err(OverlayError::Retriable("join position moved".into()));
        }

        // 4. Collaborator hook (replica prefetch and the like).
        let hooks: Vec<crate::node::JoinHook> = self.join_hooks.lock().clone();
        for hook in hooks {
            hook(Arc::clone(self), Arc::clone(ring), Arc::clone(&left_pc)).await;
        }

        // 5. Atomically splice into the left neighbor.
        let proposed = if is_repair {
            ring.lseq().next_recovery()
        } else {
            LinkSeq::ZERO
        };
        if is_repair {
            ring.set_repair_status(RepairStatus::WaitRightReply);
        }
        let (reply, _) = self
            .request_on_pc(
                &left_pc,
                Body::SetRJoin {
                    rcur: rkey.clone(),
                    rnew_seq: proposed,
                },
                "set_r_join_reply",
            )
            .await?;
        let Body::SetRJoinReply { ack, rseq, .. } = reply.body else {
            return Err(OverlayError::Internal("reply class checked by runtime".into()));
        };
        if !ack {
            tracing::debug!(key = %key, "SetRJoin nak, retrying");
            self.destroy_pc(&left_pc, true);
            if !is_repair {
                if let Some(pc) = right_pc {
                    self.destroy_pc(&pc, true);
                }
            } else {
                // Escalate so the next attempt outranks whatever recovery
                // the left neighbor has already seen.
                ring.set_lseq(ring.lseq().next_recovery());
            }
            return Err(OverlayError::Retriable("left neighbor's right moved".into()));
        }

        // 6. Install links; tell the right neighbor about us.
        ring.set_lseq(proposed);
        self.install_left(ring, &left_pc);
        if !is_repair {
            if let Some(right_pc) = right_pc {
                ring.set_rseq(rseq);
                let old_right = ring.set_right(Some(right_pc.local_id));
                ring.set_successors(vec![rkey.clone()]);
                self.emit(NodeEvent::RightChanged {
                    key: key.clone(),
                    remote_key: Some(rkey.clone()),
                });
                let _ = self.send_on_pc(&right_pc, Body::SetL { seq: rseq });
                if let Some(old) = old_right.and_then(|id| self.peer_by_id(id)) {
                    if old.local_id != right_pc.local_id && Some(old.local_id) != ring.left() {
                        old.take_disconnect_callbacks();
                        self.close_pc(&old);
                    }
                }
            }
            ring.set_status(RingStatus::In);
            self.emit(NodeEvent::RingStatusChanged {
                key: key.clone(),
                status: RingStatus::In,
            });
            tracing::info!(node = %self.node_id.short(), key = %key, left = %lkey, right = %rkey, "joined ring");
        } else {
            tracing::info!(node = %self.node_id.short(), key = %key, left = %lkey,
                lseq = %proposed, "left link repaired");
            self.start_ping(ring);
        }
        Ok(())
    }

    /// Set a ring node's left link and arm the disconnect-triggered
    /// repair.
    fn install_left(self: &Arc<Self>, ring: &Arc<RingNode>, pc: &Arc<PeerConnection>) {
        let old = ring.set_left(Some(pc.local_id));
        let node = Arc::clone(self);
        let ring_for_cb = Arc::clone(ring);
        pc.add_disconnect_callback(move || {
            node.trigger_repair(ring_for_cb);
        });
        self.emit(NodeEvent::LeftChanged {
            key: ring.key.clone(),
            remote_key: pc.remote_key(),
        });
        if let Some(old) = old.and_then(|id| self.peer_by_id(id)) {
            if old.local_id != pc.local_id && Some(old.local_id) != ring.right() {
                // Replaced deliberately: silence its repair callback.
                old.take_disconnect_callbacks();
                self.close_pc(&old);
            }
        }
    }

    // ── Leave ────────────────────────────────────────────────────

    async fn leave(self: &Arc<Self>, ring: &Arc<RingNode>) -> Result<()> {
        // Let any in-progress repair finish first (bounded).
        for _ in 0..50 {
            if !ring.is_repairing() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        if ring.is_repairing() {
            return Err(OverlayError::Timeout("repair still running at leave"));
        }

        let left = self
            .ring_left_pc(ring)
            .ok_or(OverlayError::NotConnected)?;

        // Singleton: nothing to splice.
        if left.remote_node().as_ref() == Some(&self.node_id) {
            self.teardown_ring(ring);
            return Ok(());
        }

        let mut last = OverlayError::Timeout("leave");
        for attempt in 0..=self.config.number_of_retry {
            let left = match self.ring_left_pc(ring) {
                Some(pc) => pc,
                None => return Err(OverlayError::NotConnected),
            };
            let right = match self.ring_right_pc(ring) {
                Some(pc) => pc,
                None => return Err(OverlayError::NotConnected),
            };
            let (rkey, rnode) = match (right.remote_key(), right.remote_node()) {
                (Some(k), Some(n)) => (k, n),
                _ => return Err(OverlayError::NotConnected),
            };

            ring.set_status(RingStatus::Del);
            self.emit(NodeEvent::RingStatusChanged {
                key: ring.key.clone(),
                status: RingStatus::Del,
            });

            let outcome = self
                .request_on_pc(
                    &left,
                    Body::SetRLeave {
                        rcur: rkey.clone(),
                        rnew_seq: ring.rseq().next(),
                        rnew_key: rkey,
                        rnew_node: rnode,
                    },
                    "set_r_leave_reply",
                )
                .await;
            match outcome {
                Ok((reply, _)) => {
                    let Body::SetRLeaveReply { ack, .. } = reply.body else {
                        return Err(OverlayError::Internal("reply class checked by runtime".into()));
                    };
                    if ack && !ring.take_leave_interrupted() {
                        self.teardown_ring(ring);
                        return Ok(());
                    }
                    tracing::debug!(key = %ring.key, attempt, "leave raced, retrying");
                    ring.set_status(RingStatus::In);
                    self.emit(NodeEvent::RingStatusChanged {
                        key: ring.key.clone(),
                        status: RingStatus::In,
                    });
                    last = OverlayError::Retriable("leave raced with a neighbor change".into());
                }
                Err(e) => {
                    ring.set_status(RingStatus::In);
                    self.emit(NodeEvent::RingStatusChanged {
                        key: ring.key.clone(),
                        status: RingStatus::In,
                    });
                    last = e;
                }
            }
            tokio::time::sleep(retry_backoff(attempt)).await;
        }
        Err(last)
    }

    /// Drop the ring node's links and forget the key.
    fn teardown_ring(self: &Arc<Self>, ring: &Arc<RingNode>) {
        let key = ring.key.clone();
        for conn in [ring.set_left(None), ring.set_right(None)].into_iter().flatten() {
            if let Some(pc) = self.peer_by_id(conn) {
                pc.take_disconnect_callbacks();
                self.close_pc(&pc);
            }
        }
        self.teardown_fingers(ring);
        self.rings.lock().remove(&key);
        ring.cleaner.clean();
        self.emit(NodeEvent::RingStatusChanged {
            key,
            status: RingStatus::Out,
        });
    }

    // ── Ping and repair ──────────────────────────────────────────

    fn start_ping(self: &Arc<Self>, ring: &Arc<RingNode>) {
        let node = Arc::clone(self);
        let ring_for_timer = Arc::clone(ring);
        ring.cleaner.set_interval("ping", self.config.ping_period, move || {
            let node = Arc::clone(&node);
            let ring = Arc::clone(&ring_for_timer);
            async move {
                node.ping_left(&ring).await;
            }
        });
    }

    /// One leftward liveness check. Anything unexpected triggers repair.
    async fn ping_left(self: &Arc<Self>, ring: &Arc<RingNode>) {
        if ring.status() != RingStatus::In || ring.is_repairing() {
            return;
        }
        let Some(left) = self.ring_left_pc(ring) else {
            self.trigger_repair(Arc::clone(ring));
            return;
        };
        let Some(target_key) = left.remote_key() else {
            return;
        };
        ring.set_repair_status(RepairStatus::WaitPong);
        let outcome = self
            .request_on_pc(&left, Body::Ping { target_key }, "pong")
            .await;
        ring.set_repair_status(RepairStatus::WaitPeriod);
        match outcome {
            Ok((reply, _)) => {
                let Body::Pong { left_succ, rseq, .. } = reply.body else {
                    return;
                };
                if left_succ != ring.key || rseq != ring.lseq() {
                    tracing::warn!(key = %ring.key, %left_succ, pong_rseq = %rseq,
                        lseq = %ring.lseq(), "left link inconsistent, repairing");
                    self.trigger_repair(Arc::clone(ring));
                }
            }
            Err(e) => {
                tracing::warn!(key = %ring.key, "ping failed ({e}), repairing");
                self.trigger_repair(Arc::clone(ring));
            }
        }
    }

    /// Kick off a background repair of the left link, once.
    pub(crate) fn trigger_repair(self: &Arc<Self>, ring: Arc<RingNode>) {
        if ring.status() != RingStatus::In {
            return;
        }
        if !ring.begin_repair() {
            return;
        }
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.repair_loop(&ring).await;
            ring.end_repair();
        });
    }

    async fn repair_loop(self: &Arc<Self>, ring: &Arc<RingNode>) {
        loop {
            ring.set_repair_status(RepairStatus::WaitPeriod);
            tokio::time::sleep(self.config.recovery_retry_period).await;
            if self.is_destroyed() || ring.status() != RingStatus::In {
                return;
            }
            ring.set_repair_status(RepairStatus::WaitConnect);
            let allow_singleton = self.config.is_portal();
            let from_self = ConnectTarget::Raw(self.loopback().id);
            match self.join1(ring, from_self.clone(), true, allow_singleton).await {
                Ok(()) => return,
                Err(OverlayError::Rejected(RejectReason::Singleton)) => {
                    // Prefer re-entering the network through a portal.
                    for url in self.known_portals() {
                        if self
                            .join1(ring, ConnectTarget::Url(url.clone()), true, false)
                            .await
                            .is_ok()
                        {
                            tracing::info!(key = %ring.key, %url, "repaired through portal");
                            return;
                        }
                    }
                    if self.join1(ring, from_self, true, true).await.is_ok() {
                        tracing::info!(key = %ring.key, "repaired as singleton");
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(key = %ring.key, "repair attempt failed: {e}");
                }
            }
        }
    }

    // ── Predecessor routing ──────────────────────────────────────

    /// Forward a request toward the node closest strictly below `target`,
    /// or handle its embedded body if that is us. Strict ordering matters
    /// for repairs: a node looking for its own predecessor must not route
    /// the request to itself.
    pub(crate) async fn handle_forward_to_predecessor(self: &Arc<Self>, ctx: Ctx, target_key: Key, inner: Body) {
        match self.closest_preceding(&target_key, true) {
            None => {
                let _ = self.reply_along(
                    &ctx.source,
                    None,
                    Body::ForwardToPredecessorReply {
                        req_msg_id: ctx.msg_id.clone(),
                        reason: RejectReason::NoExactKey,
                    },
                );
            }
            Some(Closest::Local(ring)) => {
                self.handle_embedded(ctx, ring, inner).await;
            }
            Some(Closest::Conn(pc)) => {
                let env = Envelope {
                    msg_id: ctx.msg_id.clone(),
                    source: ctx.source.clone(),
                    destination: None,
                    sequence: None,
                    ack_request_id: None,
                    body: Body::ForwardToPredecessor {
                        target_key,
                        inner: Box::new(inner),
                    },
                };
                if self.send_envelope_on_pc(&pc, env).is_err() {
                    let _ = self.reply_along(
                        &ctx.source,
                        None,
                        Body::ForwardToPredecessorReply {
                            req_msg_id: ctx.msg_id.clone(),
                            reason: RejectReason::Constraint,
                        },
                    );
                }
            }
        }
    }

    async fn handle_embedded(self: &Arc<Self>, ctx: Ctx, ring: Arc<RingNode>, inner: Body) {
        match inner {
            Body::JoinLeftCReq { creq, is_repair, allow_singleton } => {
                self.join_left_accept(ctx, ring, creq, is_repair, allow_singleton).await;
            }
            Body::KeyBasedCReq { creq, exact } => {
                self.key_based_accept(ctx, ring, creq, exact).await;
            }
            other => {
                tracing::warn!(tag = other.tag(), "unexpected embedded request");
            }
        }
    }

    // ── Connection-request subtypes ──────────────────────────────

    pub(crate) async fn handle_join_left_creq(
        self: &Arc<Self>,
        ctx: Ctx,
        creq: CReq,
        is_repair: bool,
        allow_singleton: bool,
    ) {
        let Some(target) = creq.target_key.clone() else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };
        match self.closest_preceding(&target, true) {
            Some(Closest::Local(ring)) => {
                self.join_left_accept(ctx, ring, creq, is_repair, allow_singleton).await;
            }
            Some(Closest::Conn(pc)) => {
                let env = Envelope {
                    msg_id: ctx.msg_id.clone(),
                    source: ctx.source.clone(),
                    destination: None,
                    sequence: None,
                    ack_request_id: None,
                    body: Body::JoinLeftCReq { creq, is_repair, allow_singleton },
                };
                let _ = self.send_envelope_on_pc(&pc, env);
            }
            None => {
                self.reject_connection(&ctx, &creq, RejectReason::NoExactKey);
            }
        }
    }

    /// We are the closest preceding node: validate and accept the joiner
    /// as our future right neighbor.
    async fn join_left_accept(
        self: &Arc<Self>,
        ctx: Ctx,
        ring: Arc<RingNode>,
        creq: CReq,
        is_repair: bool,
        allow_singleton: bool,
    ) {
        let Some(target) = creq.target_key.clone() else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };
        if ring.status() != RingStatus::In {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        }
        // A repairing node re-joins under its own key; only foreign
        // requests for an occupied key are duplicates.
        let self_join = creq.src_node == self.node_id;
        if !self_join && target == ring.key {
            self.reject_connection(&ctx, &creq, RejectReason::DuplicatedKey);
            return;
        }
        let right_key = self.ring_right_pc(&ring).and_then(|pc| pc.remote_key());
        if !self_join && right_key.as_ref() == Some(&target) {
            self.reject_connection(&ctx, &creq, RejectReason::DuplicatedKey);
            return;
        }
        if self_join && !allow_singleton {
            // A self-join would collapse the network to a singleton; only
            // explicitly permitted during portal-led recovery.
            self.reject_connection(&ctx, &creq, RejectReason::Singleton);
            return;
        }
        if !is_repair && right_key.is_some() && !self.is_responsible(&ring, &target) {
            // Stale routing: pass the request on around the ring.
            if let Some(right) = self.ring_right_pc(&ring) {
                let env = Envelope {
                    msg_id: ctx.msg_id.clone(),
                    source: ctx.source.clone(),
                    destination: None,
                    sequence: None,
                    ack_request_id: None,
                    body: Body::JoinLeftCReq { creq, is_repair, allow_singleton },
                };
                let _ = self.send_envelope_on_pc(&right, env);
                return;
            }
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        }
        let _ = self.accept_connection(&ctx, &creq, ring.key.clone()).await;
    }

    /// Routed through the future left neighbor: the hop that receives
    /// this on its own left link is the future right neighbor.
    pub(crate) async fn handle_join_right_creq(self: &Arc<Self>, ctx: Ctx, creq: CReq) {
        let Some(pc) = ctx.pc.clone() else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };
        let Some(ring) = self.ring_node(&pc.local_key) else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };
        if ring.left() == Some(pc.local_id) {
            let _ = self.accept_connection(&ctx, &creq, ring.key.clone()).await;
            return;
        }
        match self.ring_right_pc(&ring) {
            Some(right) => {
                let env = Envelope {
                    msg_id: ctx.msg_id.clone(),
                    source: ctx.source.clone(),
                    destination: None,
                    sequence: None,
                    ack_request_id: None,
                    body: Body::JoinRightCReq { creq },
                };
                let _ = self.send_envelope_on_pc(&right, env);
            }
            None => {
                self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            }
        }
    }

    /// The left neighbor of a leaving node reaches us (the leaver's
    /// right) to splice around it.
    pub(crate) async fn handle_leave_creq(self: &Arc<Self>, ctx: Ctx, creq: CReq, leaving_key: Key) {
        let Some(target) = creq.target_key.clone() else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };
        let Some(ring) = self.ring_node(&target) else {
            self.reject_connection(&ctx, &creq, RejectReason::NoExactKey);
            return;
        };
        tracing::debug!(key = %ring.key, leaver = %leaving_key, "accepting splice around leaving node");
        let _ = self.accept_connection(&ctx, &creq, ring.key.clone()).await;
    }

    /// Connect to the node responsible for a key (or exactly owning it).
    pub(crate) async fn handle_key_based_creq(self: &Arc<Self>, ctx: Ctx, creq: CReq, exact: bool) {
        let Some(target) = creq.target_key.clone() else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };
        // Deliver to the responsible node first.
        for ring in self.ring_nodes() {
            if ring.status() == RingStatus::In && self.is_responsible(&ring, &target) {
                self.key_based_accept(ctx, ring, creq, exact).await;
                return;
            }
        }
        match self.closest_preceding(&target, false) {
            Some(Closest::Conn(pc)) => {
                let env = Envelope {
                    msg_id: ctx.msg_id.clone(),
                    source: ctx.source.clone(),
                    destination: None,
                    sequence: None,
                    ack_request_id: None,
                    body: Body::KeyBasedCReq { creq, exact },
                };
                let _ = self.send_envelope_on_pc(&pc, env);
            }
            _ => {
                self.reject_connection(&ctx, &creq, RejectReason::NoExactKey);
            }
        }
    }

    async fn key_based_accept(self: &Arc<Self>, ctx: Ctx, ring: Arc<RingNode>, creq: CReq, exact: bool) {
        let target = creq.target_key.clone().unwrap_or_else(|| ring.key.clone());
        if exact && target != ring.key {
            self.reject_connection(&ctx, &creq, RejectReason::NoExactKey);
            return;
        }
        let _ = self.accept_connection(&ctx, &creq, ring.key.clone()).await;
    }

    // ── Link updates ─────────────────────────────────────────────

    /// A joiner asks to become our right neighbor.
    pub(crate) fn handle_set_r_join(self: &Arc<Self>, ctx: Ctx, rcur: Key, rnew_seq: LinkSeq) {
        let Some(pc) = ctx.pc.clone() else {
            return;
        };
        let Some(ring) = self.ring_node(&pc.local_key) else {
            return;
        };
        let right_key = self.ring_right_pc(&ring).and_then(|p| p.remote_key());
        let matches_right = right_key.as_ref() == Some(&rcur);
        // A higher recovery number overrides a stale right link.
        let recovery_takeover = rnew_seq.recovery > ring.rseq().recovery;
        let acceptable = ring.status() == RingStatus::In && (matches_right || recovery_takeover);
        if !acceptable {
            tracing::debug!(key = %ring.key, %rcur, right = ?right_key, "SetRJoin nak");
            let _ = self.reply_along(
                &ctx.source,
                pc.remote_conn(),
                Body::SetRJoinReply {
                    req_msg_id: ctx.msg_id.clone(),
                    ack: false,
                    rseq: ring.rseq(),
                },
            );
            return;
        }
        let old_rseq = ring.rseq();
        let old_right = ring.set_right(Some(pc.local_id));
        ring.set_rseq(rnew_seq);
        ring.set_successors(pc.remote_key().into_iter().collect());
        self.emit(NodeEvent::RightChanged {
            key: ring.key.clone(),
            remote_key: pc.remote_key(),
        });
        tracing::info!(key = %ring.key, new_right = ?pc.remote_key().map(|k| k.to_string()),
            rseq = %rnew_seq, "right link swapped to joiner");
        let _ = self.reply_along(
            &ctx.source,
            pc.remote_conn(),
            Body::SetRJoinReply {
                req_msg_id: ctx.msg_id.clone(),
                ack: true,
                rseq: old_rseq.next(),
            },
        );
        // The old right link is now the joiner's problem: its SetL to the
        // old right retires it from that side.
        let _ = old_right;
    }

    /// A leaving right neighbor asks us to splice to its right.
    pub(crate) async fn handle_set_r_leave(
        self: &Arc<Self>,
        ctx: Ctx,
        rcur: Key,
        rnew_seq: LinkSeq,
        rnew_key: Key,
        rnew_node: NodeId,
    ) {
        let Some(pc) = ctx.pc.clone() else {
            return;
        };
        let Some(ring) = self.ring_node(&pc.local_key) else {
            return;
        };
        let nak = |node: &Arc<Node>| {
            let _ = node.reply_along(
                &ctx.source,
                pc.remote_conn(),
                Body::SetRLeaveReply {
                    req_msg_id: ctx.msg_id.clone(),
                    ack: false,
                    rnew_seq: ring.rseq(),
                },
            );
        };
        if ring.is_repairing() || ring.right() != Some(pc.local_id) {
            tracing::debug!(key = %ring.key, "SetRLeave nak (right changed underneath)");
            nak(self);
            return;
        }
        let Some(leaver) = pc.remote_node() else {
            nak(self);
            return;
        };

        if rnew_node == self.node_id {
            // The leaver was our only peer: collapse back to a singleton.
            let self_pc = self.make_self_pc(&ring.key);
            let old_left = ring.set_left(Some(self_pc.local_id));
            let old_right = ring.set_right(Some(self_pc.local_id));
            ring.set_lseq(rnew_seq);
            ring.set_rseq(rnew_seq);
            ring.set_successors(vec![ring.key.clone()]);
            for conn in [old_left, old_right].into_iter().flatten() {
                if let Some(old) = self.peer_by_id(conn) {
                    old.take_disconnect_callbacks();
                }
            }
            self.emit(NodeEvent::RightChanged {
                key: ring.key.clone(),
                remote_key: Some(ring.key.clone()),
            });
            self.emit(NodeEvent::LeftChanged {
                key: ring.key.clone(),
                remote_key: Some(ring.key.clone()),
            });
            let _ = self.reply_along(
                &ctx.source,
                pc.remote_conn(),
                Body::SetRLeaveReply {
                    req_msg_id: ctx.msg_id.clone(),
                    ack: true,
                    rnew_seq,
                },
            );
            tracing::info!(key = %ring.key, "neighbor left; singleton again");
            return;
        }

        // Splice to the new right through the (still alive) leaver.
        let route = Path::new(vec![self.node_id.clone(), leaver.clone(), rnew_node.clone()]);
        let target = rnew_key.clone();
        let leaving_key = rcur.clone();
        let new_right = self
            .connect_with_body(
                ring.key.clone(),
                ConnectTarget::Path(route),
                Some(Box::new(move |creq| Body::LeaveCReq {
                    creq: CReq {
                        target_key: Some(target),
                        ..creq
                    },
                    leaving_key,
                })),
            )
            .await;
        match new_right {
            Ok(new_right) => {
                let old_right = ring.set_right(Some(new_right.local_id));
                ring.set_rseq(rnew_seq);
                ring.set_successors(new_right.remote_key().into_iter().collect());
                self.emit(NodeEvent::RightChanged {
                    key: ring.key.clone(),
                    remote_key: new_right.remote_key(),
                });
                let _ = self.send_on_pc(&new_right, Body::SetL { seq: rnew_seq });
                if let Some(old) = old_right.and_then(|id| self.peer_by_id(id)) {
                    old.take_disconnect_callbacks();
                }
                let _ = self.reply_along(
                    &ctx.source,
                    pc.remote_conn(),
                    Body::SetRLeaveReply {
                        req_msg_id: ctx.msg_id.clone(),
                        ack: true,
                        rnew_seq,
                    },
                );
                tracing::info!(key = %ring.key, new_right = %rnew_key, "spliced around leaving neighbor");
            }
            Err(e) => {
                tracing::warn!(key = %ring.key, "splice to new right failed: {e}");
                nak(self);
            }
        }
    }

    /// The node to our left (joiner, or the leaver's left) installs
    /// itself as our left neighbor.
    pub(crate) fn handle_set_l(self: &Arc<Self>, ctx: Ctx, seq: LinkSeq) {
        let Some(pc) = ctx.pc.clone() else {
            return;
        };
        let Some(ring) = self.ring_node(&pc.local_key) else {
            return;
        };
        if ring.status() == RingStatus::Del {
            // Our leave raced with a neighbor change: abort it.
            tracing::debug!(key = %ring.key, "SetL during leave; restoring IN");
            ring.mark_leave_interrupted();
            ring.set_status(RingStatus::In);
            self.emit(NodeEvent::RingStatusChanged {
                key: ring.key.clone(),
                status: RingStatus::In,
            });
        }
        let old = ring.set_left(Some(pc.local_id));
        ring.set_lseq(seq);
        let node = Arc::clone(self);
        let ring_for_cb = Arc::clone(&ring);
        pc.add_disconnect_callback(move || {
            node.trigger_repair(ring_for_cb);
        });
        self.emit(NodeEvent::LeftChanged {
            key: ring.key.clone(),
            remote_key: pc.remote_key(),
        });
        tracing::info!(key = %ring.key, new_left = ?pc.remote_key().map(|k| k.to_string()),
            lseq = %seq, "left link updated");
        if let Some(old) = old.and_then(|id| self.peer_by_id(id)) {
            if old.local_id != pc.local_id && Some(old.local_id) != ring.right() {
                old.take_disconnect_callbacks();
                self.close_pc(&old);
            }
        }
        // Fresh left: restart the ping schedule against it.
        self.start_ping(&ring);
    }

    pub(crate) fn handle_ping(self: &Arc<Self>, ctx: Ctx, target_key: Key) {
        let Some(pc) = ctx.pc.clone() else {
            return;
        };
        let Some(ring) = self.ring_node(&pc.local_key) else {
            return;
        };
        if target_key != ring.key {
            tracing::debug!(key = %ring.key, asked = %target_key, "ping for stale key");
        }
        let left_succ = self
            .ring_right_pc(&ring)
            .and_then(|p| p.remote_key())
            .unwrap_or_else(|| ring.key.clone());
        let _ = self.reply_along(
            &ctx.source,
            pc.remote_conn(),
            Body::Pong {
                req_msg_id: ctx.msg_id.clone(),
                left_succ,
                rseq: ring.rseq(),
            },
        );
    }

    pub(crate) fn handle_get_right(self: &Arc<Self>, ctx: Ctx) {
        let Some(pc) = ctx.pc.clone() else {
            return;
        };
        let Some(ring) = self.ring_node(&pc.local_key) else {
            return;
        };
        let Some(right) = self.ring_right_pc(&ring) else {
            return;
        };
        if let (Some(node), Some(key)) = (right.remote_node(), right.remote_key()) {
            let _ = self.reply_along(
                &ctx.source,
                pc.remote_conn(),
                Body::GetRightReply {
                    req_msg_id: ctx.msg_id.clone(),
                    node,
                    key,
                },
            );
        }
    }

    // ── Unicast ──────────────────────────────────────────────────

    /// Deliver `data` to the node responsible for `target`, returning its
    /// reply value.
    pub async fn unicast(self: &Arc<Self>, target: Key, app: &str, data: Value) -> Result<Value> {
        let env = self.make_envelope(Body::Unicast {
            target_key: target,
            payload: AppPayload {
                app: app.to_string(),
                data,
            },
        });
        let msg_id = env.msg_id.clone();
        let opts = crate::runtime::RequestOptions::single("unicast_reply", self.config.reply_timeout);
        let mut rx = self.register_pending(&msg_id, opts);
        let loopback = self.loopback();
        self.send_envelope_on_raw(&loopback, env)?;
        match rx.recv().await {
            Some(Ok((reply, _))) => {
                let Body::UnicastReply { payload, .. } = reply.body else {
                    return Err(OverlayError::Internal("reply class checked by runtime".into()));
                };
                Ok(payload)
            }
            Some(Err(e)) => Err(e),
            None => Err(OverlayError::Disconnected),
        }
    }

    pub(crate) fn handle_unicast(self: &Arc<Self>, ctx: Ctx, target_key: Key, payload: AppPayload) {
        for ring in self.ring_nodes() {
            let routable = matches!(ring.status(), RingStatus::In | RingStatus::Del);
            if routable && self.is_responsible(&ring, &target_key) {
                let reply_value = match self.app(&payload.app) {
                    Some(handler) => handler.on_receive(
                        self,
                        Delivery {
                            from: target_key.clone(),
                            to: target_key.clone(),
                            local_key: ring.key.clone(),
                            sender: ctx.origin().cloned().unwrap_or_else(|| self.node_id.clone()),
                            data: payload.data,
                        },
                    ),
                    None => {
                        tracing::warn!(app = %payload.app, "unicast for unregistered app");
                        None
                    }
                };
                let _ = self.reply_along(
                    &ctx.source,
                    None,
                    Body::UnicastReply {
                        req_msg_id: ctx.msg_id.clone(),
                        payload: reply_value.unwrap_or(Value::Null),
                    },
                );
                return;
            }
        }
        // Not ours: pass it along the ring.
        let next = match self.closest_preceding(&target_key, false) {
            Some(Closest::Conn(pc)) => Some(pc),
            Some(Closest::Local(ring)) => self.ring_right_pc(&ring),
            None => None,
        };
        match next {
            Some(pc) => {
                let env = Envelope {
                    msg_id: ctx.msg_id.clone(),
                    source: ctx.source.clone(),
                    destination: None,
                    sequence: None,
                    ack_request_id: None,
                    body: Body::Unicast { target_key, payload },
                };
                let _ = self.send_envelope_on_pc(&pc, env);
            }
            None => {
                tracing::debug!(target = %target_key, "unicast with nowhere to go, dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_seq_ordering_is_lexicographic() {
        let a = LinkSeq { recovery: 0, seq: 5 };
        let b = LinkSeq { recovery: 1, seq: 0 };
        assert!(a < b);
        assert!(a.next() > a);
        assert!(a.next_recovery() > a.next());
        assert_eq!(a.next_recovery(), LinkSeq { recovery: 1, seq: 0 });
    }
}
