//! Request/reply runtime: pairing, timeouts, per-hop acks, suspicious
//! nodes, and dead-link propagation.
//!
//! Requests register in the node's ongoing table keyed by message id; a
//! reply finds its request there or is logged and dropped (normal with
//! multipath delivery). Every non-loopback message carries an ack request
//! for its next hop; a missed ack marks the hop suspicious and destroys
//! the raw link, notifying upstream nodes of the dead edge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{OverlayError, Result};
use crate::id::{LocalConnId, MsgId, NodeId, RawConnId};
use crate::node::Node;
use crate::path::Path;
use crate::peer::PeerConnection;
use crate::raw::RawConnection;
use crate::wire::{Body, Envelope};

/// A reply as delivered to a waiting request: the envelope plus the raw
/// link it arrived on (connection establishment binds to that link).
pub(crate) type ReplyDelivery = (Envelope, Option<RawConnId>);

pub(crate) struct PendingRequest {
    pub tx: mpsc::UnboundedSender<Result<ReplyDelivery>>,
    pub allow_multiple: bool,
    /// Expected reply tag; a mismatched class is dropped.
    pub expect: &'static str,
    /// Peer connection the request rides on, if any; its death fails the
    /// request with `Disconnected`.
    pub conn: Option<LocalConnId>,
}

pub(crate) struct Unacked {
    pub raw: RawConnId,
    pub remote: Option<NodeId>,
    /// Source path of the unacked message at send time; the route for
    /// `NoNextHopNotify` if the hop dies.
    pub source: Path,
}

/// How a request should wait for replies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestOptions {
    /// Reply deadline; `None` disables the timer (streaming requests).
    pub timeout: Option<Duration>,
    pub expect: &'static str,
    pub allow_multiple: bool,
    pub conn: Option<LocalConnId>,
}

impl RequestOptions {
    pub fn single(expect: &'static str, timeout: Duration) -> Self {
        RequestOptions {
            timeout: Some(timeout),
            expect,
            allow_multiple: false,
            conn: None,
        }
    }

    pub fn on_conn(mut self, conn: LocalConnId) -> Self {
        self.conn = Some(conn);
        self
    }
}

impl Node {
    /// Register an ongoing request and arm its reply timer.
    pub(crate) fn register_pending(
        self: &Arc<Self>,
        msg_id: &MsgId,
        opts: RequestOptions,
    ) -> mpsc::UnboundedReceiver<Result<ReplyDelivery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(
            msg_id.clone(),
            PendingRequest {
                tx,
                allow_multiple: opts.allow_multiple,
                expect: opts.expect,
                conn: opts.conn,
            },
        );
        if let Some(timeout) = opts.timeout {
            let node = Arc::clone(self);
            let id = msg_id.clone();
            self.cleaner
                .set_timer(&format!("reply-{msg_id}"), timeout, async move {
                    node.fail_pending(&id, OverlayError::Timeout("reply"));
                });
        }
        rx
    }

    pub(crate) fn fail_pending(&self, msg_id: &MsgId, err: OverlayError) {
        if let Some(entry) = self.pending.lock().remove(msg_id) {
            let _ = entry.tx.send(Err(err));
        }
        self.cleaner.cancel_timer(&format!("reply-{msg_id}"));
    }

    /// Fail every request riding on a dying peer connection.
    pub(crate) fn fail_pending_on_conn(&self, conn: LocalConnId) {
        let dead: Vec<MsgId> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, p)| p.conn == Some(conn))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in dead {
            self.fail_pending(&id, OverlayError::Disconnected);
        }
    }

    /// Route an inbound reply to its waiting request.
    pub(crate) fn deliver_reply(self: &Arc<Self>, env: Envelope, raw_id: Option<RawConnId>) {
        let Some(req_id) = env.body.reply_to().cloned() else {
            return;
        };
        let mut pending = self.pending.lock();
        if !pending.contains_key(&req_id) {
            drop(pending);
            // Normal with multipath: the other copy already completed it.
            tracing::debug!(node = %self.node_id.short(), req = %req_id, tag = env.body.tag(),
                "reply for unknown request dropped");
            return;
        }
        // Routing failures answer any request class.
        if let Body::ForwardToPredecessorReply { reason, .. } = env.body {
            let entry = pending.remove(&req_id).unwrap();
            drop(pending);
            self.cleaner.cancel_timer(&format!("reply-{req_id}"));
            let _ = entry.tx.send(Err(OverlayError::Rejected(reason)));
            return;
        }
        let entry = pending.get(&req_id).unwrap();
        if entry.expect != env.body.tag() {
            tracing::warn!(req = %req_id, expect = entry.expect, got = env.body.tag(),
                "reply class mismatch, dropped");
            return;
        }
        if entry.allow_multiple {
            let _ = entry.tx.send(Ok((env, raw_id)));
        } else {
            let entry = pending.remove(&req_id).unwrap();
            drop(pending);
            self.cleaner.cancel_timer(&format!("reply-{req_id}"));
            let _ = entry.tx.send(Ok((env, raw_id)));
        }
    }

    /// Streaming requests remove their entry explicitly when done.
    pub(crate) fn finish_pending(&self, msg_id: &MsgId) {
        self.pending.lock().remove(msg_id);
        self.cleaner.cancel_timer(&format!("reply-{msg_id}"));
    }

    /// Send a request on a peer connection and await the single reply.
    pub(crate) async fn request_on_pc(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        body: Body,
        expect: &'static str,
    ) -> Result<ReplyDelivery> {
        let mut env = self.make_envelope(body);
        if self.config.enable_sequencing {
            env.sequence = Some(pc.next_send_seq());
        }
        let msg_id = env.msg_id.clone();
        let opts = RequestOptions::single(expect, self.config.reply_timeout).on_conn(pc.local_id);
        let mut rx = self.register_pending(&msg_id, opts);
        if let Err(e) = self.send_envelope_on_pc(pc, env) {
            self.finish_pending(&msg_id);
            return Err(e);
        }
        match rx.recv().await {
            Some(result) => result,
            None => Err(OverlayError::Disconnected),
        }
    }

    /// Send a request on a raw link and await the single reply.
    pub(crate) async fn request_on_raw(
        self: &Arc<Self>,
        raw: &Arc<RawConnection>,
        body: Body,
        expect: &'static str,
    ) -> Result<ReplyDelivery> {
        let env = self.make_envelope(body);
        let msg_id = env.msg_id.clone();
        let opts = RequestOptions::single(expect, self.config.reply_timeout);
        let mut rx = self.register_pending(&msg_id, opts);
        if let Err(e) = self.send_envelope_on_raw(raw, env) {
            self.finish_pending(&msg_id);
            return Err(e);
        }
        match rx.recv().await {
            Some(result) => result,
            None => Err(OverlayError::Disconnected),
        }
    }

    /// Send a request along an explicit path and await the single reply.
    pub(crate) async fn request_along_path(
        self: &Arc<Self>,
        path: &Path,
        body: Body,
        expect: &'static str,
        timeout: Duration,
    ) -> Result<ReplyDelivery> {
        let env = self.make_envelope(body);
        let msg_id = env.msg_id.clone();
        let opts = RequestOptions::single(expect, timeout);
        let mut rx = self.register_pending(&msg_id, opts);
        if let Err(e) = self.send_along_path(path, env) {
            self.finish_pending(&msg_id);
            return Err(e);
        }
        match rx.recv().await {
            Some(result) => result,
            None => Err(OverlayError::Disconnected),
        }
    }

    // ── Per-hop acks ─────────────────────────────────────────────

    pub(crate) fn register_unacked(
        self: &Arc<Self>,
        ack_id: MsgId,
        raw: &Arc<RawConnection>,
        env: &Envelope,
    ) {
        self.unacked.lock().insert(
            ack_id.clone(),
            Unacked {
                raw: raw.id,
                remote: raw.remote(),
                source: env.source.clone(),
            },
        );
        let node = Arc::clone(self);
        let id = ack_id.clone();
        self.cleaner.set_timer(
            &format!("unacked-{ack_id}"),
            self.config.ack_timeout,
            async move {
                node.on_ack_timeout(&id);
            },
        );
    }

    pub(crate) fn handle_ack(&self, ack_reply_id: MsgId) {
        self.unacked.lock().remove(&ack_reply_id);
        self.cleaner.cancel_timer(&format!("unacked-{ack_reply_id}"));
    }

    fn on_ack_timeout(self: &Arc<Self>, ack_id: &MsgId) {
        let Some(entry) = self.unacked.lock().remove(ack_id) else {
            return;
        };
        let remote = entry.remote.clone();
        tracing::warn!(node = %self.node_id.short(), raw = %entry.raw,
            peer = ?remote.as_ref().map(|n| n.short().to_string()), "ack timeout");
        if let Some(remote) = remote {
            self.mark_suspicious(remote);
        }
        self.destroy_raw(entry.raw);
    }

    // ── Suspicious nodes ─────────────────────────────────────────

    pub(crate) fn mark_suspicious(&self, node: NodeId) {
        tracing::debug!(peer = %node.short(), "marked suspicious");
        self.suspicious.lock().insert(node, Instant::now());
    }

    pub(crate) fn clear_suspicious(&self, node: &NodeId) {
        self.suspicious.lock().remove(node);
    }

    pub fn is_suspicious(&self, node: &NodeId) -> bool {
        let marks = self.suspicious.lock();
        match marks.get(node) {
            Some(at) => at.elapsed() < self.config.suspicious_node_expiration,
            None => false,
        }
    }

    pub(crate) fn mark_indirect(&self, node: NodeId) {
        tracing::debug!(peer = %node.short(), "marked indirect (direct dialing skipped)");
        self.indirect.lock().insert(node, Instant::now());
    }

    pub(crate) fn is_indirect(&self, node: &NodeId) -> bool {
        let marks = self.indirect.lock();
        match marks.get(node) {
            Some(at) => at.elapsed() < self.config.indirect_node_expiration,
            None => false,
        }
    }

    // ── Raw death and dead-link propagation ──────────────────────

    /// Reader or writer task ended: clean up if not already destroyed.
    pub(crate) fn on_raw_dead(self: &Arc<Self>, raw_id: RawConnId) {
        let registered = self.raws.lock().contains_key(&raw_id);
        if registered {
            self.destroy_raw(raw_id);
        }
    }

    /// Destroy a raw connection: drop it from the registries, notify
    /// upstream nodes of every in-flight message, and prune paths that
    /// used the link.
    pub(crate) fn destroy_raw(self: &Arc<Self>, raw_id: RawConnId) {
        let Some(raw) = self.raws.lock().remove(&raw_id) else {
            return;
        };
        raw.shutdown();
        let remote = raw.remote();
        if let Some(ref remote) = remote {
            let mut index = self.raw_by_node.lock();
            if index.get(remote) == Some(&raw_id) {
                index.remove(remote);
            }
        }
        tracing::debug!(node = %self.node_id.short(), raw = %raw_id,
            peer = ?remote.as_ref().map(|n| n.short().to_string()),
            graceful = raw.was_graceful(), "raw destroyed");

        // Peer connections bound to this link fall back to their paths.
        for pc in self.all_peers() {
            if pc.raw() == Some(raw_id) {
                pc.set_raw(None);
            }
        }

        // In-flight messages on this link: notify their upstreams.
        let in_flight: Vec<Unacked> = {
            let mut unacked = self.unacked.lock();
            let ids: Vec<MsgId> = unacked
                .iter()
                .filter(|(_, u)| u.raw == raw_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| unacked.remove(id)).collect()
        };
        if let Some(ref remote) = remote {
            for entry in &in_flight {
                if entry.source.score() > 1 {
                    let _ = self.reply_along(
                        &entry.source,
                        None,
                        Body::NoNextHopNotify {
                            from: self.node_id.clone(),
                            to: remote.clone(),
                        },
                    );
                }
            }
            self.remove_dead_link(self.node_id.clone(), remote.clone());
        }
    }

    /// Remove the edge `from → to` from every peer connection's paths.
    /// Connections still negotiating a datagram session are exempt: they
    /// may legitimately have no raw link yet.
    pub(crate) fn remove_dead_link(self: &Arc<Self>, from: NodeId, to: NodeId) {
        for pc in self.all_peers() {
            if pc.state().is_datagram_establishing() {
                continue;
            }
            let before = pc.paths().len();
            if before == 0 {
                continue;
            }
            let left = pc.remove_paths_with_edge(&from, &to);
            if left == before {
                continue;
            }
            tracing::debug!(conn = %pc.local_id, from = %from.short(), to = %to.short(),
                paths_left = left, "pruned dead edge");
            if left == 0 && pc.is_connected() {
                let raw_alive = pc
                    .raw()
                    .and_then(|id| self.raw_by_id(id))
                    .map(|r| !r.is_closed())
                    .unwrap_or(false);
                if !raw_alive {
                    self.destroy_pc(&pc, false);
                }
            }
        }
    }
}
