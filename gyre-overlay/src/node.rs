//! The per-process overlay node.
//!
//! A [`Node`] is the only process-wide state: it owns the raw-connection
//! and peer-connection registries, the request/ack runtime tables, the
//! ring nodes for its local keys, and the application-handler registry.
//! Inbound frames from every transport funnel into [`Node::handle_envelope`],
//! which runs the receive pipeline: source update, per-hop ack, routing,
//! dedup, then dispatch to the message's handler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cleaner::Cleaner;
use crate::config::NodeConfig;
use crate::error::{OverlayError, Result};
use crate::id::{IdGen, Key, LocalConnId, MsgId, NodeId, RawConnId};
use crate::keyspace::KeyRange;
use crate::path::Path;
use crate::peer::PeerConnection;
use crate::raw::{DatagramFactory, Dialer, RawConnection};
use crate::ring::RingNode;
use crate::ring::ft::FtDirection;
use crate::runtime::{PendingRequest, Unacked};
use crate::wire::{Body, Envelope, HelloStatus};

/// Externally observable events, delivered on the node's event channel.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerDisconnected {
        conn: LocalConnId,
        remote: Option<NodeId>,
    },
    RingStatusChanged {
        key: Key,
        status: crate::ring::ddll::RingStatus,
    },
    LeftChanged {
        key: Key,
        remote_key: Option<Key>,
    },
    RightChanged {
        key: Key,
        remote_key: Option<Key>,
    },
    FingerUpdated {
        key: Key,
        direction: FtDirection,
        level: usize,
    },
}

/// A payload delivered to an application handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Key the payload was addressed to (unicast) or the fragment start.
    pub from: Key,
    /// Fragment end; equals `from` for unicast.
    pub to: Key,
    /// The local key this node is responsible under.
    pub local_key: Key,
    pub sender: NodeId,
    pub data: Value,
}

/// Application collaborators (the KV store, demos) register one of these
/// per `app` tag. The returned value, if any, becomes the reply.
pub trait AppHandler: Send + Sync {
    fn on_receive(&self, node: &Arc<Node>, delivery: Delivery) -> Option<Value>;
}

/// Async hook run during a join, after the future neighbors are known but
/// before the ring links switch over.
pub type JoinHook = Arc<
    dyn Fn(
            Arc<Node>,
            Arc<crate::ring::RingNode>,
            Arc<PeerConnection>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

pub struct Node {
    pub config: NodeConfig,
    pub node_id: NodeId,
    pub(crate) ids: IdGen,
    pub cleaner: Arc<Cleaner>,

    pub(crate) raws: Mutex<HashMap<RawConnId, Arc<RawConnection>>>,
    pub(crate) raw_by_node: Mutex<HashMap<NodeId, RawConnId>>,
    pub(crate) peers: Mutex<HashMap<LocalConnId, Arc<PeerConnection>>>,

    pub(crate) pending: Mutex<HashMap<MsgId, PendingRequest>>,
    pub(crate) unacked: Mutex<HashMap<MsgId, Unacked>>,
    pub(crate) suspicious: Mutex<HashMap<NodeId, Instant>>,
    /// Nodes that recently failed direct datagram dialing.
    pub(crate) indirect: Mutex<HashMap<NodeId, Instant>>,
    /// Portal URLs learned from Hello replies, for singleton recovery.
    pub(crate) portal_urls: Mutex<Vec<String>>,

    pub(crate) rings: Mutex<BTreeMap<Key, Arc<RingNode>>>,
    pub(crate) apps: Mutex<HashMap<String, Arc<dyn AppHandler>>>,
    /// Hooks run between position validation and the SetRJoin step of a
    /// join (replica prefetch and the like).
    pub(crate) join_hooks: Mutex<Vec<JoinHook>>,
    /// In-flight range-query state, keyed by the request's msg id.
    pub(crate) rq_states: Mutex<HashMap<MsgId, Arc<crate::ring::rq::RqState>>>,
    /// Replaced finger entries we half-closed, awaiting the remote close.
    pub(crate) ft_half_close: Mutex<std::collections::HashSet<LocalConnId>>,
    /// Connections the remote half-closed while we still use them.
    pub(crate) ft_remote_closed: Mutex<std::collections::HashSet<LocalConnId>>,

    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) datagram: Option<Arc<dyn DatagramFactory>>,
    loopback: std::sync::OnceLock<Arc<RawConnection>>,

    events: mpsc::UnboundedSender<NodeEvent>,
    muted: AtomicBool,
    destroyed: AtomicBool,
}

impl Node {
    /// Build a node and start its housekeeping timers. The receiver gets
    /// the observable event stream.
    pub fn new(
        mut config: NodeConfig,
        dialer: Arc<dyn Dialer>,
        datagram: Option<Arc<dyn DatagramFactory>>,
    ) -> (Arc<Node>, mpsc::UnboundedReceiver<NodeEvent>) {
        let node_id = match config.node_id.take() {
            Some(id) => NodeId(id),
            None => NodeId::generate(),
        };
        if datagram.is_none() {
            config.supports_datagram = false;
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let node = Arc::new(Node {
            node_id: node_id.clone(),
            ids: IdGen::new(node_id.clone()),
            cleaner: Cleaner::new(format!("node-{}", node_id.short())),
            raws: Mutex::new(HashMap::new()),
            raw_by_node: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            unacked: Mutex::new(HashMap::new()),
            suspicious: Mutex::new(HashMap::new()),
            indirect: Mutex::new(HashMap::new()),
            portal_urls: Mutex::new(Vec::new()),
            rings: Mutex::new(BTreeMap::new()),
            apps: Mutex::new(HashMap::new()),
            join_hooks: Mutex::new(Vec::new()),
            rq_states: Mutex::new(HashMap::new()),
            ft_half_close: Mutex::new(std::collections::HashSet::new()),
            ft_remote_closed: Mutex::new(std::collections::HashSet::new()),
            dialer,
            datagram,
            loopback: std::sync::OnceLock::new(),
            events: event_tx,
            muted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            config,
        });

        let loopback = node.attach_loopback();
        let _ = node.loopback.set(loopback);

        // Housekeeping: idle raw sweep plus suspicious/indirect expiry.
        let sweeper = Arc::clone(&node);
        node.cleaner.set_interval(
            "housekeeping",
            std::time::Duration::from_secs(5),
            move || {
                let node = Arc::clone(&sweeper);
                async move {
                    node.sweep_idle_raws();
                    node.expire_marks();
                }
            },
        );

        tracing::info!(node = %node.node_id, portal = node.config.is_portal(), "node started");
        (node, event_rx)
    }

    pub fn loopback(&self) -> Arc<RawConnection> {
        Arc::clone(self.loopback.get().expect("loopback installed in new()"))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear down everything: ring nodes, peer connections, raw links,
    /// timers. Absorbing.
    pub fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = %self.node_id, "destroying node");
        let peers: Vec<Arc<PeerConnection>> = self.peers.lock().values().cloned().collect();
        for pc in peers {
            self.destroy_pc(&pc, false);
        }
        let raw_ids: Vec<RawConnId> = self.raws.lock().keys().copied().collect();
        for id in raw_ids {
            self.destroy_raw(id);
        }
        self.cleaner.clean();
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    // ── Application registry ─────────────────────────────────────

    pub fn register_app(&self, tag: &str, handler: Arc<dyn AppHandler>) {
        self.apps.lock().insert(tag.to_string(), handler);
    }

    pub fn register_join_hook(&self, hook: JoinHook) {
        self.join_hooks.lock().push(hook);
    }

    pub(crate) fn app(&self, tag: &str) -> Option<Arc<dyn AppHandler>> {
        self.apps.lock().get(tag).cloned()
    }

    // ── Mute (testing) ───────────────────────────────────────────

    /// Buffer all outbound traffic instead of transmitting.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
        tracing::debug!(node = %self.node_id, "muted");
    }

    /// Flush every raw connection's pending buffer, arbitrary order.
    pub fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst);
        let raws: Vec<Arc<RawConnection>> = self.raws.lock().values().cloned().collect();
        for raw in raws {
            raw.flush_muted();
        }
        tracing::debug!(node = %self.node_id, "unmuted");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    // ── Registries ───────────────────────────────────────────────

    pub fn peer_by_id(&self, conn: LocalConnId) -> Option<Arc<PeerConnection>> {
        self.peers.lock().get(&conn).cloned()
    }

    pub(crate) fn all_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn ring_node(&self, key: &Key) -> Option<Arc<RingNode>> {
        self.rings.lock().get(key).cloned()
    }

    pub fn ring_nodes(&self) -> Vec<Arc<RingNode>> {
        self.rings.lock().values().cloned().collect()
    }

    pub fn local_keys(&self) -> Vec<Key> {
        self.rings.lock().keys().cloned().collect()
    }

    pub(crate) fn remember_portals(&self, urls: &[String]) {
        let mut portals = self.portal_urls.lock();
        for url in urls {
            if Some(url.as_str()) != self.config.my_url.as_deref() && !portals.contains(url) {
                portals.push(url.clone());
            }
        }
    }

    pub fn known_portals(&self) -> Vec<String> {
        self.portal_urls.lock().clone()
    }

    // ── Envelope construction and sending ────────────────────────

    pub(crate) fn make_envelope(&self, body: Body) -> Envelope {
        Envelope::new(self.ids.next_msg_id(), self.node_id.clone(), body)
    }

    /// Send a body on a raw link. Attaches the per-hop ack request for
    /// non-loopback links and registers the unacked entry.
    pub(crate) fn send_on_raw(self: &Arc<Self>, raw: &Arc<RawConnection>, body: Body) -> Result<MsgId> {
        let env = self.make_envelope(body);
        let msg_id = env.msg_id.clone();
        self.send_envelope_on_raw(raw, env)?;
        Ok(msg_id)
    }

    pub(crate) fn send_envelope_on_raw(
        self: &Arc<Self>,
        raw: &Arc<RawConnection>,
        mut env: Envelope,
    ) -> Result<()> {
        let wants_ack = !raw.kind.is_loopback() && !matches!(env.body, Body::Ack { .. });
        if wants_ack {
            let ack_id = self.ids.next_msg_id();
            env.ack_request_id = Some(ack_id.clone());
            self.register_unacked(ack_id, raw, &env);
        }
        let line = env.encode()?;
        tracing::trace!(node = %self.node_id.short(), raw = %raw.id, tag = env.body.tag(), "send");
        raw.enqueue(line, self.is_muted())
    }

    /// Send an envelope along a node-id path: the hop after us must have a
    /// registered raw link.
    pub(crate) fn send_along_path(self: &Arc<Self>, path: &Path, mut env: Envelope) -> Result<()> {
        env.destination = Some(path.clone());
        let next = if path.first() == Some(&self.node_id) {
            path.next_hop(&self.node_id)
        } else {
            path.first()
        };
        let Some(next) = next else {
            // Path ends here: dispatch locally.
            let node = Arc::clone(self);
            let loopback = self.loopback();
            return node.send_envelope_on_raw(&loopback, env);
        };
        if next == &self.node_id {
            let loopback = self.loopback();
            return self.send_envelope_on_raw(&loopback, env);
        }
        let Some(raw) = self.raw_by_node(next) else {
            tracing::debug!(node = %self.node_id.short(), next = %next.short(), "no raw link for next hop");
            return Err(OverlayError::NotConnected);
        };
        self.send_envelope_on_raw(&raw, env)
    }

    /// Send a body over a peer connection: direct raw when one exists,
    /// otherwise along its best path, falling back across paths.
    pub(crate) fn send_on_pc(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        body: Body,
    ) -> Result<MsgId> {
        let mut env = self.make_envelope(body);
        if self.config.enable_sequencing {
            env.sequence = Some(pc.next_send_seq());
        }
        let msg_id = env.msg_id.clone();
        self.send_envelope_on_pc(pc, env)?;
        Ok(msg_id)
    }

    pub(crate) fn send_envelope_on_pc(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        mut env: Envelope,
    ) -> Result<()> {
        if pc.state() == crate::peer::PcState::Destroyed {
            return Err(OverlayError::NotConnected);
        }
        if let Some(raw_id) = pc.raw() {
            if let Some(raw) = self.raw_by_id(raw_id) {
                if !raw.is_closed() {
                    let mut dest = Path::new(vec![
                        self.node_id.clone(),
                        raw.remote().unwrap_or_else(|| self.node_id.clone()),
                    ]);
                    dest.conn = pc.remote_conn();
                    env.destination = Some(dest);
                    return self.send_envelope_on_raw(&raw, env);
                }
            }
        }
        // Relayed: try paths best-first.
        let paths = pc.paths();
        if paths.is_empty() {
            return Err(OverlayError::NotConnected);
        }
        for path in &paths {
            let mut dest = path.clone();
            dest.conn = pc.remote_conn();
            match self.send_along_path(&dest, env.clone()) {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
        Err(OverlayError::NotConnected)
    }

    /// Reply to a received message: the source path, prepended on every
    /// hop, is already the route home.
    pub(crate) fn reply_along(
        self: &Arc<Self>,
        source: &Path,
        conn: Option<LocalConnId>,
        body: Body,
    ) -> Result<()> {
        let mut dest = source.clone();
        dest.conn = conn;
        let env = self.make_envelope(body);
        self.send_along_path(&dest, env)
    }

    // ── Receive pipeline ─────────────────────────────────────────

    pub(crate) async fn handle_envelope(self: Arc<Self>, mut env: Envelope, raw_id: Option<RawConnId>) {
        if self.is_destroyed() {
            return;
        }
        let raw = raw_id.and_then(|id| self.raw_by_id(id));
        if let Some(ref raw) = raw {
            raw.touch();
            // Traffic from a suspicious node clears the mark early.
            if let Some(remote) = raw.remote() {
                self.clear_suspicious(&remote);
            }
        }

        // Session-level messages never route.
        match env.body {
            Body::Hello { .. } | Body::HelloReply { .. } => {
                if let Some(raw) = raw {
                    self.handle_hello(env, raw).await;
                }
                return;
            }
            Body::Ack { ref ack_reply_id } => {
                self.handle_ack(ack_reply_id.clone());
                return;
            }
            Body::GracefulCloseRaw => {
                if let Some(raw) = raw {
                    tracing::debug!(raw = %raw.id, "peer closed raw link gracefully");
                    raw.mark_graceful();
                    self.destroy_raw(raw.id);
                }
                return;
            }
            _ => {}
        }

        // Source update: prepend ourselves, collapse loops.
        env.source.prepend(self.node_id.clone());
        env.source.collapse_loops();

        // Per-hop ack.
        if let Some(ack_id) = env.ack_request_id.take() {
            if let Some(ref raw) = raw {
                if !raw.kind.is_loopback() {
                    let _ = self.send_on_raw(raw, Body::Ack { ack_reply_id: ack_id });
                }
            }
        }

        // Routing: are we the final hop?
        let final_here = match env.destination {
            None => true,
            Some(ref dest) => dest.last() == Some(&self.node_id),
        };
        if !final_here {
            // Dead-link notifications are applied at every hop en route.
            if let Body::NoNextHopNotify { ref from, ref to } = env.body {
                self.remove_dead_link(from.clone(), to.clone());
            }
            self.forward_envelope(env);
            return;
        }

        // Addressed to one of our peer connections?
        if let Some(conn) = env.dest_conn() {
            let Some(pc) = self.peer_by_id(conn) else {
                tracing::debug!(node = %self.node_id.short(), %conn, tag = env.body.tag(),
                    "message for unknown peer connection");
                let _ = self.reply_along(&env.source, None, Body::ClosePeerConnection);
                return;
            };
            if !pc.check_and_record_msg(&env.msg_id, self.config.expire_received_ids) {
                tracing::trace!(node = %self.node_id.short(), %conn, msg = %env.msg_id, "duplicate dropped");
                return;
            }
            if self.config.enable_sequencing {
                if let Some(seq) = env.sequence {
                    if !pc.accept_sequence(seq) {
                        tracing::trace!(%conn, seq, "stale sequence dropped");
                        return;
                    }
                }
            }
            self.dispatch(env, Some(pc), raw_id).await;
        } else {
            self.dispatch(env, None, raw_id).await;
        }
    }

    /// Forward a transit envelope toward its destination.
    fn forward_envelope(self: &Arc<Self>, env: Envelope) {
        let Some(dest) = env.destination.clone() else {
            return;
        };
        let source = env.source.clone();
        match self.send_along_path(&dest, env) {
            Ok(()) => {}
            Err(_) => {
                // Tell the upstream nodes the edge after us is gone.
                let next = dest.next_hop(&self.node_id).cloned();
                if let Some(next) = next {
                    tracing::debug!(node = %self.node_id.short(), next = %next.short(),
                        "cannot forward: notifying dead link");
                    let _ = self.reply_along(
                        &source,
                        None,
                        Body::NoNextHopNotify {
                            from: self.node_id.clone(),
                            to: next,
                        },
                    );
                }
            }
        }
    }

    /// Dispatch a message at its final hop.
    async fn dispatch(
        self: &Arc<Self>,
        env: Envelope,
        pc: Option<Arc<PeerConnection>>,
        raw_id: Option<RawConnId>,
    ) {
        // Replies pair with the ongoing-request table.
        if env.body.reply_to().is_some() {
            self.deliver_reply(env, raw_id);
            return;
        }

        let ctx = Ctx {
            msg_id: env.msg_id.clone(),
            source: env.source.clone(),
            pc,
            raw: raw_id,
        };
        let body = env.body;
        match body {
            Body::NoNextHopNotify { from, to } => {
                self.remove_dead_link(from, to);
            }
            Body::ClosePeerConnection => {
                if let Some(pc) = ctx.pc {
                    tracing::debug!(conn = %pc.local_id, "remote closed peer connection");
                    self.destroy_pc(&pc, false);
                }
            }
            Body::ConnectionRequest { creq } => {
                self.handle_connection_request(ctx, creq, None).await;
            }
            Body::DatagramSignal { signal, renegotiate } => {
                self.handle_datagram_signal(ctx, signal, renegotiate);
            }
            Body::ProbePath { probe } => {
                self.handle_probe_path(ctx, probe);
            }
            Body::GetNeighbors => {
                self.handle_get_neighbors(ctx);
            }
            Body::ForwardToPredecessor { target_key, inner } => {
                self.handle_forward_to_predecessor(ctx, target_key, *inner).await;
            }
            Body::JoinLeftCReq { creq, is_repair, allow_singleton } => {
                self.handle_join_left_creq(ctx, creq, is_repair, allow_singleton).await;
            }
            Body::JoinRightCReq { creq } => {
                self.handle_join_right_creq(ctx, creq).await;
            }
            Body::LeaveCReq { creq, leaving_key } => {
                self.handle_leave_creq(ctx, creq, leaving_key).await;
            }
            Body::KeyBasedCReq { creq, exact } => {
                self.handle_key_based_creq(ctx, creq, exact).await;
            }
            Body::SetRJoin { rcur, rnew_seq } => {
                self.handle_set_r_join(ctx, rcur, rnew_seq);
            }
            Body::SetRLeave { rcur, rnew_seq, rnew_key, rnew_node } => {
                self.handle_set_r_leave(ctx, rcur, rnew_seq, rnew_key, rnew_node).await;
            }
            Body::SetL { seq } => {
                self.handle_set_l(ctx, seq);
            }
            Body::Ping { target_key } => {
                self.handle_ping(ctx, target_key);
            }
            Body::GetRight => {
                self.handle_get_right(ctx);
            }
            Body::Unicast { target_key, payload } => {
                self.handle_unicast(ctx, target_key, payload);
            }
            Body::RQRequest { min, max, payload, retransmission } => {
                self.handle_rq_request(ctx, KeyRange::new(min, max), payload, retransmission);
            }
            Body::FtUpdateCReq { creq, params } => {
                self.handle_ft_update_creq(ctx, creq, params).await;
            }
            Body::PeerConnectionClose => {
                self.handle_peer_connection_close(ctx);
            }
            other => {
                tracing::warn!(node = %self.node_id.short(), tag = other.tag(), "unhandled message");
            }
        }
    }

    // ── Hello handshake ──────────────────────────────────────────

    async fn handle_hello(self: &Arc<Self>, env: Envelope, raw: Arc<RawConnection>) {
        match env.body {
            Body::Hello { network_id, url } => {
                if network_id != self.config.network_id {
                    tracing::warn!(raw = %raw.id, theirs = %network_id, ours = %self.config.network_id,
                        "network id mismatch, closing");
                    let _ = self.send_on_raw(
                        &raw,
                        Body::HelloReply {
                            status: HelloStatus::NetworkMismatch,
                            node_id: self.node_id.clone(),
                            portal_urls: Vec::new(),
                            observed_addr: None,
                        },
                    );
                    self.destroy_raw(raw.id);
                    return;
                }
                let origin = env.source.last().cloned();
                if let Some(origin) = origin {
                    raw.set_remote(origin.clone());
                    raw.set_remote_url(url.clone());
                    self.register_raw_by_node(origin.clone(), raw.id);
                    if let Some(url) = url {
                        self.remember_portals(&[url]);
                    }
                    raw.mark_established();
                    tracing::info!(node = %self.node_id.short(), peer = %origin.short(), raw = %raw.id,
                        "byte-stream session established (accept side)");
                }
                let _ = self.send_on_raw(
                    &raw,
                    Body::HelloReply {
                        status: HelloStatus::Ok,
                        node_id: self.node_id.clone(),
                        portal_urls: self.known_portals(),
                        observed_addr: raw.remote_url(),
                    },
                );
            }
            Body::HelloReply { status, node_id, portal_urls, .. } => {
                if status != HelloStatus::Ok {
                    tracing::warn!(raw = %raw.id, ?status, "hello rejected, closing");
                    self.destroy_raw(raw.id);
                    return;
                }
                raw.set_remote(node_id.clone());
                self.register_raw_by_node(node_id.clone(), raw.id);
                self.remember_portals(&portal_urls);
                raw.mark_established();
                tracing::info!(node = %self.node_id.short(), peer = %node_id.short(), raw = %raw.id,
                    "byte-stream session established (dial side)");
            }
            _ => unreachable!("handle_hello called for hello bodies only"),
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────

    fn expire_marks(&self) {
        let now = Instant::now();
        let suspicious_ttl = self.config.suspicious_node_expiration;
        self.suspicious
            .lock()
            .retain(|_, at| now.duration_since(*at) < suspicious_ttl);
        let indirect_ttl = self.config.indirect_node_expiration;
        self.indirect
            .lock()
            .retain(|_, at| now.duration_since(*at) < indirect_ttl);
    }
}

/// Dispatch context handed to message handlers: where the message came
/// from and which peer connection it was addressed to.
#[derive(Clone)]
pub(crate) struct Ctx {
    pub msg_id: MsgId,
    /// `[self, …, origin]` — already the reply route.
    pub source: Path,
    pub pc: Option<Arc<PeerConnection>>,
    pub raw: Option<RawConnId>,
}

impl Ctx {
    /// The node the message originated at.
    pub fn origin(&self) -> Option<&NodeId> {
        self.source.last()
    }
}
