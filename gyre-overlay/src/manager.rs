//! Peer-connection lifecycle: connect, accept, reject, close.
//!
//! The connect side sends a connection request and follows whatever
//! establishment mode the accept side's decision table picked: reuse an
//! existing raw link, dial a URL, run the datagram handshake, or build
//! relay paths. Establishment always ends with a `ProbePath` over the
//! chosen route, which is what flips both peer connections to connected —
//! one mechanism regardless of transport.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{OverlayError, RejectReason, Result};
use crate::id::{Key, LocalConnId, NodeId, RawConnId};
use crate::node::{Ctx, Node, NodeEvent};
use crate::path::Path;
use crate::peer::{Decision, DecisionInput, PcState, PeerConnection, decide_establishment};
use crate::raw::{RawConnection, RawKind};
use crate::wire::{Body, CReq, ConnectAccept, ConnectReply, EstablishMode};

/// Where a connection request should be sent.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// Dial a portal URL.
    Url(String),
    /// Over an existing raw link.
    Raw(RawConnId),
    /// Over an existing peer connection.
    Pc(LocalConnId),
    /// Along an explicit multi-hop path.
    Path(Path),
}

impl Node {
    /// Build the common connection-request fields for a nascent peer
    /// connection.
    pub(crate) fn make_creq(
        &self,
        pc: &Arc<PeerConnection>,
        target_key: Option<Key>,
        sdp: Option<String>,
    ) -> CReq {
        CReq {
            target_key,
            src_key: Some(pc.local_key.clone()),
            src_conn: pc.local_id,
            src_node: self.node_id.clone(),
            url: self.config.my_url.clone(),
            supports_datagram: self.config.supports_datagram,
            datagram_only: self.config.datagram_only,
            sdp,
            known_paths: self.own_known_paths(),
        }
    }

    /// Paths from this node to its connected peers; relay candidates
    /// shared with both sides of an establishment.
    pub(crate) fn own_known_paths(&self) -> Vec<Path> {
        let mut out = Vec::new();
        for pc in self.all_peers() {
            if !pc.is_connected() {
                continue;
            }
            for path in pc.paths() {
                if !out.contains(&path) {
                    out.push(path);
                }
            }
            if out.len() >= 16 {
                break;
            }
        }
        out
    }

    pub(crate) fn new_peer_connection(
        self: &Arc<Self>,
        local_key: Key,
        state: PcState,
    ) -> Arc<PeerConnection> {
        let pc = PeerConnection::new(self.ids.next_conn_id(), local_key, state, &self.cleaner);
        self.peers.lock().insert(pc.local_id, Arc::clone(&pc));
        pc
    }

    /// Establish a peer connection to `target`, returning it connected.
    pub async fn connect(self: &Arc<Self>, local_key: Key, target: ConnectTarget) -> Result<Arc<PeerConnection>> {
        self.connect_with_body(local_key, target, None).await
    }

    /// Establish a peer connection whose request body is one of the
    /// connection-request subtypes (join, leave, key-based, finger).
    /// `make_body` receives the prepared common fields.
    pub(crate) async fn connect_with_body(
        self: &Arc<Self>,
        local_key: Key,
        target: ConnectTarget,
        make_body: Option<Box<dyn FnOnce(CReq) -> Body + Send>>,
    ) -> Result<Arc<PeerConnection>> {
        let pc = self.new_peer_connection(local_key, PcState::CWaitConnectionReply);

        // Lead with a datagram offer when we could end up on that mode.
        let mut dg_session = None;
        let sdp = if self.config.supports_datagram {
            match self.datagram.as_ref().unwrap().offer() {
                Ok((session, offer)) => {
                    dg_session = Some(session);
                    Some(offer)
                }
                Err(e) => {
                    tracing::debug!("datagram offer failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let creq = self.make_creq(&pc, None, sdp);
        let body = match make_body {
            Some(f) => f(creq),
            None => Body::ConnectionRequest { creq },
        };

        let result = self.drive_connect(&pc, target, body, dg_session).await;
        match result {
            Ok(()) => Ok(pc),
            Err(e) => {
                self.destroy_pc(&pc, false);
                Err(e)
            }
        }
    }

    async fn drive_connect(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        target: ConnectTarget,
        body: Body,
        dg_session: Option<u64>,
    ) -> Result<()> {
        let (reply_env, reply_raw) = match target {
            ConnectTarget::Url(url) => {
                let raw = self.dial_url(&url).await?;
                self.request_on_raw(&raw, body, "connection_reply").await?
            }
            ConnectTarget::Raw(raw_id) => {
                let raw = self.raw_by_id(raw_id).ok_or(OverlayError::NotConnected)?;
                self.request_on_raw(&raw, body, "connection_reply").await?
            }
            ConnectTarget::Pc(conn) => {
                let via = self.peer_by_id(conn).ok_or(OverlayError::NotConnected)?;
                self.request_on_pc(&via, body, "connection_reply").await?
            }
            ConnectTarget::Path(path) => {
                self.request_along_path(&path, body, "connection_reply", self.config.reply_timeout)
                    .await?
            }
        };

        let Body::ConnectionReply { reply, .. } = reply_env.body else {
            return Err(OverlayError::Internal("reply class checked by runtime".into()));
        };
        let accept = match reply {
            ConnectReply::Rejected { reason } => {
                pc.set_state(PcState::Rejected);
                return Err(OverlayError::Rejected(reason));
            }
            ConnectReply::Accepted(accept) => accept,
        };

        pc.set_remote_node(accept.node.clone());
        pc.set_remote_conn(accept.conn);
        pc.set_remote_key(accept.key.clone());

        let reply_source = reply_env.source.clone();
        match accept.mode {
            EstablishMode::UseThis => self.establish_use_this(pc, &accept, reply_raw).await,
            EstablishMode::FromYou => self.establish_from_you(pc, &accept, reply_raw),
            EstablishMode::Datagram => {
                self.establish_datagram(pc, &accept, dg_session, &reply_source)
                    .await
            }
            EstablishMode::Relay => {
                pc.set_state(PcState::CWaitEstablishRelay);
                self.establish_relay(pc, &accept, &reply_source).await
            }
        }
    }

    /// Use an existing raw link to the accept side, or dial the URL it
    /// advertised; fall back to relay.
    async fn establish_use_this(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        accept: &ConnectAccept,
        reply_raw: Option<RawConnId>,
    ) -> Result<()> {
        // Prefer the link the reply arrived on, when it is a session with
        // the accept node itself.
        let direct = reply_raw
            .and_then(|id| self.raw_by_id(id))
            .filter(|raw| raw.remote().as_ref() == Some(&accept.node))
            .or_else(|| self.raw_by_node(&accept.node));
        if let Some(raw) = direct {
            return self.bind_direct(pc, &raw).await;
        }
        if let Some(ref url) = accept.url {
            pc.set_state(PcState::CWsConnectingDirect);
            match self.dial_url(url).await {
                Ok(raw) => return self.bind_direct(pc, &raw).await,
                Err(e) => {
                    tracing::info!(conn = %pc.local_id, "direct dial failed ({e}), trying relay");
                }
            }
        }
        if self.config.enable_relay {
            pc.set_state(PcState::CWaitEstablishRelay);
            return self
                .establish_relay(pc, accept, &Path::single(self.node_id.clone()))
                .await;
        }
        Err(OverlayError::NotConnected)
    }

    /// The accept side already dialed us; the reply's raw link is the
    /// session to bind.
    fn establish_from_you(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        accept: &ConnectAccept,
        reply_raw: Option<RawConnId>,
    ) -> Result<()> {
        let raw = reply_raw
            .and_then(|id| self.raw_by_id(id))
            .filter(|raw| raw.remote().as_ref() == Some(&accept.node))
            .ok_or(OverlayError::NotConnected)?;
        pc.set_raw(Some(raw.id));
        let mut path = Path::new(vec![self.node_id.clone(), accept.node.clone()]);
        path.conn = Some(accept.conn);
        pc.add_path(path);
        pc.set_state(PcState::Connected);
        tracing::info!(conn = %pc.local_id, peer = %accept.node.short(), "connected (accept side dialed us)");
        Ok(())
    }

    /// Complete the datagram handshake with the answer blob from the
    /// reply, then probe over the fresh session.
    async fn establish_datagram(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        accept: &ConnectAccept,
        dg_session: Option<u64>,
        reply_source: &Path,
    ) -> Result<()> {
        pc.set_state(PcState::CWaitEstablishDatagram);
        let outcome = (|| {
            let factory = self.datagram.as_ref().ok_or(OverlayError::NotConnected)?;
            let session = dg_session.ok_or(OverlayError::NotConnected)?;
            let answer = accept.sdp.as_deref().ok_or(OverlayError::NotConnected)?;
            factory.complete(session, answer).map_err(OverlayError::Io)
        })();
        match outcome {
            Ok(stream) => {
                let raw = self.attach_stream(stream, RawKind::DatagramStream);
                self.send_on_raw(
                    &raw,
                    Body::Hello {
                        network_id: self.config.network_id.clone(),
                        url: self.config.my_url.clone(),
                    },
                )?;
                self.wait_established(&raw).await?;
                self.bind_direct(pc, &raw).await
            }
            Err(e) => {
                tracing::info!(conn = %pc.local_id, peer = %accept.node.short(),
                    "datagram establish failed ({e})");
                self.mark_indirect(accept.node.clone());
                if self.config.enable_relay && !self.config.datagram_only {
                    pc.set_state(PcState::CWaitEstablishRelay);
                    self.establish_relay(pc, accept, reply_source).await
                } else {
                    Err(OverlayError::Timeout("datagram establish"))
                }
            }
        }
    }

    async fn wait_established(&self, raw: &Arc<RawConnection>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.max_raw_establish_time;
        loop {
            if raw.is_established() {
                return Ok(());
            }
            if raw.is_closed() {
                return Err(OverlayError::NotConnected);
            }
            let notified = raw.established_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(OverlayError::Timeout("raw establish"));
            }
        }
    }

    /// Bind a peer connection to a direct raw link and confirm it
    /// end-to-end with a probe.
    pub(crate) async fn bind_direct(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        raw: &Arc<RawConnection>,
    ) -> Result<()> {
        let remote = raw.remote().ok_or(OverlayError::NotConnected)?;
        pc.set_raw(Some(raw.id));
        let mut path = Path::new(vec![self.node_id.clone(), remote.clone()]);
        path.conn = pc.remote_conn();
        pc.add_path(path.clone());

        let probe = Body::ProbePath {
            probe: path.nodes.clone(),
        };
        let mut env = self.make_envelope(probe);
        let msg_id = env.msg_id.clone();
        let mut dest = path;
        dest.conn = pc.remote_conn();
        env.destination = Some(dest);
        let opts = crate::runtime::RequestOptions::single("probe_path_reply", self.config.reply_timeout)
            .on_conn(pc.local_id);
        let mut rx = self.register_pending(&msg_id, opts);
        self.send_envelope_on_raw(raw, env)?;
        match rx.recv().await {
            Some(Ok(_)) => {
                pc.set_state(PcState::Connected);
                tracing::info!(conn = %pc.local_id, peer = %remote.short(), "connected (direct)");
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(OverlayError::Disconnected),
        }
    }

    // ── Accept side ──────────────────────────────────────────────

    /// Handle a plain connection request; the subtype handlers validate
    /// their own protocol conditions first and then call
    /// [`Node::accept_connection`] themselves.
    pub(crate) async fn handle_connection_request(
        self: &Arc<Self>,
        ctx: Ctx,
        creq: CReq,
        local_key: Option<Key>,
    ) {
        let key = local_key
            .or_else(|| self.local_keys().first().cloned())
            .unwrap_or_else(|| Key::from(self.node_id.as_str()));
        if let Err(e) = self.accept_connection(&ctx, &creq, key).await {
            tracing::debug!(peer = %creq.src_node.short(), "connection request failed: {e}");
        }
    }

    /// Run the decision table and reply. Returns the accept-side peer
    /// connection on success.
    pub(crate) async fn accept_connection(
        self: &Arc<Self>,
        ctx: &Ctx,
        creq: &CReq,
        local_key: Key,
    ) -> Result<Arc<PeerConnection>> {
        let existing = self
            .raw_by_node(&creq.src_node)
            .filter(|raw| raw.is_established() && !raw.is_closed());
        let input = DecisionInput {
            existing_direct: existing.is_some(),
            existing_is_datagram: existing
                .as_ref()
                .map(|r| r.kind == RawKind::DatagramStream)
                .unwrap_or(false),
            req_datagram_only: creq.datagram_only,
            both_datagram: self.config.supports_datagram && creq.supports_datagram,
            accept_has_url: self.config.is_portal(),
            req_has_url: creq.url.is_some(),
            indirect_history: self.is_indirect(&creq.src_node),
            always_relay: self.config.always_relay,
        };
        let decision = decide_establishment(input);
        tracing::debug!(peer = %creq.src_node.short(), ?decision, "establishment decision");

        // Relay outcomes need relay enabled on our side.
        let needs_relay = matches!(
            decision,
            Decision::Mode(EstablishMode::Relay) | Decision::DatagramThenRelay
        );
        if needs_relay && !self.config.enable_relay {
            self.reject_connection(ctx, creq, RejectReason::EnableRelayIsOff);
            return Err(OverlayError::Rejected(RejectReason::EnableRelayIsOff));
        }

        let pc = self.new_peer_connection(local_key.clone(), PcState::Disconnected);
        pc.set_remote_node(creq.src_node.clone());
        pc.set_remote_conn(creq.src_conn);
        if let Some(ref key) = creq.src_key {
            pc.set_remote_key(key.clone());
        }

        // Establishment deadline on the accept side.
        let watchdog = Arc::clone(self);
        let conn = pc.local_id;
        pc.cleaner.set_timer(
            "establish",
            self.config.relay_connection_timeout,
            async move {
                if let Some(pc) = watchdog.peer_by_id(conn) {
                    if pc.state().is_establishing() || pc.state() == PcState::Disconnected {
                        tracing::warn!(%conn, "accept-side establishment timed out");
                        watchdog.destroy_pc(&pc, false);
                    }
                }
            },
        );

        let outcome = match decision {
            Decision::Reject(reason) => {
                self.destroy_pc(&pc, false);
                self.reject_connection(ctx, creq, reason);
                return Err(OverlayError::Rejected(reason));
            }
            Decision::Mode(EstablishMode::UseThis) => {
                if let Some(raw) = existing {
                    pc.set_raw(Some(raw.id));
                    let mut path =
                        Path::new(vec![self.node_id.clone(), creq.src_node.clone()]);
                    path.conn = Some(creq.src_conn);
                    pc.add_path(path);
                    pc.set_state(PcState::Connected);
                    self.send_accept_reply(ctx, creq, &pc, EstablishMode::UseThis, None)
                } else {
                    // We are the portal: the requestor dials our URL and
                    // probes over the fresh link.
                    pc.set_state(PcState::AWaitHello);
                    self.send_accept_reply(ctx, creq, &pc, EstablishMode::UseThis, None)
                }
            }
            Decision::Mode(EstablishMode::FromYou) => {
                self.accept_by_dialing_back(ctx, creq, &pc).await
            }
            Decision::Mode(EstablishMode::Datagram) | Decision::DatagramThenRelay => {
                let fallback_relay = matches!(decision, Decision::DatagramThenRelay);
                self.accept_datagram(ctx, creq, &pc, fallback_relay)
            }
            Decision::Mode(EstablishMode::Relay) => {
                pc.set_state(PcState::AWaitRelay);
                self.send_accept_reply(ctx, creq, &pc, EstablishMode::Relay, None)
            }
        };

        match outcome {
            Ok(()) => Ok(pc),
            Err(e) => {
                self.destroy_pc(&pc, false);
                Err(e)
            }
        }
    }

    /// FROM_YOU: we dial the requestor's URL and carry the reply over the
    /// fresh link, falling back to relay.
    async fn accept_by_dialing_back(
        self: &Arc<Self>,
        ctx: &Ctx,
        creq: &CReq,
        pc: &Arc<PeerConnection>,
    ) -> Result<()> {
        let url = creq.url.clone().ok_or(OverlayError::NotConnected)?;
        pc.set_state(PcState::AWsConnectingDirect);
        match self.dial_url(&url).await {
            Ok(raw) => {
                pc.set_raw(Some(raw.id));
                let mut path = Path::new(vec![self.node_id.clone(), creq.src_node.clone()]);
                path.conn = Some(creq.src_conn);
                pc.add_path(path);
                pc.set_state(PcState::Connected);
                let accept = self.build_accept(pc, EstablishMode::FromYou, None);
                let mut env = self.make_envelope(Body::ConnectionReply {
                    req_msg_id: ctx.msg_id.clone(),
                    reply: ConnectReply::Accepted(accept),
                });
                let mut dest = Path::new(vec![self.node_id.clone(), creq.src_node.clone()]);
                dest.conn = Some(creq.src_conn);
                env.destination = Some(dest);
                self.send_envelope_on_raw(&raw, env)?;
                tracing::info!(conn = %pc.local_id, peer = %creq.src_node.short(),
                    "connected (dialed requestor back)");
                Ok(())
            }
            Err(e) => {
                tracing::info!(peer = %creq.src_node.short(), "dial-back failed ({e}), offering relay");
                if self.config.enable_relay {
                    pc.set_state(PcState::AWaitRelay);
                    self.send_accept_reply(ctx, creq, pc, EstablishMode::Relay, None)
                } else {
                    self.reject_connection(ctx, creq, RejectReason::Constraint);
                    Err(OverlayError::Rejected(RejectReason::Constraint))
                }
            }
        }
    }

    /// Answer the datagram offer carried by the request.
    fn accept_datagram(
        self: &Arc<Self>,
        ctx: &Ctx,
        creq: &CReq,
        pc: &Arc<PeerConnection>,
        fallback_relay: bool,
    ) -> Result<()> {
        let attempt = (|| {
            let factory = self.datagram.as_ref().ok_or(OverlayError::NotConnected)?;
            let offer = creq.sdp.as_deref().ok_or(OverlayError::NotConnected)?;
            factory.answer(offer).map_err(OverlayError::Io)
        })();
        match attempt {
            Ok((stream, answer)) => {
                self.attach_stream(stream, RawKind::DatagramStream);
                pc.set_state(PcState::AWaitEstablishDatagram);
                self.send_accept_reply(ctx, creq, pc, EstablishMode::Datagram, Some(answer))
            }
            Err(e) => {
                tracing::info!(peer = %creq.src_node.short(), "datagram answer failed ({e})");
                self.mark_indirect(creq.src_node.clone());
                if fallback_relay {
                    pc.set_state(PcState::AWaitRelay);
                    self.send_accept_reply(ctx, creq, pc, EstablishMode::Relay, None)
                } else {
                    self.reject_connection(ctx, creq, RejectReason::Constraint);
                    Err(OverlayError::Rejected(RejectReason::Constraint))
                }
            }
        }
    }

    fn build_accept(
        &self,
        pc: &Arc<PeerConnection>,
        mode: EstablishMode,
        sdp: Option<String>,
    ) -> ConnectAccept {
        ConnectAccept {
            mode,
            node: self.node_id.clone(),
            conn: pc.local_id,
            key: pc.local_key.clone(),
            url: self.config.my_url.clone(),
            sdp,
            paths: self.own_known_paths(),
        }
    }

    fn send_accept_reply(
        self: &Arc<Self>,
        ctx: &Ctx,
        creq: &CReq,
        pc: &Arc<PeerConnection>,
        mode: EstablishMode,
        sdp: Option<String>,
    ) -> Result<()> {
        let accept = self.build_accept(pc, mode, sdp);
        self.reply_along(
            &ctx.source,
            Some(creq.src_conn),
            Body::ConnectionReply {
                req_msg_id: ctx.msg_id.clone(),
                reply: ConnectReply::Accepted(accept),
            },
        )
    }

    /// Send a negative reply and drop the pending establishment.
    pub(crate) fn reject_connection(self: &Arc<Self>, ctx: &Ctx, creq: &CReq, reason: RejectReason) {
        tracing::debug!(peer = %creq.src_node.short(), %reason, "rejecting connection request");
        let _ = self.reply_along(
            &ctx.source,
            Some(creq.src_conn),
            Body::ConnectionReply {
                req_msg_id: ctx.msg_id.clone(),
                reply: ConnectReply::Rejected { reason },
            },
        );
    }

    // ── Probes, signals, neighbors ───────────────────────────────

    /// A probe reached us end-to-end: record the traversed route as a live
    /// path and flip to connected if this was the first.
    pub(crate) fn handle_probe_path(self: &Arc<Self>, ctx: Ctx, probe: Vec<NodeId>) {
        let Some(pc) = ctx.pc.clone() else {
            tracing::debug!("probe without peer connection dropped");
            return;
        };
        // The traversed route (our side outward) is the prepended source.
        let mut path = ctx.source.clone();
        path.conn = pc.remote_conn();
        let fresh = pc.add_path(path);
        if fresh {
            tracing::debug!(conn = %pc.local_id, hops = ctx.source.score(), "probe added path");
        }
        // A direct two-hop probe binds the raw link as well.
        if ctx.source.score() == 2 {
            if let Some(raw) = ctx.raw.and_then(|id| self.raw_by_id(id)) {
                if raw.remote().as_ref() == ctx.origin() {
                    pc.set_raw(Some(raw.id));
                }
            }
        }
        if !pc.is_connected() && !pc.state().is_terminal() {
            pc.set_state(PcState::Connected);
            tracing::info!(conn = %pc.local_id, "connected (first probe arrived)");
        }
        let _ = self.reply_along(
            &ctx.source,
            pc.remote_conn(),
            Body::ProbePathReply {
                req_msg_id: ctx.msg_id.clone(),
                probe,
            },
        );
    }

    /// Round-trip a neighbors query over a peer connection: a liveness
    /// check that also returns the far side's current paths.
    pub async fn query_neighbors(self: &Arc<Self>, pc: &Arc<PeerConnection>) -> Result<Vec<Path>> {
        let (reply, _) = self
            .request_on_pc(pc, Body::GetNeighbors, "get_neighbors_reply")
            .await?;
        match reply.body {
            Body::GetNeighborsReply { paths, .. } => Ok(paths),
            _ => Err(OverlayError::Internal("reply class checked by runtime".into())),
        }
    }

    pub(crate) fn handle_get_neighbors(self: &Arc<Self>, ctx: Ctx) {
        let Some(pc) = ctx.pc.clone() else {
            return;
        };
        // This connection's live paths plus our wider neighborhood, so
        // the querier can fold fresh edges into its candidate graph.
        let mut paths = pc.paths();
        for path in self.own_known_paths() {
            if !paths.contains(&path) {
                paths.push(path);
            }
            if paths.len() >= 24 {
                break;
            }
        }
        let _ = self.reply_along(
            &ctx.source,
            pc.remote_conn(),
            Body::GetNeighborsReply {
                req_msg_id: ctx.msg_id.clone(),
                paths,
            },
        );
    }

    /// Send a trickled datagram signal (candidate, renegotiation) to the
    /// far end of a peer connection, along its current path.
    pub fn send_datagram_signal(
        self: &Arc<Self>,
        pc: &Arc<PeerConnection>,
        signal: Value,
        renegotiate: bool,
    ) -> Result<()> {
        if !self.config.enable_signaling {
            return Ok(());
        }
        self.send_on_pc(pc, Body::DatagramSignal { signal, renegotiate })?;
        Ok(())
    }

    pub(crate) fn handle_datagram_signal(self: &Arc<Self>, ctx: Ctx, signal: Value, renegotiate: bool) {
        let Some(factory) = self.datagram.as_ref() else {
            tracing::debug!("datagram signal without factory dropped");
            return;
        };
        if !self.config.enable_signaling {
            return;
        }
        tracing::trace!(conn = ?ctx.pc.as_ref().map(|p| p.local_id), renegotiate, "datagram signal");
        factory.signal(0, &signal);
    }

    // ── Close and destroy ────────────────────────────────────────

    /// Graceful close: tell the remote, then tear down locally.
    pub fn close_pc(self: &Arc<Self>, pc: &Arc<PeerConnection>) {
        let _ = self.send_on_pc(pc, Body::ClosePeerConnection);
        self.destroy_pc(pc, false);
    }

    /// Tear down a peer connection: run disconnect callbacks, fail its
    /// in-flight requests, emit the event, drop it from the registry.
    pub(crate) fn destroy_pc(self: &Arc<Self>, pc: &Arc<PeerConnection>, notify_remote: bool) {
        if pc.state() == PcState::Destroyed {
            return;
        }
        if notify_remote {
            let _ = self.send_on_pc(pc, Body::ClosePeerConnection);
        }
        let was_connected = pc.is_connected();
        pc.set_state(PcState::Disconnected);
        pc.set_state(PcState::Destroyed);
        self.peers.lock().remove(&pc.local_id);
        self.fail_pending_on_conn(pc.local_id);
        pc.cleaner.clean();
        let remote = pc.remote_node();
        tracing::debug!(conn = %pc.local_id, peer = ?remote.as_ref().map(|n| n.short().to_string()),
            was_connected, "peer connection destroyed");
        if was_connected {
            for cb in pc.take_disconnect_callbacks() {
                cb();
            }
            self.emit(NodeEvent::PeerDisconnected {
                conn: pc.local_id,
                remote,
            });
        }
    }
}
