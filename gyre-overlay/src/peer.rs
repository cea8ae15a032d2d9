//! Logical peer connections.
//!
//! A [`PeerConnection`] is a channel addressed by `(local, remote)`
//! connection ids, multiplexed over whatever raw transport or relay paths
//! currently reach the remote node. The state machine follows the
//! establishment flow: a connect side waits for the connection reply and
//! then for the transport chosen by the accept side's decision table; the
//! accept side waits for the matching inbound event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cleaner::Cleaner;
use crate::error::RejectReason;
use crate::id::{Key, LocalConnId, MsgId, NodeId, RawConnId};
use crate::path::Path;
use crate::wire::EstablishMode;

/// Peer-connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcState {
    Disconnected,
    // Connect side.
    CWaitConnectionReply,
    CWsConnectingDirect,
    CWaitEstablishDatagram,
    CWaitEstablishRelay,
    // Accept side.
    AWsConnectingDirect,
    AWaitHello,
    AWaitEstablishDatagram,
    AWaitRelay,
    Connected,
    Rejected,
    Error,
    Destroyed,
}

impl PcState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PcState::Destroyed)
    }

    /// States in which a datagram session is still being negotiated. Dead
    /// links are not pruned from these connections: they may legitimately
    /// have no raw link yet.
    pub fn is_datagram_establishing(self) -> bool {
        matches!(
            self,
            PcState::CWaitEstablishDatagram | PcState::AWaitEstablishDatagram
        )
    }

    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            PcState::CWaitConnectionReply
                | PcState::CWsConnectingDirect
                | PcState::CWaitEstablishDatagram
                | PcState::CWaitEstablishRelay
                | PcState::AWsConnectingDirect
                | PcState::AWaitHello
                | PcState::AWaitEstablishDatagram
                | PcState::AWaitRelay
        )
    }
}

pub struct PeerConnection {
    pub local_id: LocalConnId,
    pub local_key: Key,
    pub cleaner: Arc<Cleaner>,

    state: Mutex<PcState>,
    remote_node: Mutex<Option<NodeId>>,
    remote_key: Mutex<Option<Key>>,
    remote_conn: Mutex<Option<LocalConnId>>,
    /// Direct raw link, when one exists.
    raw: Mutex<Option<RawConnId>>,
    /// Non-empty while connected: every path starts at the local node.
    paths: Mutex<Vec<Path>>,
    /// Received message ids → receive time, for dedup across paths.
    dedup: Mutex<HashMap<MsgId, Instant>>,
    /// Sequencing counters; feature-gated off by default.
    next_send_seq: Mutex<u64>,
    next_expect_seq: Mutex<u64>,
    on_disconnect: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    /// Signalled on every state change.
    pub(crate) state_changed: Notify,
}

impl PeerConnection {
    pub fn new(
        local_id: LocalConnId,
        local_key: Key,
        state: PcState,
        parent: &Arc<Cleaner>,
    ) -> Arc<Self> {
        Arc::new(PeerConnection {
            local_id,
            local_key,
            cleaner: parent.child(format!("{local_id}")),
            state: Mutex::new(state),
            remote_node: Mutex::new(None),
            remote_key: Mutex::new(None),
            remote_conn: Mutex::new(None),
            raw: Mutex::new(None),
            paths: Mutex::new(Vec::new()),
            dedup: Mutex::new(HashMap::new()),
            next_send_seq: Mutex::new(0),
            next_expect_seq: Mutex::new(0),
            on_disconnect: Mutex::new(Vec::new()),
            state_changed: Notify::new(),
        })
    }

    pub fn state(&self) -> PcState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: PcState) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        tracing::debug!(conn = %self.local_id, from = ?*state, to = ?next, "peer connection state");
        *state = next;
        drop(state);
        self.state_changed.notify_waiters();
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PcState::Connected
    }

    pub fn remote_node(&self) -> Option<NodeId> {
        self.remote_node.lock().clone()
    }

    pub fn set_remote_node(&self, node: NodeId) {
        *self.remote_node.lock() = Some(node);
    }

    pub fn remote_key(&self) -> Option<Key> {
        self.remote_key.lock().clone()
    }

    pub fn set_remote_key(&self, key: Key) {
        *self.remote_key.lock() = Some(key);
    }

    pub fn remote_conn(&self) -> Option<LocalConnId> {
        *self.remote_conn.lock()
    }

    /// The remote connection id is learned once, from the reply, and is
    /// immutable thereafter.
    pub fn set_remote_conn(&self, conn: LocalConnId) {
        let mut slot = self.remote_conn.lock();
        if slot.is_none() {
            *slot = Some(conn);
        }
    }

    pub fn raw(&self) -> Option<RawConnId> {
        *self.raw.lock()
    }

    pub fn set_raw(&self, raw: Option<RawConnId>) {
        *self.raw.lock() = raw;
    }

    pub fn paths(&self) -> Vec<Path> {
        self.paths.lock().clone()
    }

    /// Primary path: the lowest-score live path.
    pub fn primary_path(&self) -> Option<Path> {
        self.paths.lock().first().cloned()
    }

    /// Add a path (deduplicated, score-sorted). Returns true if new.
    pub fn add_path(&self, mut path: Path) -> bool {
        path.collapse_loops();
        let mut paths = self.paths.lock();
        if paths.contains(&path) {
            return false;
        }
        paths.push(path);
        paths.sort_by_key(|p| p.score());
        true
    }

    pub fn set_paths(&self, mut new_paths: Vec<Path>) {
        new_paths.sort_by_key(|p| p.score());
        new_paths.dedup();
        *self.paths.lock() = new_paths;
    }

    /// Drop every path traversing the dead edge. Returns the number of
    /// paths left.
    pub fn remove_paths_with_edge(&self, from: &NodeId, to: &NodeId) -> usize {
        let mut paths = self.paths.lock();
        paths.retain(|p| !p.has_edge(from, to) && !p.has_edge(to, from));
        paths.len()
    }

    /// Dedup check: true if the message id is fresh.
    pub fn check_and_record_msg(&self, msg_id: &MsgId, retention: std::time::Duration) -> bool {
        let now = Instant::now();
        let mut dedup = self.dedup.lock();
        dedup.retain(|_, seen| now.duration_since(*seen) < retention);
        if dedup.contains_key(msg_id) {
            return false;
        }
        dedup.insert(msg_id.clone(), now);
        true
    }

    pub fn next_send_seq(&self) -> u64 {
        let mut seq = self.next_send_seq.lock();
        let v = *seq;
        *seq += 1;
        v
    }

    /// Sequencing check (only consulted when the feature is enabled):
    /// accepts the expected sequence or anything newer.
    pub fn accept_sequence(&self, seq: u64) -> bool {
        let mut expect = self.next_expect_seq.lock();
        if seq < *expect {
            return false;
        }
        *expect = seq + 1;
        true
    }

    pub fn add_disconnect_callback(&self, cb: impl FnOnce() + Send + 'static) {
        if self.state() == PcState::Destroyed {
            cb();
            return;
        }
        self.on_disconnect.lock().push(Box::new(cb));
    }

    pub(crate) fn take_disconnect_callbacks(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        std::mem::take(&mut *self.on_disconnect.lock())
    }

    /// Wait until the connection reaches a settled state.
    pub async fn wait_connected(&self, timeout: std::time::Duration) -> PcState {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.state();
            if !state.is_establishing() {
                return state;
            }
            let notified = self.state_changed.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.state();
            }
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("local_id", &self.local_id)
            .field("state", &self.state())
            .field("remote_node", &self.remote_node())
            .field("remote_key", &self.remote_key())
            .field("paths", &self.paths.lock().len())
            .finish()
    }
}

/// Inputs to the accept side's establishment decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput {
    /// A live raw link to the requestor already exists.
    pub existing_direct: bool,
    /// That link is a datagram stream.
    pub existing_is_datagram: bool,
    /// The requestor refuses byte-stream transports.
    pub req_datagram_only: bool,
    /// Both ends support datagram streams.
    pub both_datagram: bool,
    pub accept_has_url: bool,
    pub req_has_url: bool,
    /// The requestor is remembered as unreachable by direct dialing.
    pub indirect_history: bool,
    pub always_relay: bool,
}

/// What the accept side decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Mode(EstablishMode),
    /// Datagram handshake, falling back to relay if it fails.
    DatagramThenRelay,
    Reject(RejectReason),
}

/// The establishment decision table (§ connection manager). Capability
/// rows are evaluated top to bottom.
pub fn decide_establishment(input: DecisionInput) -> Decision {
    use EstablishMode::*;
    if input.existing_direct {
        if input.req_datagram_only && !input.existing_is_datagram {
            return Decision::Reject(RejectReason::Constraint);
        }
        return Decision::Mode(UseThis);
    }
    if input.req_datagram_only {
        if !input.both_datagram {
            return Decision::Reject(RejectReason::Constraint);
        }
        return Decision::Mode(Datagram);
    }
    if input.indirect_history || input.always_relay {
        return Decision::Mode(Relay);
    }
    if input.req_has_url {
        // We dial the requestor's URL and reply over the fresh link.
        return Decision::Mode(FromYou);
    }
    if input.accept_has_url {
        // The requestor dials us; relay is the fallback.
        return Decision::Mode(UseThis);
    }
    if input.both_datagram {
        return Decision::DatagramThenRelay;
    }
    Decision::Mode(Relay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DecisionInput {
        DecisionInput {
            existing_direct: false,
            existing_is_datagram: false,
            req_datagram_only: false,
            both_datagram: false,
            accept_has_url: false,
            req_has_url: false,
            indirect_history: false,
            always_relay: false,
        }
    }

    #[test]
    fn existing_direct_is_reused() {
        let d = decide_establishment(DecisionInput {
            existing_direct: true,
            ..base()
        });
        assert_eq!(d, Decision::Mode(EstablishMode::UseThis));
    }

    #[test]
    fn datagram_only_over_byte_stream_is_rejected() {
        let d = decide_establishment(DecisionInput {
            existing_direct: true,
            req_datagram_only: true,
            ..base()
        });
        assert_eq!(d, Decision::Reject(RejectReason::Constraint));

        let d = decide_establishment(DecisionInput {
            existing_direct: true,
            existing_is_datagram: true,
            req_datagram_only: true,
            ..base()
        });
        assert_eq!(d, Decision::Mode(EstablishMode::UseThis));
    }

    #[test]
    fn datagram_only_without_support_is_constraint() {
        let d = decide_establishment(DecisionInput {
            req_datagram_only: true,
            ..base()
        });
        assert_eq!(d, Decision::Reject(RejectReason::Constraint));

        let d = decide_establishment(DecisionInput {
            req_datagram_only: true,
            both_datagram: true,
            ..base()
        });
        assert_eq!(d, Decision::Mode(EstablishMode::Datagram));
    }

    #[test]
    fn url_sides_pick_the_dialer() {
        let d = decide_establishment(DecisionInput {
            req_has_url: true,
            ..base()
        });
        assert_eq!(d, Decision::Mode(EstablishMode::FromYou));

        let d = decide_establishment(DecisionInput {
            accept_has_url: true,
            ..base()
        });
        assert_eq!(d, Decision::Mode(EstablishMode::UseThis));
    }

    #[test]
    fn no_direct_option_falls_back_to_datagram_then_relay() {
        let d = decide_establishment(DecisionInput {
            both_datagram: true,
            ..base()
        });
        assert_eq!(d, Decision::DatagramThenRelay);

        let d = decide_establishment(base());
        assert_eq!(d, Decision::Mode(EstablishMode::Relay));
    }

    #[test]
    fn history_and_policy_force_relay() {
        let d = decide_establishment(DecisionInput {
            indirect_history: true,
            req_has_url: true,
            ..base()
        });
        assert_eq!(d, Decision::Mode(EstablishMode::Relay));

        let d = decide_establishment(DecisionInput {
            always_relay: true,
            accept_has_url: true,
            ..base()
        });
        assert_eq!(d, Decision::Mode(EstablishMode::Relay));
    }
}
