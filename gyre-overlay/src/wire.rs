//! Wire protocol: envelope framing and the tagged message body set.
//!
//! Every message on a raw link is one newline-delimited JSON object: a
//! common [`Envelope`] header (message id, source path, optional
//! destination, optional per-hop ack request) wrapping a [`Body`] tagged by
//! `"type"`. Unknown tags fail decoding and are logged and dropped by the
//! receive pipeline. Runtime references (manager, raw link, cleaner) never
//! appear on the wire; handlers get them as dispatch context.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RejectReason;
use crate::id::{Key, LocalConnId, MsgId, NodeId};
use crate::keyspace::KeyRange;
use crate::path::Path;
use crate::ring::ddll::LinkSeq;
use crate::ring::ft::FtUpdateParams;

/// Common header for every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: MsgId,
    /// Path back to the origin: each receiving hop prepends itself, so at
    /// any node the source starts with that node and ends at the origin.
    pub source: Path,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Path>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_request_id: Option<MsgId>,
    pub body: Body,
}

impl Envelope {
    pub fn new(msg_id: MsgId, origin: NodeId, body: Body) -> Self {
        Envelope {
            msg_id,
            source: Path::single(origin),
            destination: None,
            sequence: None,
            ack_request_id: None,
            body,
        }
    }

    pub fn with_destination(mut self, destination: Path) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Envelope, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// The destination peer-connection id at the final hop, if addressed
    /// to one.
    pub fn dest_conn(&self) -> Option<LocalConnId> {
        self.destination.as_ref().and_then(|p| p.conn)
    }
}

/// Hello handshake outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelloStatus {
    Ok,
    NetworkMismatch,
}

/// Common fields of every connection request. The accept side answers with
/// a [`ConnectReply`] after running the establishment decision table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CReq {
    /// Key the requestor wants to reach; absent for direct URL dials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<Key>,
    /// Requestor's own ring key, if it participates under one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_key: Option<Key>,
    /// Requestor's local id for the nascent peer connection.
    pub src_conn: LocalConnId,
    pub src_node: NodeId,
    /// Requestor's public URL, if it is a portal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub supports_datagram: bool,
    /// The requestor refuses byte-stream transports.
    #[serde(default)]
    pub datagram_only: bool,
    /// Datagram session offer, when the requestor leads with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// Paths the requestor already knows to itself (relay candidates).
    #[serde(default)]
    pub known_paths: Vec<Path>,
}

/// How the accept side told the requestor to establish the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstablishMode {
    /// Use the raw link the reply travelled on.
    UseThis,
    /// The requestor dials the accept side's URL.
    FromYou,
    /// Run the datagram-stream handshake.
    Datagram,
    /// No direct link: build relay paths.
    Relay,
}

/// Positive half of a connection reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAccept {
    pub mode: EstablishMode,
    pub node: NodeId,
    pub conn: LocalConnId,
    pub key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Datagram answer (or offer, when the accept side leads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// The accept side's known paths to itself (relay candidates).
    #[serde(default)]
    pub paths: Vec<Path>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ConnectReply {
    Accepted(ConnectAccept),
    Rejected { reason: RejectReason },
}

/// Message bodies, tagged by `"type"` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    // ── Session layer ────────────────────────────────────────────
    /// First message on a dialed byte stream.
    Hello {
        network_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    HelloReply {
        status: HelloStatus,
        node_id: NodeId,
        #[serde(default)]
        portal_urls: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observed_addr: Option<String>,
    },
    /// Per-hop acknowledgement.
    Ack { ack_reply_id: MsgId },
    /// A hop on the path lost its next link; upstream nodes drop the edge.
    NoNextHopNotify { from: NodeId, to: NodeId },
    /// Close the addressed peer connection.
    ClosePeerConnection,
    /// Idle-close marker for a raw link.
    GracefulCloseRaw,

    // ── Connection establishment ─────────────────────────────────
    ConnectionRequest {
        #[serde(flatten)]
        creq: CReq,
    },
    ConnectionReply {
        req_msg_id: MsgId,
        #[serde(flatten)]
        reply: ConnectReply,
    },
    /// Datagram-stream signaling along the current path (candidate
    /// trickle, renegotiation).
    DatagramSignal {
        signal: Value,
        #[serde(default)]
        renegotiate: bool,
    },
    /// End-to-end probe of a candidate relay path.
    ProbePath { probe: Vec<NodeId> },
    ProbePathReply { req_msg_id: MsgId, probe: Vec<NodeId> },
    /// Relay maintenance: ask the far end for its live paths.
    GetNeighbors,
    GetNeighborsReply { req_msg_id: MsgId, paths: Vec<Path> },

    // ── Ring membership (DDLL) ───────────────────────────────────
    /// Greedy-routed carrier: forwarded hop by hop until the node closest
    /// below `target_key` handles the embedded request.
    ForwardToPredecessor {
        target_key: Key,
        inner: Box<Body>,
    },
    /// Failure reply when no node could handle the embedded request.
    ForwardToPredecessorReply {
        req_msg_id: MsgId,
        reason: RejectReason,
    },
    /// Connection request from a joining node to its future left neighbor.
    #[serde(rename = "join_left_creq")]
    JoinLeftCReq {
        #[serde(flatten)]
        creq: CReq,
        #[serde(default)]
        is_repair: bool,
        /// Set by portal nodes retrying repair when alone.
        #[serde(default)]
        allow_singleton: bool,
    },
    /// Connection request from a joining node to its future right
    /// neighbor, routed through the left.
    #[serde(rename = "join_right_creq")]
    JoinRightCReq {
        #[serde(flatten)]
        creq: CReq,
    },
    /// Connection request the left neighbor opens to the right on behalf
    /// of a leaving node.
    #[serde(rename = "leave_creq")]
    LeaveCReq {
        #[serde(flatten)]
        creq: CReq,
        leaving_key: Key,
    },
    /// Connect to the node responsible for (or exactly owning) a key.
    #[serde(rename = "key_based_creq")]
    KeyBasedCReq {
        #[serde(flatten)]
        creq: CReq,
        /// Require the exact key, rejecting with `NO_EXACT_KEY` otherwise.
        #[serde(default)]
        exact: bool,
    },
    /// Atomically swap the receiver's right link to the requesting joiner.
    SetRJoin { rcur: Key, rnew_seq: LinkSeq },
    SetRJoinReply {
        req_msg_id: MsgId,
        ack: bool,
        rseq: LinkSeq,
    },
    /// Detach the leaving sender: the receiver re-links to `rnew_key`.
    SetRLeave {
        rcur: Key,
        rnew_seq: LinkSeq,
        rnew_key: Key,
        /// Node hosting `rnew_key`; the initial LeaveCReq routes through
        /// the leaving node to reach it.
        rnew_node: NodeId,
    },
    SetRLeaveReply {
        req_msg_id: MsgId,
        ack: bool,
        rnew_seq: LinkSeq,
    },
    /// Install the sender as the receiver's left neighbor.
    SetL { seq: LinkSeq },
    /// Left-link liveness probe.
    Ping { target_key: Key },
    Pong {
        req_msg_id: MsgId,
        left_succ: Key,
        rseq: LinkSeq,
    },
    GetRight,
    GetRightReply {
        req_msg_id: MsgId,
        node: NodeId,
        key: Key,
    },

    // ── Application traffic ──────────────────────────────────────
    /// Deliver a payload to the node responsible for `target_key`.
    Unicast { target_key: Key, payload: AppPayload },
    UnicastReply { req_msg_id: MsgId, payload: Value },
    /// Range multicast: deliver to every node in `[min, max)`, reducing
    /// replies on the way back.
    #[serde(rename = "rq_request")]
    RQRequest {
        min: Key,
        max: Key,
        payload: AppPayload,
        #[serde(default)]
        retransmission: u32,
    },
    #[serde(rename = "rq_reply")]
    RQReply {
        req_msg_id: MsgId,
        ranges: Vec<KeyRange>,
        values: Vec<Value>,
        /// All gaps covered; no further replies follow.
        #[serde(default)]
        eor: bool,
    },

    // ── Finger table ─────────────────────────────────────────────
    /// Greedy-routed connection request that lands 2^level positions away.
    #[serde(rename = "ft_update_creq")]
    FtUpdateCReq {
        #[serde(flatten)]
        creq: CReq,
        params: FtUpdateParams,
    },
    /// Half-close handshake for a replaced finger entry.
    PeerConnectionClose,
}

/// A user payload carried by unicast and range queries, dispatched through
/// the node's application-handler registry by `app` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPayload {
    pub app: String,
    pub data: Value,
}

impl Body {
    /// Stable tag for logging and reply-type validation.
    pub fn tag(&self) -> &'static str {
        match self {
            Body::Hello { .. } => "hello",
            Body::HelloReply { .. } => "hello_reply",
            Body::Ack { .. } => "ack",
            Body::NoNextHopNotify { .. } => "no_next_hop_notify",
            Body::ClosePeerConnection => "close_peer_connection",
            Body::GracefulCloseRaw => "graceful_close_raw",
            Body::ConnectionRequest { .. } => "connection_request",
            Body::ConnectionReply { .. } => "connection_reply",
            Body::DatagramSignal { .. } => "datagram_signal",
            Body::ProbePath { .. } => "probe_path",
            Body::ProbePathReply { .. } => "probe_path_reply",
            Body::GetNeighbors => "get_neighbors",
            Body::GetNeighborsReply { .. } => "get_neighbors_reply",
            Body::ForwardToPredecessor { .. } => "forward_to_predecessor",
            Body::ForwardToPredecessorReply { .. } => "forward_to_predecessor_reply",
            Body::JoinLeftCReq { .. } => "join_left_creq",
            Body::JoinRightCReq { .. } => "join_right_creq",
            Body::LeaveCReq { .. } => "leave_creq",
            Body::KeyBasedCReq { .. } => "key_based_creq",
            Body::SetRJoin { .. } => "set_r_join",
            Body::SetRJoinReply { .. } => "set_r_join_reply",
            Body::SetRLeave { .. } => "set_r_leave",
            Body::SetRLeaveReply { .. } => "set_r_leave_reply",
            Body::SetL { .. } => "set_l",
            Body::Ping { .. } => "ping",
            Body::Pong { .. } => "pong",
            Body::GetRight => "get_right",
            Body::GetRightReply { .. } => "get_right_reply",
            Body::Unicast { .. } => "unicast",
            Body::UnicastReply { .. } => "unicast_reply",
            Body::RQRequest { .. } => "rq_request",
            Body::RQReply { .. } => "rq_reply",
            Body::FtUpdateCReq { .. } => "ft_update_creq",
            Body::PeerConnectionClose => "peer_connection_close",
        }
    }

    /// The request id a reply answers, when this body is a reply.
    pub fn reply_to(&self) -> Option<&MsgId> {
        match self {
            Body::ConnectionReply { req_msg_id, .. }
            | Body::ForwardToPredecessorReply { req_msg_id, .. }
            | Body::ProbePathReply { req_msg_id, .. }
            | Body::GetNeighborsReply { req_msg_id, .. }
            | Body::SetRJoinReply { req_msg_id, .. }
            | Body::SetRLeaveReply { req_msg_id, .. }
            | Body::Pong { req_msg_id, .. }
            | Body::GetRightReply { req_msg_id, .. }
            | Body::UnicastReply { req_msg_id, .. }
            | Body::RQReply { req_msg_id, .. } => Some(req_msg_id),
            _ => None,
        }
    }

    /// The connection-request fields, for the variants that carry them.
    pub fn creq(&self) -> Option<&CReq> {
        match self {
            Body::ConnectionRequest { creq }
            | Body::JoinLeftCReq { creq, .. }
            | Body::JoinRightCReq { creq }
            | Body::LeaveCReq { creq, .. }
            | Body::KeyBasedCReq { creq, .. }
            | Body::FtUpdateCReq { creq, .. } => Some(creq),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdGen;

    fn envelope(body: Body) -> Envelope {
        let ids = IdGen::new(NodeId::from("origin"));
        Envelope::new(ids.next_msg_id(), NodeId::from("origin"), body)
    }

    #[test]
    fn round_trips_tagged_body() {
        let env = envelope(Body::Ping {
            target_key: Key::from("05"),
        });
        let line = env.encode().unwrap();
        assert!(line.contains("\"type\":\"ping\""));
        let back = Envelope::decode(&line).unwrap();
        assert_eq!(back.msg_id, env.msg_id);
        assert_eq!(back.body.tag(), "ping");
    }

    #[test]
    fn unknown_tag_fails_decode() {
        let line = r#"{"msg_id":"x:1","source":{"nodes":["x"]},"body":{"type":"warp_drive"}}"#;
        assert!(Envelope::decode(line).is_err());
    }

    #[test]
    fn transient_fields_stay_off_the_wire() {
        let env = envelope(Body::GetNeighbors);
        let line = env.encode().unwrap();
        // No destination, sequence, or ack id was set: none serialized.
        assert!(!line.contains("destination"));
        assert!(!line.contains("sequence"));
        assert!(!line.contains("ack_request_id"));
    }

    #[test]
    fn forward_to_predecessor_embeds_inner_request() {
        let creq = CReq {
            target_key: Some(Key::from("05")),
            src_key: Some(Key::from("03")),
            src_conn: LocalConnId(7),
            src_node: NodeId::from("joiner"),
            url: None,
            supports_datagram: false,
            datagram_only: false,
            sdp: None,
            known_paths: vec![],
        };
        let env = envelope(Body::ForwardToPredecessor {
            target_key: Key::from("05"),
            inner: Box::new(Body::JoinLeftCReq {
                creq,
                is_repair: false,
                allow_singleton: false,
            }),
        });
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        match back.body {
            Body::ForwardToPredecessor { inner, .. } => {
                assert_eq!(inner.tag(), "join_left_creq");
            }
            other => panic!("wrong body: {}", other.tag()),
        }
    }
}
