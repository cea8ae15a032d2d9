//! gyre-overlay: a structured peer-to-peer overlay network.
//!
//! Nodes form a logical ring keyed by opaque strings, kept consistent by
//! a distributed doubly-linked-list protocol with self-repair. On top of
//! the ring sit logarithmic finger-table routing and a gap-tracked range
//! multicast. Underneath, a connection manager multiplexes logical peer
//! connections over byte streams, datagram streams, and multi-hop relay
//! paths, with per-hop acks, dedup, and dead-link propagation.
//!
//! The entry point is [`Node`]: build one with a transport
//! [`raw::Dialer`], join a ring with [`Node::add_key`], and talk to it
//! with [`Node::unicast`] and [`Node::range_query`]. Application layers
//! (like the `gyre-kv` store) register [`AppHandler`]s for their payload
//! tags.

pub mod cleaner;
pub mod config;
pub mod error;
pub mod id;
pub mod keyspace;
pub mod manager;
pub mod node;
pub mod path;
pub mod peer;
pub mod raw;
pub mod relay;
pub mod ring;
pub mod runtime;
pub mod wire;

pub use config::NodeConfig;
pub use error::{OverlayError, RejectReason, Result};
pub use id::{Key, LocalConnId, MsgId, NodeId, RawConnId};
pub use keyspace::KeyRange;
pub use manager::ConnectTarget;
pub use node::{AppHandler, Delivery, Node, NodeEvent};
pub use path::Path;
pub use peer::{PcState, PeerConnection};
pub use ring::RingNode;
pub use ring::ddll::{LinkSeq, RingStatus};
pub use ring::ft::FtDirection;
pub use ring::rq::RqEvent;
