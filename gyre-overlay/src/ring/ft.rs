//! Finger-table maintenance.
//!
//! Two tables per ring node: forward (clockwise) and backward. Level 0 is
//! the DDLL right/left; level `l` targets the node `2^l` positions away.
//! Updates ride connection requests routed greedily along lower-level
//! fingers, decrementing the remaining distance at every hop. A request
//! that would walk past its own requester answers `CIRCULATED`, which is
//! the signal that the table has reached the ring's size. Replaced
//! entries go through a half-close handshake so both ends agree before
//! the connection dies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, RejectReason, Result};
use crate::id::{Key, LocalConnId};
use crate::keyspace::is_ordered;
use crate::manager::ConnectTarget;
use crate::node::{Ctx, Node, NodeEvent};
use crate::peer::PeerConnection;
use crate::ring::RingNode;
use crate::ring::ddll::RingStatus;
use crate::wire::{Body, CReq, Envelope};

/// Levels are capped well above any plausible ring size.
const MAX_LEVELS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FtDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FtUpdateKind {
    /// Ordinary table construction by the requester.
    Active,
    /// Triggered on a passing node by a forward update crossing its
    /// halfway point.
    Passive2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtUpdateParams {
    pub direction: FtDirection,
    /// Remaining hops to the target position.
    pub distance: u64,
    pub level: u32,
    /// Key of the entry currently installed at this level, if any; a
    /// request landing on the same node answers `NOT_CHANGED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<Key>,
    pub kind: FtUpdateKind,
}

/// Outcome of one table update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateOutcome {
    Installed,
    /// The table has outgrown the ring; stop at this level.
    Circulated,
    NotChanged,
}

impl Node {
    /// Finger entry at `(direction, level)`. Level 0 is the ring link.
    pub fn ft_entry(&self, ring: &RingNode, direction: FtDirection, level: u32) -> Option<Arc<PeerConnection>> {
        if level == 0 {
            return match direction {
                FtDirection::Forward => self.ring_right_pc(ring),
                FtDirection::Backward => self.ring_left_pc(ring),
            };
        }
        let table = match direction {
            FtDirection::Forward => ring.fft.lock(),
            FtDirection::Backward => ring.bft.lock(),
        };
        table
            .get(level as usize)
            .copied()
            .flatten()
            .and_then(|id| self.peer_by_id(id))
            .filter(|pc| pc.is_connected())
    }

    /// Current table height (highest level with an entry, plus one).
    pub fn ft_height(&self, ring: &RingNode, direction: FtDirection) -> u32 {
        let table = match direction {
            FtDirection::Forward => ring.fft.lock(),
            FtDirection::Backward => ring.bft.lock(),
        };
        table.len() as u32
    }

    fn set_ft_entry(
        self: &Arc<Self>,
        ring: &Arc<RingNode>,
        direction: FtDirection,
        level: u32,
        pc: &Arc<PeerConnection>,
    ) {
        let old = {
            let mut table = match direction {
                FtDirection::Forward => ring.fft.lock(),
                FtDirection::Backward => ring.bft.lock(),
            };
            while table.len() <= level as usize {
                table.push(None);
            }
            std::mem::replace(&mut table[level as usize], Some(pc.local_id))
        };
        self.emit(NodeEvent::FingerUpdated {
            key: ring.key.clone(),
            direction,
            level: level as usize,
        });
        tracing::debug!(key = %ring.key, ?direction, level,
            target = ?pc.remote_key().map(|k| k.to_string()), "finger entry installed");
        if let Some(old) = old {
            if old != pc.local_id {
                self.retire_ft_conn(ring, old);
            }
        }
    }

    /// Drop table levels at and above `level` (the ring is smaller than
    /// the table assumed).
    fn trim_tables(self: &Arc<Self>, ring: &Arc<RingNode>, level: u32) {
        for direction in [FtDirection::Forward, FtDirection::Backward] {
            let removed: Vec<LocalConnId> = {
                let mut table = match direction {
                    FtDirection::Forward => ring.fft.lock(),
                    FtDirection::Backward => ring.bft.lock(),
                };
                if table.len() <= level as usize {
                    continue;
                }
                table.drain(level as usize..).flatten().collect()
            };
            for conn in removed {
                self.retire_ft_conn(ring, conn);
            }
        }
    }

    /// Half-close a replaced finger connection: close immediately if the
    /// remote already sent its close, otherwise announce ours and wait.
    fn retire_ft_conn(self: &Arc<Self>, ring: &Arc<RingNode>, conn: LocalConnId) {
        // Never retire connections the DDLL layer owns.
        if ring.left() == Some(conn) || ring.right() == Some(conn) {
            return;
        }
        let Some(pc) = self.peer_by_id(conn) else {
            return;
        };
        if self.ft_remote_closed.lock().remove(&conn) {
            let _ = self.send_on_pc(&pc, Body::PeerConnectionClose);
            self.destroy_pc(&pc, false);
            return;
        }
        let _ = self.send_on_pc(&pc, Body::PeerConnectionClose);
        self.ft_half_close.lock().insert(conn);
    }

    /// The remote half-closed a connection.
    pub(crate) fn handle_peer_connection_close(self: &Arc<Self>, ctx: Ctx) {
        let Some(pc) = ctx.pc else {
            return;
        };
        if self.ft_half_close.lock().remove(&pc.local_id) {
            // Both halves agreed: finish the close.
            self.destroy_pc(&pc, false);
            return;
        }
        let in_use = self.ring_nodes().iter().any(|ring| {
            ring.left() == Some(pc.local_id)
                || ring.right() == Some(pc.local_id)
                || ring.fft.lock().contains(&Some(pc.local_id))
                || ring.bft.lock().contains(&Some(pc.local_id))
        });
        if in_use {
            // We still route over it; close on our next replacement.
            self.ft_remote_closed.lock().insert(pc.local_id);
        } else {
            let _ = self.send_on_pc(&pc, Body::PeerConnectionClose);
            self.destroy_pc(&pc, false);
        }
    }

    // ── Table construction ───────────────────────────────────────

    pub(crate) fn start_finger_maintenance(self: &Arc<Self>, ring: &Arc<RingNode>) {
        let node = Arc::clone(self);
        let ring_for_timer = Arc::clone(ring);
        ring.cleaner.set_interval(
            "ft-refresh",
            self.config.ft_update_period,
            move || {
                let node = Arc::clone(&node);
                let ring = Arc::clone(&ring_for_timer);
                async move {
                    node.refresh_fingers(&ring).await;
                }
            },
        );
    }

    /// One full construction/refresh pass over both tables.
    pub async fn refresh_fingers(self: &Arc<Self>, ring: &Arc<RingNode>) {
        if ring.status() != RingStatus::In || ring.is_repairing() {
            return;
        }
        for direction in [FtDirection::Forward, FtDirection::Backward] {
            for level in 1..=MAX_LEVELS {
                match self
                    .update_table(ring, direction, level, FtUpdateKind::Active)
                    .await
                {
                    Ok(UpdateOutcome::Installed) | Ok(UpdateOutcome::NotChanged) => continue,
                    Ok(UpdateOutcome::Circulated) => break,
                    Err(e) => {
                        tracing::debug!(key = %ring.key, ?direction, level,
                            "finger update stopped: {e}");
                        break;
                    }
                }
            }
        }
    }

    async fn update_table(
        self: &Arc<Self>,
        ring: &Arc<RingNode>,
        direction: FtDirection,
        level: u32,
        kind: FtUpdateKind,
    ) -> Result<UpdateOutcome> {
        let prev = self
            .ft_entry(ring, direction, level - 1)
            .ok_or(OverlayError::NotConnected)?;
        let source_key = self
            .ft_entry(ring, direction, level)
            .and_then(|pc| pc.remote_key());
        // The send along the level-1 finger is itself the first hop, so
        // the wire distance is 2^level net of that step.
        let params = FtUpdateParams {
            direction,
            distance: (1u64 << level) - (1u64 << (level - 1)),
            level,
            source_key,
            kind,
        };
        let target = ring.key.clone();
        let result = self
            .connect_with_body(
                ring.key.clone(),
                ConnectTarget::Pc(prev.local_id),
                Some(Box::new(move |creq| Body::FtUpdateCReq {
                    creq: CReq {
                        target_key: Some(target),
                        ..creq
                    },
                    params,
                })),
            )
            .await;
        match result {
            Ok(pc) => {
                self.set_ft_entry(ring, direction, level, &pc);
                Ok(UpdateOutcome::Installed)
            }
            Err(OverlayError::Rejected(RejectReason::Circulated)) => {
                tracing::debug!(key = %ring.key, ?direction, level, "table circulated, trimming");
                self.trim_tables(ring, level);
                Ok(UpdateOutcome::Circulated)
            }
            Err(OverlayError::Rejected(RejectReason::NotChanged)) => Ok(UpdateOutcome::NotChanged),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn teardown_fingers(self: &Arc<Self>, ring: &Arc<RingNode>) {
        let mut conns: Vec<LocalConnId> = Vec::new();
        conns.extend(ring.fft.lock().drain(..).flatten());
        conns.extend(ring.bft.lock().drain(..).flatten());
        for conn in conns {
            if let Some(pc) = self.peer_by_id(conn) {
                self.close_pc(&pc);
            }
        }
    }

    // ── Request routing ──────────────────────────────────────────

    /// Greedy hop of a finger-table update: accept at distance zero,
    /// otherwise subtract the biggest usable finger step and pass it on.
    pub(crate) async fn handle_ft_update_creq(self: &Arc<Self>, ctx: Ctx, creq: CReq, params: FtUpdateParams) {
        let ring = ctx
            .pc
            .as_ref()
            .and_then(|pc| self.ring_node(&pc.local_key))
            .or_else(|| {
                self.ring_nodes()
                    .into_iter()
                    .find(|r| r.status() == RingStatus::In)
            });
        let Some(ring) = ring else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };

        if params.distance == 0 {
            if params.source_key.as_ref() == Some(&ring.key) {
                // Same target as before: the requester keeps its entry.
                self.reject_connection(&ctx, &creq, RejectReason::NotChanged);
                return;
            }
            let _ = self.accept_connection(&ctx, &creq, ring.key.clone()).await;
            return;
        }

        // Pick the biggest finger not exceeding the remaining distance,
        // bounded by the request's own level.
        let max_level = params.level.saturating_sub(1).min(63);
        let mut hop_level = (63 - params.distance.leading_zeros()).min(max_level);
        let mut next = None;
        loop {
            if let Some(pc) = self.ft_entry(&ring, params.direction, hop_level) {
                next = Some((hop_level, pc));
                break;
            }
            if hop_level == 0 {
                break;
            }
            hop_level -= 1;
        }
        let Some((hop_level, next_pc)) = next else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };
        let Some(next_key) = next_pc.remote_key() else {
            self.reject_connection(&ctx, &creq, RejectReason::Constraint);
            return;
        };

        // Would this hop step past the requester? Then the ring is
        // smaller than the requested distance.
        if let Some(ref requester) = creq.src_key {
            let passes = match params.direction {
                FtDirection::Forward => is_ordered(&ring.key, false, requester, &next_key, true),
                FtDirection::Backward => is_ordered(&next_key, true, requester, &ring.key, false),
            };
            if passes {
                self.reject_connection(&ctx, &creq, RejectReason::Circulated);
                return;
            }
        }

        let step = 1u64 << hop_level;
        let remaining = params.distance.saturating_sub(step);

        // Passive update 2: the node sitting at the halfway point of a
        // forward update refreshes its own backward entry at the same
        // level, toward the requester.
        let full = 1u64 << params.level;
        if params.direction == FtDirection::Forward
            && params.kind == FtUpdateKind::Active
            && params.distance == full / 2
        {
            let node = Arc::clone(self);
            let ring_for_update = Arc::clone(&ring);
            let level = params.level;
            tokio::spawn(async move {
                let _ = node
                    .update_table(&ring_for_update, FtDirection::Backward, level, FtUpdateKind::Passive2)
                    .await;
            });
        }

        let env = Envelope {
            msg_id: ctx.msg_id.clone(),
            source: ctx.source.clone(),
            destination: None,
            sequence: None,
            ack_request_id: None,
            body: Body::FtUpdateCReq {
                creq,
                params: FtUpdateParams {
                    distance: remaining,
                    ..params
                },
            },
        };
        if self.send_envelope_on_pc(&next_pc, env).is_err() {
            tracing::debug!(key = %ring.key, "finger update hop unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_round_trip() {
        let params = FtUpdateParams {
            direction: FtDirection::Forward,
            distance: 8,
            level: 3,
            source_key: Some(Key::from("05")),
            kind: FtUpdateKind::Active,
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: FtUpdateParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.direction, FtDirection::Forward);
        assert_eq!(back.distance, 8);
        assert_eq!(back.kind, FtUpdateKind::Active);
    }

    #[test]
    fn hop_level_formula_matches_log2() {
        // min(floor(log2(distance)), level-1)
        for (distance, level, want) in [(8u64, 4u32, 3u32), (8, 3, 2), (3, 4, 1), (1, 4, 0)] {
            let max_level = level.saturating_sub(1).min(63);
            let hop = (63 - distance.leading_zeros()).min(max_level);
            assert_eq!(hop, want, "distance {distance} level {level}");
        }
    }
}
