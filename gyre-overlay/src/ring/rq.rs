//! Range queries: retransmission-safe multicast over the ring.
//!
//! A request covers `[min, max)`. Each node partitions its assigned range
//! among the in-range connections it knows, recursing until fragments
//! reach their owners. Replies flow back with the sub-ranges they cover;
//! every node tracks the still-unanswered `Gaps` of its assigned range
//! and reduces reply values on the way up. A flush timer emits partial
//! replies so parents see progress; the originator retransmits over
//! whatever gaps remain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::id::{Key, MsgId};
use crate::keyspace::{KeyRange, PivotMode, circular_sort};
use crate::node::{Ctx, Delivery, Node};
use crate::path::Path;
use crate::peer::PeerConnection;
use crate::ring::{Closest, RingNode};
use crate::ring::ddll::RingStatus;
use crate::runtime::RequestOptions;
use crate::wire::{AppPayload, Body};

/// Ordered set of disjoint sub-ranges still awaiting replies.
#[derive(Debug, Clone)]
pub struct Gaps {
    ranges: Vec<KeyRange>,
}

impl Gaps {
    pub fn new(initial: KeyRange) -> Self {
        Gaps {
            ranges: vec![initial],
        }
    }

    /// Remove a covered range, splitting whatever overlaps it.
    pub fn remove(&mut self, covered: &KeyRange) {
        let mut next = Vec::with_capacity(self.ranges.len() + 1);
        for gap in &self.ranges {
            next.extend(gap.subtract(covered));
        }
        self.ranges = next;
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn to_list(&self) -> Vec<KeyRange> {
        self.ranges.clone()
    }
}

/// Per-request state on an intermediate (or originating) node.
pub struct RqState {
    /// Id of the request we received; replies we emit carry it.
    req_msg_id: MsgId,
    reply_route: Path,
    gaps: Mutex<Gaps>,
    /// Reduced reply values awaiting the next flush.
    acc: Mutex<Vec<Value>>,
    /// Ranges covered since the last flush.
    covered: Mutex<Vec<KeyRange>>,
    done: AtomicBool,
}

/// Events the originator's caller receives.
#[derive(Debug, Clone)]
pub enum RqEvent {
    /// Reduced values from some covered sub-ranges.
    Values(Vec<Value>),
    /// All of `[min, max)` answered.
    End { retransmissions: u32 },
    /// Retries exhausted with gaps remaining.
    Failed { retransmissions: u32 },
}

impl Node {
    // ── Originator ───────────────────────────────────────────────

    /// Multicast `data` to every ring member in `[min, max)`, streaming
    /// reduced replies. Incomplete coverage is retransmitted over the
    /// remaining gaps only.
    pub fn range_query(
        self: &Arc<Self>,
        min: Key,
        max: Key,
        app: &str,
        data: Value,
    ) -> mpsc::UnboundedReceiver<RqEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = Arc::clone(self);
        let payload = AppPayload {
            app: app.to_string(),
            data,
        };
        tokio::spawn(async move {
            node.run_range_query(KeyRange::new(min, max), payload, tx).await;
        });
        rx
    }

    async fn run_range_query(
        self: &Arc<Self>,
        range: KeyRange,
        payload: AppPayload,
        tx: mpsc::UnboundedSender<RqEvent>,
    ) {
        let mut gaps = Gaps::new(range);
        let mut retransmissions = 0u32;
        loop {
            let gap_list = gaps.to_list();
            if gap_list.is_empty() {
                let _ = tx.send(RqEvent::End { retransmissions });
                return;
            }
            if retransmissions > self.config.number_of_retry {
                tracing::warn!(node = %self.node_id.short(), gaps = gap_list.len(),
                    "range query giving up with gaps remaining");
                let _ = tx.send(RqEvent::Failed { retransmissions });
                return;
            }
            if retransmissions > 0 {
                tracing::info!(node = %self.node_id.short(), retransmissions,
                    gaps = gap_list.len(), "retransmitting over remaining gaps");
            }

            let (agg_tx, mut agg_rx) = mpsc::unbounded_channel::<Body>();
            for gap in gap_list {
                let env = self.make_envelope(Body::RQRequest {
                    min: gap.from.clone(),
                    max: gap.to.clone(),
                    payload: payload.clone(),
                    retransmission: retransmissions,
                });
                let msg_id = env.msg_id.clone();
                let opts = RequestOptions {
                    timeout: Some(self.config.reply_timeout),
                    expect: "rq_reply",
                    allow_multiple: true,
                    conn: None,
                };
                let mut reply_rx = self.register_pending(&msg_id, opts);
                let loopback = self.loopback();
                if self.send_envelope_on_raw(&loopback, env).is_err() {
                    continue;
                }
                let agg = agg_tx.clone();
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(item) = reply_rx.recv().await {
                        match item {
                            Ok((env, _)) => {
                                let eor = matches!(env.body, Body::RQReply { eor: true, .. });
                                let _ = agg.send(env.body);
                                if eor {
                                    node.finish_pending(&msg_id);
                                    break;
                                }
                            }
                            Err(_) => break, // reply deadline; gaps stay open
                        }
                    }
                });
            }
            drop(agg_tx);

            while let Some(body) = agg_rx.recv().await {
                if let Body::RQReply { ranges, values, .. } = body {
                    for covered in &ranges {
                        gaps.remove(covered);
                    }
                    if !values.is_empty() {
                        let _ = tx.send(RqEvent::Values(values));
                    }
                }
            }
            if gaps.is_empty() {
                let _ = tx.send(RqEvent::End { retransmissions });
                return;
            }
            retransmissions += 1;
        }
    }

    // ── Receive side ─────────────────────────────────────────────

    /// Partition the assigned range among known in-range connections,
    /// recurse into the fragments, answer the local ones, and stream
    /// covered sub-ranges back to the parent.
    pub(crate) fn handle_rq_request(
        self: &Arc<Self>,
        ctx: Ctx,
        range: KeyRange,
        payload: AppPayload,
        retransmission: u32,
    ) {
        enum Delegate {
            Local(Arc<RingNode>),
            Conn(Arc<PeerConnection>),
        }

        let state = Arc::new(RqState {
            req_msg_id: ctx.msg_id.clone(),
            reply_route: ctx.source.clone(),
            gaps: Mutex::new(Gaps::new(range.clone())),
            acc: Mutex::new(Vec::new()),
            covered: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        });
        self.rq_states
            .lock()
            .insert(ctx.msg_id.clone(), Arc::clone(&state));

        // Boundary keys: local keys and connected remotes inside the range.
        let mut boundaries: Vec<(Key, Delegate)> = Vec::new();
        for ring in self.ring_nodes() {
            if matches!(ring.status(), RingStatus::In | RingStatus::Del) && range.contains(&ring.key)
            {
                boundaries.push((ring.key.clone(), Delegate::Local(ring)));
            }
        }
        for (key, pc) in self.peers_in_range(&range) {
            if boundaries.iter().any(|(k, _)| *k == key) {
                continue;
            }
            boundaries.push((key, Delegate::Conn(pc)));
        }
        circular_sort(&range.from, &mut boundaries, PivotMode::Inclusive, |(k, _)| k.clone());

        // Cut the range at each boundary; each fragment's delegate owns
        // its start key.
        let mut fragments: Vec<(KeyRange, Delegate)> = Vec::new();
        if boundaries.first().map(|(k, _)| k) != Some(&range.from) {
            // No member sits exactly on `min`: the closest preceding node
            // owns the head fragment.
            let head_end = boundaries
                .first()
                .map(|(k, _)| k.clone())
                .unwrap_or_else(|| range.to.clone());
            let head = KeyRange::new(range.from.clone(), head_end);
            match self.closest_preceding(&range.from, false) {
                Some(Closest::Local(ring)) => fragments.push((head, Delegate::Local(ring))),
                Some(Closest::Conn(pc)) => fragments.push((head, Delegate::Conn(pc))),
                None => tracing::debug!(range = %range, "range query with no route"),
            }
        }
        let ends: Vec<Key> = boundaries
            .iter()
            .skip(1)
            .map(|(k, _)| k.clone())
            .chain(std::iter::once(range.to.clone()))
            .collect();
        for ((start, delegate), end) in boundaries.into_iter().zip(ends) {
            fragments.push((KeyRange::new(start, end), delegate));
        }

        // Dispatch fragments.
        for (fragment, delegate) in fragments {
            match delegate {
                Delegate::Local(ring) => {
                    let value = match self.app(&payload.app) {
                        Some(handler) => handler.on_receive(
                            self,
                            Delivery {
                                from: fragment.from.clone(),
                                to: fragment.to.clone(),
                                local_key: ring.key.clone(),
                                sender: ctx.origin().cloned().unwrap_or_else(|| self.node_id.clone()),
                                data: payload.data.clone(),
                            },
                        ),
                        None => {
                            tracing::warn!(app = %payload.app, "range query for unregistered app");
                            None
                        }
                    };
                    self.rq_add_reply(&state, vec![fragment], value.into_iter().collect());
                }
                Delegate::Conn(pc) => {
                    self.rq_forward_fragment(&state, &pc, fragment, &payload, retransmission);
                }
            }
        }

        // Flush loop: emit partials until the gaps close or the parent's
        // interest has long expired.
        let node = Arc::clone(self);
        let state_for_timer = Arc::clone(&state);
        let flush_name = format!("rq-flush-{}", state.req_msg_id);
        self.cleaner.set_interval(&flush_name, self.config.rq_flush_period, move || {
            let node = Arc::clone(&node);
            let state = Arc::clone(&state_for_timer);
            async move {
                node.rq_flush(&state, false);
            }
        });
        // An entirely-local answer completes immediately.
        self.rq_flush(&state, false);

        // Hard stop: drop the state after the worst-case lifetime.
        let node = Arc::clone(self);
        let state_for_expiry = Arc::clone(&state);
        self.cleaner.set_timer(
            &format!("rq-expire-{}", state.req_msg_id),
            self.config.reply_timeout * (self.config.number_of_retry + 2),
            async move {
                node.rq_finish(&state_for_expiry);
            },
        );
    }

    /// Forward one fragment as a child request and fold its reply stream
    /// into our state.
    fn rq_forward_fragment(
        self: &Arc<Self>,
        state: &Arc<RqState>,
        pc: &Arc<PeerConnection>,
        fragment: KeyRange,
        payload: &AppPayload,
        retransmission: u32,
    ) {
        let env = self.make_envelope(Body::RQRequest {
            min: fragment.from.clone(),
            max: fragment.to.clone(),
            payload: payload.clone(),
            retransmission,
        });
        let child_id = env.msg_id.clone();
        let opts = RequestOptions {
            timeout: Some(self.config.reply_timeout),
            expect: "rq_reply",
            allow_multiple: true,
            conn: Some(pc.local_id),
        };
        let mut rx = self.register_pending(&child_id, opts);
        if self.send_envelope_on_pc(pc, env).is_err() {
            self.finish_pending(&child_id);
            tracing::debug!(conn = %pc.local_id, fragment = %fragment, "fragment delegate unreachable");
            return;
        }
        let node = Arc::clone(self);
        let state = Arc::clone(state);
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Ok((env, _)) => {
                        if let Body::RQReply { ranges, values, eor, .. } = env.body {
                            node.rq_add_reply(&state, ranges, values);
                            if eor {
                                node.finish_pending(&child_id);
                                break;
                            }
                        }
                    }
                    Err(_) => break, // child deadline; its range stays a gap
                }
            }
        });
    }

    /// Fold a covered-range report into the request state.
    fn rq_add_reply(self: &Arc<Self>, state: &Arc<RqState>, ranges: Vec<KeyRange>, values: Vec<Value>) {
        {
            let mut gaps = state.gaps.lock();
            for r in &ranges {
                gaps.remove(r);
            }
        }
        state.covered.lock().extend(ranges);
        state.acc.lock().extend(values);
        if state.gaps.lock().is_empty() {
            self.rq_flush(state, true);
        }
    }

    /// Emit whatever is covered since the last flush. With `force`, also
    /// emit the end-of-reply marker when the gaps are closed.
    fn rq_flush(self: &Arc<Self>, state: &Arc<RqState>, force: bool) {
        if state.done.load(Ordering::SeqCst) {
            return;
        }
        let eor = state.gaps.lock().is_empty();
        let ranges: Vec<KeyRange> = std::mem::take(&mut *state.covered.lock());
        let values: Vec<Value> = std::mem::take(&mut *state.acc.lock());
        if ranges.is_empty() && values.is_empty() && !(eor && force) {
            return;
        }
        let _ = self.reply_along(
            &state.reply_route,
            None,
            Body::RQReply {
                req_msg_id: state.req_msg_id.clone(),
                ranges,
                values,
                eor,
            },
        );
        if eor {
            self.rq_finish(state);
        }
    }

    fn rq_finish(self: &Arc<Self>, state: &Arc<RqState>) {
        if state.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleaner.cancel_timer(&format!("rq-flush-{}", state.req_msg_id));
        self.cleaner.cancel_timer(&format!("rq-expire-{}", state.req_msg_id));
        self.rq_states.lock().remove(&state.req_msg_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn r(from: &str, to: &str) -> KeyRange {
        KeyRange::new(k(from), k(to))
    }

    #[test]
    fn gaps_close_as_ranges_arrive() {
        let mut gaps = Gaps::new(r("2", "5"));
        assert!(!gaps.is_empty());
        gaps.remove(&r("3", "4"));
        assert_eq!(gaps.to_list(), vec![r("2", "3"), r("4", "5")]);
        gaps.remove(&r("2", "3"));
        gaps.remove(&r("4", "5"));
        assert!(gaps.is_empty());
    }

    #[test]
    fn gaps_handle_wraparound() {
        let mut gaps = Gaps::new(r("8", "2"));
        gaps.remove(&r("9", "1"));
        assert_eq!(gaps.to_list(), vec![r("8", "9"), r("1", "2")]);
        gaps.remove(&r("8", "9"));
        gaps.remove(&r("1", "2"));
        assert!(gaps.is_empty());
    }

    #[test]
    fn overlapping_removal_is_idempotent() {
        let mut gaps = Gaps::new(r("2", "5"));
        gaps.remove(&r("3", "4"));
        gaps.remove(&r("3", "4"));
        assert_eq!(gaps.to_list(), vec![r("2", "3"), r("4", "5")]);
    }
}
