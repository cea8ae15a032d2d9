//! Raw transport sessions.
//!
//! A [`RawConnection`] wraps exactly one underlying transport session: a
//! byte stream (server or client side), a datagram stream, or the
//! in-process loopback. Frames are newline-delimited JSON envelopes. Each
//! session gets a writer task fed by an mpsc of encoded lines and a reader
//! task that decodes and hands envelopes to the node.

pub mod memory;
pub mod tcp;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::cleaner::Cleaner;
use crate::error::{OverlayError, Result};
use crate::id::{NodeId, RawConnId};
use crate::node::Node;
use crate::wire::{Body, Envelope};

/// Underlying transport of a raw connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// Same-process shortcut; never idle-closed.
    Loopback,
    /// Byte stream we accepted.
    ServerSide,
    /// Byte stream we dialed.
    ClientSide,
    /// Datagram-stream session (signaled).
    DatagramStream,
    /// Placeholder kind for links that only exist as relay paths.
    Relay,
}

impl RawKind {
    pub fn is_loopback(self) -> bool {
        matches!(self, RawKind::Loopback)
    }
}

/// Boxed bidirectional byte stream; what every transport hands us.
pub type RawStreamBox = Box<dyn RawStream>;

pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Dials a URL to a fresh byte stream. The shipped implementation speaks
/// TCP (`tcp://host:port`); tests install an in-memory hub.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<RawStreamBox>> + Send + 'a>>;
}

/// Opens datagram-stream sessions through an external signaling-capable
/// transport. Offer/answer blobs are opaque to the overlay; they travel in
/// connection replies and `DatagramSignal` messages.
pub trait DatagramFactory: Send + Sync {
    /// Start a session as the offering side.
    fn offer(&self) -> std::io::Result<(u64, String)>;
    /// Answer a remote offer: the answering side is established at once.
    fn answer(&self, offer: &str) -> std::io::Result<(RawStreamBox, String)>;
    /// Complete the offering side with the remote answer.
    fn complete(&self, session: u64, answer: &str) -> std::io::Result<RawStreamBox>;
    /// Deliver a trickled signal (candidate, renegotiation).
    fn signal(&self, session: u64, payload: &serde_json::Value);
}

pub struct RawConnection {
    pub id: RawConnId,
    pub kind: RawKind,
    pub cleaner: Arc<Cleaner>,
    remote: Mutex<Option<NodeId>>,
    remote_url: Mutex<Option<String>>,
    /// Taken (dropped) on shutdown so the writer task drains and closes
    /// its stream half.
    out_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    last_used: Mutex<Instant>,
    gracefully_closed: AtomicBool,
    closed: AtomicBool,
    established: AtomicBool,
    /// Outbound lines buffered while the node is muted (testing).
    muted_buf: Mutex<Vec<String>>,
    pub(crate) established_notify: tokio::sync::Notify,
}

impl RawConnection {
    fn new(
        id: RawConnId,
        kind: RawKind,
        out_tx: mpsc::UnboundedSender<String>,
        parent: &Arc<Cleaner>,
    ) -> Arc<Self> {
        Arc::new(RawConnection {
            id,
            kind,
            cleaner: parent.child(format!("{id}")),
            remote: Mutex::new(None),
            remote_url: Mutex::new(None),
            out_tx: Mutex::new(Some(out_tx)),
            last_used: Mutex::new(Instant::now()),
            gracefully_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            established: AtomicBool::new(false),
            muted_buf: Mutex::new(Vec::new()),
            established_notify: tokio::sync::Notify::new(),
        })
    }

    pub fn remote(&self) -> Option<NodeId> {
        self.remote.lock().clone()
    }

    pub(crate) fn set_remote(&self, node: NodeId) {
        *self.remote.lock() = Some(node);
    }

    pub fn remote_url(&self) -> Option<String> {
        self.remote_url.lock().clone()
    }

    pub(crate) fn set_remote_url(&self, url: Option<String>) {
        *self.remote_url.lock() = url;
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::SeqCst);
        self.cleaner.cancel_timer("establish");
        self.established_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_graceful(&self) {
        self.gracefully_closed.store(true, Ordering::SeqCst);
    }

    pub fn was_graceful(&self) -> bool {
        self.gracefully_closed.load(Ordering::SeqCst)
    }

    /// Queue an encoded line for the writer task, or into the mute buffer.
    pub(crate) fn enqueue(&self, line: String, muted: bool) -> Result<()> {
        if self.is_closed() {
            return Err(OverlayError::NotConnected);
        }
        self.touch();
        if muted {
            self.muted_buf.lock().push(line);
            return Ok(());
        }
        match self.out_tx.lock().as_ref() {
            Some(tx) => tx.send(line).map_err(|_| OverlayError::NotConnected),
            None => Err(OverlayError::NotConnected),
        }
    }

    /// Flush everything buffered while muted.
    pub(crate) fn flush_muted(&self) {
        let lines = std::mem::take(&mut *self.muted_buf.lock());
        let tx = self.out_tx.lock();
        if let Some(tx) = tx.as_ref() {
            for line in lines {
                let _ = tx.send(line);
            }
        }
    }

    /// Stop the writer and mark the session closed. Dropping the sender
    /// ends the writer task, which shuts down the stream so the remote
    /// reader sees EOF. The registry cleanup happens in
    /// [`Node::destroy_raw`].
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.out_tx.lock().take();
        self.cleaner.clean();
        self.established_notify.notify_waiters();
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote", &self.remote())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Node {
    /// Wire a fresh byte stream into the node: registers the raw, spawns
    /// reader and writer tasks, and arms the establishment deadline. The
    /// dialing side then sends `Hello`; the accepting side waits for it.
    pub fn attach_stream(self: &Arc<Self>, stream: RawStreamBox, kind: RawKind) -> Arc<RawConnection> {
        let id = self.ids.next_raw_id();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let raw = RawConnection::new(id, kind, out_tx, &self.cleaner);
        self.raws.lock().insert(id, Arc::clone(&raw));

        let (read_half, mut write_half) = tokio::io::split(stream);

        // Writer: drain encoded lines onto the stream.
        let writer_raw = Arc::clone(&raw);
        let writer_node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    tracing::debug!(raw = %writer_raw.id, "raw write error: {e}");
                    break;
                }
                if let Err(e) = write_half.write_all(b"\n").await {
                    tracing::debug!(raw = %writer_raw.id, "raw write error: {e}");
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
            writer_node.on_raw_dead(writer_raw.id);
        });

        // Reader: decode lines into envelopes.
        let reader_raw = Arc::clone(&raw);
        let reader_node = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match Envelope::decode(&line) {
                        Ok(env) => {
                            reader_node
                                .clone()
                                .handle_envelope(env, Some(reader_raw.id))
                                .await;
                        }
                        Err(e) => {
                            // Unknown tag or malformed frame: log and drop.
                            tracing::warn!(
                                raw = %reader_raw.id,
                                "undecodable frame ({e}): {}",
                                line.chars().take(160).collect::<String>()
                            );
                        }
                    },
                    Ok(None) => {
                        tracing::debug!(raw = %reader_raw.id, "raw read EOF");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(raw = %reader_raw.id, "raw read error: {e}");
                        break;
                    }
                }
            }
            reader_node.on_raw_dead(reader_raw.id);
        });

        // Establishment deadline: the Hello exchange must finish in time.
        let deadline_node = Arc::clone(self);
        raw.cleaner.set_timer(
            "establish",
            self.config.max_raw_establish_time,
            async move {
                if let Some(raw) = deadline_node.raw_by_id(id) {
                    if !raw.is_established() {
                        tracing::warn!(raw = %id, "raw establishment timed out");
                        deadline_node.destroy_raw(id);
                    }
                }
            },
        );

        raw
    }

    /// Create the node's loopback raw connection: envelopes sent on it are
    /// dispatched back into the node asynchronously. Never idle-closed.
    pub(crate) fn attach_loopback(self: &Arc<Self>) -> Arc<RawConnection> {
        let id = self.ids.next_raw_id();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let raw = RawConnection::new(id, RawKind::Loopback, out_tx, &self.cleaner);
        raw.set_remote(self.node_id.clone());
        raw.mark_established();
        self.raws.lock().insert(id, Arc::clone(&raw));
        self.register_raw_by_node(self.node_id.clone(), id);

        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                match Envelope::decode(&line) {
                    Ok(env) => node.clone().handle_envelope(env, Some(id)).await,
                    Err(e) => tracing::warn!(raw = %id, "loopback frame error: {e}"),
                }
            }
        });
        raw
    }

    pub fn raw_by_id(&self, id: RawConnId) -> Option<Arc<RawConnection>> {
        self.raws.lock().get(&id).cloned()
    }

    /// Raw connection indexed by remote node id, if one is registered.
    pub fn raw_by_node(&self, node: &NodeId) -> Option<Arc<RawConnection>> {
        let id = *self.raw_by_node.lock().get(node)?;
        let raw = self.raw_by_id(id)?;
        if raw.is_closed() { None } else { Some(raw) }
    }

    /// Index a raw by its remote node id. A newer raw replaces an older
    /// entry; the older session stays open until its owner closes it.
    pub(crate) fn register_raw_by_node(&self, node: NodeId, raw_id: RawConnId) {
        if let Some(old) = self.raw_by_node.lock().insert(node.clone(), raw_id) {
            if old != raw_id {
                tracing::debug!(peer = %node.short(), old = %old, new = %raw_id, "raw index replaced");
            }
        }
    }

    /// Dial a URL, attach the stream, and run the Hello exchange. Resolves
    /// once the remote node id is known.
    pub async fn dial_url(self: &Arc<Self>, url: &str) -> Result<Arc<RawConnection>> {
        // Loopback shortcut for our own advertised URL.
        if self.config.my_url.as_deref() == Some(url) {
            return Ok(self.loopback());
        }
        let stream = self.dialer.dial(url).await?;
        let raw = self.attach_stream(stream, RawKind::ClientSide);
        raw.set_remote_url(Some(url.to_string()));

        self.send_on_raw(
            &raw,
            Body::Hello {
                network_id: self.config.network_id.clone(),
                url: self.config.my_url.clone(),
            },
        )?;

        let deadline =
            tokio::time::Instant::now() + self.config.max_raw_establish_time;
        loop {
            if raw.is_established() {
                return Ok(raw);
            }
            if raw.is_closed() {
                return Err(OverlayError::NotConnected);
            }
            let notified = raw.established_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.destroy_raw(raw.id);
                return Err(OverlayError::Timeout("raw establish"));
            }
        }
    }

    /// Accept an inbound byte stream (listener side). The Hello arrives as
    /// the first frame.
    pub fn accept_stream(self: &Arc<Self>, stream: RawStreamBox) -> Arc<RawConnection> {
        self.attach_stream(stream, RawKind::ServerSide)
    }

    /// Periodic idle sweep: gracefully close raw links unused for longer
    /// than the configured idle time.
    pub(crate) fn sweep_idle_raws(self: &Arc<Self>) {
        let idle_cutoff = self.config.max_idle_before_raw_close;
        let candidates: Vec<Arc<RawConnection>> = {
            let raws = self.raws.lock();
            raws.values()
                .filter(|r| {
                    !r.kind.is_loopback()
                        && !r.is_closed()
                        && !r.was_graceful()
                        && r.last_used().elapsed() > idle_cutoff
                })
                .cloned()
                .collect()
        };
        for raw in candidates {
            tracing::info!(raw = %raw.id, peer = ?raw.remote().map(|n| n.short().to_string()), "closing idle raw link");
            self.graceful_close_raw(&raw);
        }
    }

    /// Graceful close: send the close marker, give the peer a short grace
    /// period, then destroy.
    pub(crate) fn graceful_close_raw(self: &Arc<Self>, raw: &Arc<RawConnection>) {
        raw.mark_graceful();
        let _ = self.send_on_raw(raw, Body::GracefulCloseRaw);
        let node = Arc::clone(self);
        let id = raw.id;
        raw.cleaner.set_timer(
            "graceful-close",
            std::time::Duration::from_millis(500),
            async move {
                node.destroy_raw(id);
            },
        );
    }
}
