//! In-process transports.
//!
//! A [`MemoryHub`] routes `mem://` URLs between nodes living in the same
//! process over `tokio::io::duplex` pipes; the [`MemoryDatagramFactory`]
//! brokers datagram-stream sessions the same way. Both are the test
//! doubles for the externally provided transports, and double as the
//! multi-node-in-one-process wiring for demos.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{Dialer, RawStreamBox};
use crate::node::Node;

const PIPE_CAPACITY: usize = 256 * 1024;

/// Routes in-process dials by URL.
#[derive(Default)]
pub struct MemoryHub {
    binds: Mutex<HashMap<String, mpsc::UnboundedSender<RawStreamBox>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryHub::default())
    }

    /// Bind a URL; inbound streams arrive on the returned receiver.
    pub fn bind(&self, url: &str) -> mpsc::UnboundedReceiver<RawStreamBox> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.binds.lock().insert(url.to_string(), tx);
        rx
    }

    /// Bind a URL and feed inbound streams straight into a node.
    pub fn serve(self: &Arc<Self>, node: &Arc<Node>, url: &str) {
        let mut rx = self.bind(url);
        let node = Arc::clone(node);
        tokio::spawn(async move {
            while let Some(stream) = rx.recv().await {
                node.accept_stream(stream);
            }
        });
    }

    pub fn unbind(&self, url: &str) {
        self.binds.lock().remove(url);
    }

    pub fn dial_sync(&self, url: &str) -> std::io::Result<RawStreamBox> {
        let binds = self.binds.lock();
        let Some(tx) = binds.get(url) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no memory bind for {url}"),
            ));
        };
        let (mine, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(Box::new(theirs)).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "acceptor gone")
        })?;
        Ok(Box::new(mine))
    }
}

impl Dialer for MemoryHub {
    fn dial<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<RawStreamBox>> + Send + 'a>> {
        Box::pin(async move { self.dial_sync(url) })
    }
}

enum SessionSlot {
    /// Offer placed, waiting for answer: both pipe halves parked here.
    Pending(DuplexStream, DuplexStream),
    /// Answered: the offerer's half waits for `complete`.
    Answered(DuplexStream),
}

/// In-process datagram-stream broker. Share one instance between the nodes
/// that should be able to reach each other; flip `fail` to simulate an
/// unreachable network and exercise the relay fallback.
pub struct MemoryDatagramFactory {
    sessions: Mutex<HashMap<u64, SessionSlot>>,
    counter: AtomicU64,
    fail: AtomicBool,
}

impl MemoryDatagramFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryDatagramFactory {
            sessions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
            fail: AtomicBool::new(false),
        })
    }

    /// Make every subsequent handshake fail (testing).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check_fail(&self) -> std::io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::HostUnreachable,
                "datagram transport unavailable",
            ));
        }
        Ok(())
    }
}

impl super::DatagramFactory for MemoryDatagramFactory {
    fn offer(&self) -> std::io::Result<(u64, String)> {
        self.check_fail()?;
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        self.sessions.lock().insert(id, SessionSlot::Pending(a, b));
        Ok((id, format!("mem-offer:{id}")))
    }

    fn answer(&self, offer: &str) -> std::io::Result<(RawStreamBox, String)> {
        self.check_fail()?;
        let id: u64 = offer
            .strip_prefix("mem-offer:")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad offer blob")
            })?;
        let mut sessions = self.sessions.lock();
        match sessions.remove(&id) {
            Some(SessionSlot::Pending(a, b)) => {
                sessions.insert(id, SessionSlot::Answered(a));
                Ok((Box::new(b), format!("mem-answer:{id}")))
            }
            other => {
                if let Some(slot) = other {
                    sessions.insert(id, slot);
                }
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "unknown or already-answered session",
                ))
            }
        }
    }

    fn complete(&self, session: u64, answer: &str) -> std::io::Result<RawStreamBox> {
        self.check_fail()?;
        if !answer.starts_with("mem-answer:") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad answer blob",
            ));
        }
        match self.sessions.lock().remove(&session) {
            Some(SessionSlot::Answered(a)) => Ok(Box::new(a)),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "session not answered",
            )),
        }
    }

    fn signal(&self, session: u64, payload: &serde_json::Value) {
        // The in-process pipe needs no candidate trickle.
        tracing::trace!(session, ?payload, "memory datagram signal ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::DatagramFactory as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn hub_routes_by_url() {
        let hub = MemoryHub::new();
        let mut rx = hub.bind("mem://a");
        let mut dialed = hub.dial_sync("mem://a").unwrap();
        let mut accepted = rx.recv().await.unwrap();

        dialed.write_all(b"hi\n").await.unwrap();
        let mut buf = [0u8; 3];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi\n");
    }

    #[tokio::test]
    async fn dial_unknown_url_is_refused() {
        let hub = MemoryHub::new();
        assert!(hub.dial_sync("mem://nowhere").is_err());
    }

    #[tokio::test]
    async fn datagram_offer_answer_complete() {
        let factory = MemoryDatagramFactory::new();
        let (session, offer) = factory.offer().unwrap();
        let (mut answered, answer) = factory.answer(&offer).unwrap();
        let mut offered = factory.complete(session, &answer).unwrap();

        offered.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        answered.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn failing_factory_refuses_handshakes() {
        let factory = MemoryDatagramFactory::new();
        factory.set_fail(true);
        assert!(factory.offer().is_err());
    }
}
