//! TCP byte-stream transport.
//!
//! URLs are `tcp://host:port`. This is the reliable-byte transport the
//! shipped binary uses; anything `AsyncRead + AsyncWrite` plugs into the
//! same machinery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::{Dialer, RawStreamBox};
use crate::node::Node;

fn strip_scheme(url: &str) -> std::io::Result<&str> {
    url.strip_prefix("tcp://").ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported url scheme: {url}"),
        )
    })
}

/// Dials `tcp://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<RawStreamBox>> + Send + 'a>> {
        Box::pin(async move {
            let addr = strip_scheme(url)?;
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as RawStreamBox)
        })
    }
}

/// Accept inbound byte streams for a node. Returns the bound local
/// address; the accept loop runs until the listener socket errors or the
/// node is destroyed.
pub async fn listen(node: Arc<Node>, addr: &str) -> std::io::Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(%local, "listening for byte-stream peers");
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "inbound byte-stream connection");
                    if stream.set_nodelay(true).is_err() {
                        continue;
                    }
                    node.accept_stream(Box::new(stream));
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    break;
                }
            }
        }
    });
    Ok(local)
}
