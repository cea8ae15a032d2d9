use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gyre_kv::{KvConfig, KvStore, predicate};
use gyre_overlay::raw::tcp::{TcpDialer, listen};
use gyre_overlay::{ConnectTarget, Key, Node, NodeConfig, NodeEvent};

/// Run a gyre overlay node.
#[derive(Debug, Parser)]
#[command(name = "gyre-node", version)]
struct Args {
    /// TCP listen address for inbound byte-stream peers.
    #[arg(long, env = "GYRE_LISTEN", default_value = "0.0.0.0:7400")]
    listen: String,

    /// Advertised URL (tcp://host:port). Setting this makes the node a
    /// portal.
    #[arg(long, env = "GYRE_URL")]
    url: Option<String>,

    /// Network namespace; peers with a different id are rejected at Hello.
    #[arg(long, env = "GYRE_NETWORK_ID", default_value = "gyre")]
    network_id: String,

    /// Stable node id; generated when omitted.
    #[arg(long, env = "GYRE_NODE_ID")]
    node_id: Option<String>,

    /// Portal URL of an existing member to join through. Omit to start a
    /// new ring.
    #[arg(long, env = "GYRE_INTRODUCER")]
    introducer: Option<String>,

    /// Ring keys to participate under (repeatable).
    #[arg(long = "key", required = true)]
    keys: Vec<String>,

    /// Always use relay paths, even when a direct link is possible.
    #[arg(long)]
    always_relay: bool,

    /// KV snapshot file to load at start and save on shutdown.
    #[arg(long, env = "GYRE_KV_SNAPSHOT")]
    kv_snapshot: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Human-readable logs by default, JSON in production (GYRE_LOG_JSON=1).
    let json_logs = std::env::var("GYRE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("gyre_overlay=info".parse()?)
        .add_directive("gyre_kv=info".parse()?)
        .add_directive("gyre_node=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    tracing::info!(listen = %args.listen, url = ?args.url, "starting gyre node");

    let config = NodeConfig {
        node_id: args.node_id.clone(),
        network_id: args.network_id.clone(),
        my_url: args.url.clone(),
        always_relay: args.always_relay,
        ..NodeConfig::default()
    };
    let (node, mut events) = Node::new(config, Arc::new(TcpDialer), None);

    let store = KvStore::register(&node, KvConfig::default(), predicate::default_predicate());
    if let Some(ref path) = args.kv_snapshot {
        let count = gyre_kv::persist::load(&store, path)
            .with_context(|| format!("loading snapshot {}", path.display()))?;
        tracing::info!(count, "loaded kv snapshot");
    }

    listen(Arc::clone(&node), &args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;

    for key in &args.keys {
        let introducer = args
            .introducer
            .as_ref()
            .map(|url| ConnectTarget::Url(url.clone()));
        node.add_key(Key::from(key.as_str()), introducer)
            .await
            .with_context(|| format!("joining ring under key {key}"))?;
        tracing::info!(%key, "ring membership active");
        if args.kv_snapshot.is_some() {
            // Seed replicas from restored state before taking traffic.
            store.push_all_replicas(&node, &Key::from(key.as_str())).await;
        }
    }

    let event_node = Arc::clone(&node);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::RingStatusChanged { key, status } => {
                    tracing::info!(%key, ?status, "ring status");
                }
                NodeEvent::LeftChanged { key, remote_key } => {
                    tracing::info!(%key, left = ?remote_key.map(|k| k.to_string()), "left neighbor");
                }
                NodeEvent::RightChanged { key, remote_key } => {
                    tracing::info!(%key, right = ?remote_key.map(|k| k.to_string()), "right neighbor");
                }
                NodeEvent::FingerUpdated { key, direction, level } => {
                    tracing::debug!(%key, ?direction, level, "finger table");
                }
                NodeEvent::PeerDisconnected { conn, remote } => {
                    tracing::debug!(%conn, peer = ?remote.map(|n| n.short().to_string()),
                        node = %event_node.node_id.short(), "peer disconnected");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    if let Some(ref path) = args.kv_snapshot {
        if let Err(e) = gyre_kv::persist::save(&store, path) {
            tracing::warn!("snapshot save failed: {e}");
        } else {
            tracing::info!("kv snapshot saved");
        }
    }
    for key in &args.keys {
        if let Err(e) = node.remove_key(&Key::from(key.as_str())).await {
            tracing::warn!(%key, "leave failed: {e}");
        }
    }
    node.destroy();
    Ok(())
}
