//! Node configuration.

use std::time::Duration;

/// Tunables for a node. `Default` gives the production values; tests
/// shrink the timers.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable identity. Generated when `None`.
    pub node_id: Option<String>,
    /// Hello-time namespace. A mismatch closes the transport.
    pub network_id: String,
    /// Advertised URL if this node accepts inbound byte-stream connections.
    /// A node with a URL is a portal.
    pub my_url: Option<String>,
    /// Whether this node can open datagram-stream sessions.
    pub supports_datagram: bool,
    /// Only connect over datagram streams, never byte streams.
    pub datagram_only: bool,

    /// Per-hop ack deadline.
    pub ack_timeout: Duration,
    /// End-to-end reply deadline for non-streaming requests.
    pub reply_timeout: Duration,
    /// Gracefully close raw links idle longer than this.
    pub max_idle_before_raw_close: Duration,
    /// Raw connection establishment deadline.
    pub max_raw_establish_time: Duration,
    /// How long a node stays suspicious after a missed ack.
    pub suspicious_node_expiration: Duration,
    /// How long received message ids are retained for dedup.
    pub expire_received_ids: Duration,

    pub enable_relay: bool,
    pub always_relay: bool,
    pub relay_connection_timeout: Duration,
    pub relay_path_maintenance_period: Duration,
    pub minimum_relay_paths: usize,
    /// How long a failed datagram target is remembered as indirect.
    pub indirect_node_expiration: Duration,

    /// DDLL left-link ping period.
    pub ping_period: Duration,
    /// Delay between repair attempts.
    pub recovery_retry_period: Duration,
    /// Protocol-level retry budget for nak/raced operations.
    pub number_of_retry: u32,

    /// Finger-table periodic refresh.
    pub ft_update_period: Duration,
    /// Range-query partial-reply flush period.
    pub rq_flush_period: Duration,

    /// STUN-equivalent servers handed to the datagram transport.
    pub stun_servers: Vec<String>,
    /// Trickle signaling for datagram sessions.
    pub trickle_signaling: bool,
    /// Disable datagram signaling entirely (testing).
    pub enable_signaling: bool,

    /// Per-peer-connection sequencing. Present but off: the dedup map is
    /// the delivery guard.
    pub enable_sequencing: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: None,
            network_id: "gyre".to_string(),
            my_url: None,
            supports_datagram: false,
            datagram_only: false,
            ack_timeout: Duration::from_millis(5000),
            reply_timeout: Duration::from_millis(6000),
            max_idle_before_raw_close: Duration::from_secs(120),
            max_raw_establish_time: Duration::from_secs(6),
            suspicious_node_expiration: Duration::from_secs(120),
            expire_received_ids: Duration::from_secs(30),
            enable_relay: true,
            always_relay: false,
            relay_connection_timeout: Duration::from_secs(15),
            relay_path_maintenance_period: Duration::from_secs(30),
            minimum_relay_paths: 3,
            indirect_node_expiration: Duration::from_secs(300),
            ping_period: Duration::from_secs(10),
            recovery_retry_period: Duration::from_secs(5),
            number_of_retry: 5,
            ft_update_period: Duration::from_secs(30),
            rq_flush_period: Duration::from_secs(1),
            stun_servers: Vec::new(),
            trickle_signaling: true,
            enable_signaling: true,
            enable_sequencing: false,
        }
    }
}

impl NodeConfig {
    /// Fast timers for in-process tests.
    pub fn for_tests() -> Self {
        NodeConfig {
            ack_timeout: Duration::from_millis(400),
            reply_timeout: Duration::from_millis(800),
            max_raw_establish_time: Duration::from_millis(1500),
            suspicious_node_expiration: Duration::from_secs(5),
            relay_connection_timeout: Duration::from_secs(2),
            relay_path_maintenance_period: Duration::from_millis(500),
            ping_period: Duration::from_millis(300),
            recovery_retry_period: Duration::from_millis(200),
            ft_update_period: Duration::from_millis(500),
            rq_flush_period: Duration::from_millis(200),
            ..NodeConfig::default()
        }
    }

    /// Whether this node is a portal (publicly dialable).
    pub fn is_portal(&self) -> bool {
        self.my_url.is_some()
    }
}

/// Exponential random backoff for retriable protocol errors:
/// uniform in `[50 * 1.5^attempt, 100 * 1.5^attempt)` milliseconds.
pub fn retry_backoff(attempt: u32) -> Duration {
    use rand::Rng;
    let factor = 1.5f64.powi(attempt.min(16) as i32);
    let low = 50.0 * factor;
    let high = 100.0 * factor;
    let ms = rand::thread_rng().gen_range(low..high);
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = NodeConfig::default();
        assert_eq!(c.ack_timeout, Duration::from_secs(5));
        assert_eq!(c.reply_timeout, Duration::from_secs(6));
        assert_eq!(c.minimum_relay_paths, 3);
        assert!(!c.always_relay);
        assert!(c.enable_relay);
        assert!(!c.enable_sequencing);
    }

    #[test]
    fn backoff_grows_and_jitters() {
        for attempt in 0..5 {
            let lo = Duration::from_millis((50.0 * 1.5f64.powi(attempt)) as u64);
            let hi = Duration::from_millis((100.0 * 1.5f64.powi(attempt)) as u64);
            for _ in 0..20 {
                let d = retry_backoff(attempt as u32);
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?}");
            }
        }
    }
}
