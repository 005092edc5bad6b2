//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use relay_storage::StorageConfig;

/// Buffer server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind to
    pub listen_addr: SocketAddr,
    /// Upper bound on a single wire frame
    pub max_frame_size: usize,
    /// Per-stream storage sizing
    pub storage: StorageConfig,
    /// Maximum entries handed to a subscriber's outbound queue per drain
    pub subscriber_batch: usize,
    /// Outbound frame queue depth per subscriber connection
    pub outbound_queue: usize,
    /// How often the reaper scans for idle streams
    pub reap_interval: Duration,
    /// Idle period after which a stream with no publisher and no
    /// subscribers is reaped
    pub idle_stream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("static address parses"),
            max_frame_size: relay_wire::DEFAULT_MAX_FRAME,
            storage: StorageConfig::default(),
            subscriber_batch: 64,
            outbound_queue: 64,
            reap_interval: Duration::from_secs(30),
            idle_stream_timeout: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert_eq!(config.subscriber_batch, 64);
        assert!(config.idle_stream_timeout > config.reap_interval);
    }
}
