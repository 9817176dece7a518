//! Server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the chat relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Outbound messages buffered per client before sends are refused.
    pub max_send_queue: usize,
    /// Ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Drop a client after this many seconds without a pong.
    pub client_timeout_secs: u64,
    /// How often dead clients are swept, in seconds.
    pub cleanup_interval_secs: u64,
    /// How often expired histories are evicted, in seconds.
    pub eviction_sweep_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            eviction_sweep_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
