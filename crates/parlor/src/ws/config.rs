//! Relay tuning.

use serde::{Deserialize, Serialize};

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Per-connection outbound buffer. A connection that overflows it is closed.
    pub connection_buffer: usize,

    /// Interval between WebSocket pings, in seconds.
    pub ping_interval_secs: u64,

    /// Maximum message length in characters, after trimming.
    pub max_message_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connection_buffer: 64,
            ping_interval_secs: 30,
            max_message_len: 2000,
        }
    }
}
