use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounds applied to every session's history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Keep at most this many turns per session, dropping the oldest first.
    pub max_turns: Option<usize>,
    /// Keep at most this many text bytes per session, dropping the oldest first.
    pub max_bytes: Option<usize>,
    /// Forget a history untouched for this long even if no disconnect was seen.
    pub idle_ttl: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_turns: Some(40),
            max_bytes: Some(64 * 1024),
            idle_ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl StoreConfig {
    /// No caps and no idle expiry.
    pub fn unbounded() -> Self {
        Self {
            max_turns: None,
            max_bytes: None,
            idle_ttl: None,
        }
    }
}
