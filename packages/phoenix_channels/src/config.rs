use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{Backoff, DEFAULT_BACKOFF_MS};

/// Socket tunables. Deserializable so binaries can layer them from files and
/// environment variables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    /// Default timeout for pushes (joins included).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Sent as the connection's query string.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Reconnect and rejoin steps; the last one repeats.
    #[serde(default = "default_reconnect_after_ms")]
    pub reconnect_after_ms: Vec<u64>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            params: BTreeMap::new(),
            reconnect_after_ms: default_reconnect_after_ms(),
        }
    }
}

impl SocketOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::from_millis(&self.reconnect_after_ms)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_after_ms() -> Vec<u64> {
    DEFAULT_BACKOFF_MS.to_vec()
}

/// Build the socket URL: `<base>/websocket?<params>`.
pub fn endpoint_url(base: &str, params: &BTreeMap<String, String>) -> String {
    let mut url = format!("{}/websocket", base.trim_end_matches('/'));
    if !params.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        url.push('?');
        url.push_str(&query);
    }
    url
}
