use std::collections::BTreeMap;
use std::path::Path;

use phoenix_channels::SocketOptions;
use serde::{Deserialize, Serialize};

// =============================================================================
// Client config (figment-deserialized from defaults / phoenix.toml / env vars)
// =============================================================================
//
//   phoenix.toml:    url = "ws://localhost:4000/socket"
//                    [socket]
//                    timeout_ms = 5000
//
//   env var:         PHX_SOCKET__TIMEOUT_MS=5000   (double underscore = nesting)

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Sent with every join of `topic`.
    #[serde(default)]
    pub join_params: BTreeMap<String, serde_json::Value>,
    /// Socket tunables (lives under `[socket]`).
    #[serde(default)]
    pub socket: SocketOptions,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            topic: default_topic(),
            join_params: BTreeMap::new(),
            socket: SocketOptions::default(),
        }
    }
}

fn default_url() -> String {
    "ws://localhost:4000/socket".to_string()
}

fn default_topic() -> String {
    "room:lobby".to_string()
}

/// Build a figment that layers: defaults → `path` (TOML, optional) → PHX_* env vars.
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(ChatConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PHX_").split("__"))
}
