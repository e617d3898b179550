use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::handshake::{ConnectionKind, Credentials, Handshake};

// =============================================================================
// File config (figment-deserialized from defaults / socketkit.toml / env vars)
// =============================================================================
//
//   socketkit.toml:  endpoint = "wss://ws.socketkit.com"
//                    [credentials]
//                    token = "abc"
//
//   env var:         SOCKETKIT_CREDENTIALS__TOKEN=abc   (double underscore = nesting)

pub const DEFAULT_ENDPOINT: &str = "wss://ws.socketkit.com";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub credentials: CredentialsFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
    /// Buffered lifecycle notifications per subscriber.
    #[serde(default = "default_lifecycle_capacity")]
    pub lifecycle_capacity: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            credentials: CredentialsFileConfig::default(),
            websocket: WebSocketFileConfig::default(),
            lifecycle_capacity: default_lifecycle_capacity(),
        }
    }
}

impl FileConfig {
    pub fn handshake(&self) -> Handshake {
        Credentials::from(&self.credentials).handshake()
    }
}

/// Lives under `[credentials]`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CredentialsFileConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub account_id: Option<u64>,
    #[serde(default)]
    pub kind: ConnectionKind,
}

impl From<&CredentialsFileConfig> for Credentials {
    fn from(fc: &CredentialsFileConfig) -> Self {
        Self {
            token: fc.token.clone(),
            account_id: fc.account_id,
            kind: fc.kind,
        }
    }
}

/// Lives under `[websocket]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_message_kb")]
    pub max_message_kb: usize,
    /// Ping interval; 0 disables keepalive.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_message_kb: default_max_message_kb(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
fn default_lifecycle_capacity() -> usize {
    64
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_max_message_kb() -> usize {
    1024
}
fn default_keepalive_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → config file → SOCKETKIT_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("SOCKETKIT_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    pub keepalive: Option<Duration>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::from_file(&WebSocketFileConfig::default())
    }
}

impl WebSocketConfig {
    pub fn from_file(fc: &WebSocketFileConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(fc.handshake_timeout_secs),
            max_message_size: fc.max_message_kb * 1024,
            keepalive: if fc.keepalive_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.keepalive_secs))
            },
        }
    }
}
