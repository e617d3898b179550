//! Handshake payload attached once when a connection is opened.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Opaque payload handed to the transport at connect time.
///
/// The session never looks inside it; the server decides what it means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handshake(Value);

impl Handshake {
    pub fn new(payload: Value) -> Self {
        Self(payload)
    }

    pub fn from_serializable<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(payload).map(Self)
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    pub fn into_payload(self) -> Value {
        self.0
    }
}

impl From<Value> for Handshake {
    fn from(payload: Value) -> Self {
        Self(payload)
    }
}

/// Which side of the service the connection acts as.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// An end-user chat client.
    #[default]
    Client,
    /// A backend service managing the client registry.
    Service,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Service => "service",
        }
    }
}

/// Account credentials in the shape the socket service expects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub account_id: Option<u64>,
    pub kind: ConnectionKind,
}

impl Credentials {
    pub fn handshake(&self) -> Handshake {
        Handshake(json!({
            "accountId": self.account_id,
            "token": self.token,
            "type": self.kind.as_str(),
        }))
    }
}
