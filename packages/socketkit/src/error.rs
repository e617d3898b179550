//! Error taxonomy for the session layer.

use serde_json::Value;

use crate::frame::CorrelationId;

/// Errors surfaced to callers of [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// A call was attempted while the session was not `Connected`.
    #[error("not connected")]
    NotConnected,

    /// The server answered the request with an error.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The connection dropped while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The transport refused to open or to carry a frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// The outbound frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Remote(_) => "remote_error",
            Self::ConnectionLost => "connection_lost",
            Self::Transport(_) => "transport_error",
            Self::Encode(_) => "encode_error",
        }
    }

    /// The server-supplied error, if this is a remote failure.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RemoteError> for SessionError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Error detail carried by a Response frame.
///
/// Servers are free to send a bare string or an object; `detail` keeps the
/// JSON as received.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub code: Option<String>,
    pub message: String,
    pub detail: Value,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code: None,
            detail: Value::String(message.clone()),
            message,
        }
    }

    /// Interpret an arbitrary `error` value from the wire.
    pub fn from_value(detail: Value) -> Self {
        let (code, message) = match &detail {
            Value::String(s) => (None, s.clone()),
            Value::Object(map) => {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| detail.to_string());
                let code = map.get("code").and_then(|c| match c {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                (code, message)
            }
            other => (None, other.to_string()),
        };
        Self {
            code,
            message,
            detail,
        }
    }
}

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is already open")]
    AlreadyOpen,

    #[error("transport is not open")]
    NotOpen,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("no async runtime available to drive the connection")]
    NoRuntime,

    #[error("transport closed")]
    Closed,
}

/// Inbound traffic the session could not make sense of.
///
/// Anomalies are logged and counted; they never reach a caller and never
/// tear the connection down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolAnomaly {
    #[error("response for unknown correlation id {0}")]
    UnknownCorrelationId(CorrelationId),

    #[error("undecodable frame: {0}")]
    UndecodableFrame(String),

    #[error("unexpected request frame {operation} (id {id})")]
    UnexpectedRequest {
        id: CorrelationId,
        operation: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_codes() {
        assert_eq!(SessionError::NotConnected.error_code(), "not_connected");
        assert_eq!(SessionError::ConnectionLost.error_code(), "connection_lost");
        assert_eq!(
            SessionError::Remote(RemoteError::new("nope")).error_code(),
            "remote_error"
        );
    }

    #[test]
    fn remote_error_from_string() {
        let err = RemoteError::from_value(json!("room not found"));
        assert_eq!(err.message, "room not found");
        assert!(err.code.is_none());
        assert_eq!(err.detail, json!("room not found"));
    }

    #[test]
    fn remote_error_from_object() {
        let err = RemoteError::from_value(json!({"code": 404, "message": "no such client"}));
        assert_eq!(err.message, "no such client");
        assert_eq!(err.code.as_deref(), Some("404"));
        assert_eq!(err.detail["code"], 404);
    }

    #[test]
    fn remote_error_object_without_message_keeps_json() {
        let err = RemoteError::from_value(json!({"reason": "quota"}));
        assert_eq!(err.message, r#"{"reason":"quota"}"#);
    }

    #[test]
    fn remote_accessor() {
        let err = SessionError::from(RemoteError::new("denied"));
        assert_eq!(err.remote().map(|r| r.message.as_str()), Some("denied"));
        assert!(SessionError::ConnectionLost.remote().is_none());
    }

    #[test]
    fn display_messages() {
        assert_eq!(SessionError::NotConnected.to_string(), "not connected");
        assert_eq!(
            SessionError::Remote(RemoteError::new("denied")).to_string(),
            "remote error: denied"
        );
        assert_eq!(
            ProtocolAnomaly::UnknownCorrelationId(9).to_string(),
            "response for unknown correlation id 9"
        );
    }
}
