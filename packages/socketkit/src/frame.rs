//! Wire frames: one JSON object per socket message.
//!
//! ```text
//! Request   { "id": 12, "operation": "get_rooms", "payload": {...} }
//! Response  { "id": 12, "result": {...} }   or   { "id": 12, "error": ... }
//! Push      { "event": "room_updated", "payload": {...} }
//! ```
//!
//! A frame carrying an `id` is correlated traffic; one without is a push.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

pub type CorrelationId = u64;

/// Correlation id of the handshake exchange. Never handed out to calls.
pub const HANDSHAKE_ID: CorrelationId = 0;

/// Operation name of the handshake request.
pub const HANDSHAKE_OPERATION: &str = "_handshake";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has neither a correlation id nor an event name")]
    Unclassified,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: CorrelationId,
        operation: String,
        payload: Value,
    },
    Response {
        id: CorrelationId,
        outcome: Result<Value, RemoteError>,
    },
    Push {
        event: String,
        payload: Value,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl Frame {
    pub fn request(id: CorrelationId, operation: impl Into<String>, payload: Value) -> Self {
        Self::Request {
            id,
            operation: operation.into(),
            payload,
        }
    }

    pub fn push(event: impl Into<String>, payload: Value) -> Self {
        Self::Push {
            event: event.into(),
            payload,
        }
    }

    pub fn reply(id: CorrelationId, result: Value) -> Self {
        Self::Response {
            id,
            outcome: Ok(result),
        }
    }

    pub fn reject(id: CorrelationId, error: RemoteError) -> Self {
        Self::Response {
            id,
            outcome: Err(error),
        }
    }

    /// The correlation id, if this frame is correlated traffic.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Push { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        let wire = match self {
            Self::Request {
                id,
                operation,
                payload,
            } => WireFrame {
                id: Some(*id),
                operation: Some(operation.clone()),
                payload: Some(payload.clone()),
                ..Default::default()
            },
            Self::Response {
                id,
                outcome: Ok(result),
            } => WireFrame {
                id: Some(*id),
                result: Some(result.clone()),
                ..Default::default()
            },
            Self::Response {
                id,
                outcome: Err(err),
            } => WireFrame {
                id: Some(*id),
                error: Some(err.detail.clone()),
                ..Default::default()
            },
            Self::Push { event, payload } => WireFrame {
                event: Some(event.clone()),
                payload: Some(payload.clone()),
                ..Default::default()
            },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let wire: WireFrame = serde_json::from_str(text)?;
        match (wire.id, wire.operation, wire.event) {
            (Some(id), Some(operation), _) => Ok(Self::Request {
                id,
                operation,
                payload: wire.payload.unwrap_or(Value::Null),
            }),
            (Some(id), None, _) => {
                let outcome = match wire.error {
                    Some(err) => Err(RemoteError::from_value(err)),
                    None => Ok(wire.result.unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, _, Some(event)) => Ok(Self::Push {
                event,
                payload: wire.payload.unwrap_or(Value::Null),
            }),
            (None, _, None) => Err(FrameError::Unclassified),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let text = Frame::request(3, "get_rooms", json!({"limit": 50}))
            .encode()
            .unwrap();
        let obj: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(obj, json!({"id": 3, "operation": "get_rooms", "payload": {"limit": 50}}));
    }

    #[test]
    fn push_has_no_id() {
        let text = Frame::push("room_updated", json!({"id": 1})).encode().unwrap();
        let obj: Value = serde_json::from_str(&text).unwrap();
        assert!(obj.get("id").is_none());
        assert_eq!(obj["event"], "room_updated");
    }

    #[test]
    fn null_result_is_kept_on_the_wire() {
        let text = Frame::reply(4, Value::Null).encode().unwrap();
        assert_eq!(text, r#"{"id":4,"result":null}"#);
        assert_eq!(Frame::decode(&text).unwrap(), Frame::reply(4, Value::Null));
    }

    #[test]
    fn decode_response_with_result() {
        let frame = Frame::decode(r#"{"id": 7, "result": {"id": 7}}"#).unwrap();
        assert_eq!(frame, Frame::reply(7, json!({"id": 7})));
    }

    #[test]
    fn decode_response_without_result_is_null() {
        let frame = Frame::decode(r#"{"id": 8}"#).unwrap();
        assert_eq!(frame, Frame::reply(8, Value::Null));
    }

    #[test]
    fn error_takes_precedence_over_result() {
        let frame = Frame::decode(r#"{"id": 9, "result": 1, "error": "denied"}"#).unwrap();
        match frame {
            Frame::Response {
                id: 9,
                outcome: Err(err),
            } => assert_eq!(err.message, "denied"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn correlation_id_wins_over_event_name() {
        let frame = Frame::decode(r#"{"id": 2, "event": "room_updated", "result": true}"#).unwrap();
        assert_eq!(frame.correlation_id(), Some(2));
        assert!(matches!(frame, Frame::Response { .. }));
    }

    #[test]
    fn decode_push_without_payload() {
        let frame = Frame::decode(r#"{"event": "joined_to_room"}"#).unwrap();
        assert_eq!(frame, Frame::push("joined_to_room", Value::Null));
    }

    #[test]
    fn decode_request() {
        let frame = Frame::decode(r#"{"id": 1, "operation": "ping"}"#).unwrap();
        assert_eq!(frame, Frame::request(1, "ping", Value::Null));
    }

    #[test]
    fn unclassified_frame_is_rejected() {
        assert!(matches!(
            Frame::decode(r#"{"payload": 1}"#),
            Err(FrameError::Unclassified)
        ));
    }

    #[test]
    fn non_object_is_malformed() {
        assert!(matches!(Frame::decode("42"), Err(FrameError::Malformed(_))));
        assert!(matches!(Frame::decode("not json"), Err(FrameError::Malformed(_))));
        assert!(matches!(
            Frame::decode(r#"{"id": -1, "result": 1}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn remote_error_detail_survives_encoding() {
        let err = RemoteError::from_value(json!({"code": "forbidden", "message": "no"}));
        let text = Frame::reject(5, err.clone()).encode().unwrap();
        assert_eq!(Frame::decode(&text).unwrap(), Frame::reject(5, err));
    }
}
