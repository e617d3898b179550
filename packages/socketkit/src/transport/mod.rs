//! Duplex message channel the session runs over.
//!
//! - `websocket`: tokio-tungstenite client with handshake and keepalive
//! - `memory`: in-process transport driven by its holder

use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;
use crate::handshake::Handshake;

pub mod memory;
pub mod websocket;

/// Lifecycle and traffic reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Error(String),
    Message(String),
}

/// Callback handle a transport reports its events through.
///
/// Each `connect()` call receives a fresh sink. Events sent through a sink
/// from an earlier attempt are ignored by the session.
#[derive(Clone)]
pub struct TransportSink {
    handler: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportSink {
    pub fn new(handler: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.handler)(event)
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected)
    }

    pub fn disconnected(&self, code: u16, reason: impl Into<String>) {
        self.emit(TransportEvent::Disconnected {
            code,
            reason: reason.into(),
        })
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(TransportEvent::Error(message.into()))
    }

    pub fn message(&self, frame: impl Into<String>) {
        self.emit(TransportEvent::Message(frame.into()))
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink").finish_non_exhaustive()
    }
}

/// A duplex frame channel.
///
/// `connect` starts opening the link and returns immediately; the outcome
/// arrives later through the sink as `Connected`, or as `Error` followed by
/// `Disconnected`. `disconnect` likewise only requests teardown. A transport
/// must report exactly one `Disconnected` per successful `connect` call.
///
/// Implementations must not call into the sink while holding a lock that
/// `send` also takes: listeners may issue new calls from inside a callback.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        endpoint: &str,
        handshake: &Handshake,
        sink: TransportSink,
    ) -> Result<(), TransportError>;

    fn send(&self, frame: String) -> Result<(), TransportError>;

    fn disconnect(&self);
}
