//! Connection lifecycle and inbound frame routing.
//!
//! `ConnectionManager` owns the transport and the connection state. Each
//! `connect()` starts a new attempt; the sink handed to the transport is
//! tagged with that attempt so late events from an abandoned link cannot
//! touch the current one.
//!
//! Lock order: `link` before the dispatcher's pending table. Neither lock is
//! held while calling into the transport or into listeners.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dispatcher::RpcDispatcher;
use crate::error::{ProtocolAnomaly, SessionError, TransportError};
use crate::frame::Frame;
use crate::handshake::Handshake;
use crate::router::EventRouter;
use crate::transport::{Transport, TransportEvent, TransportSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Lifecycle notifications published to session subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Error { message: String },
}

#[derive(Debug, Default)]
struct Link {
    state: ConnectionState,
    attempt: u64,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    link: Mutex<Link>,
    events: broadcast::Sender<SessionEvent>,
    dispatcher: Arc<RpcDispatcher>,
    router: Arc<EventRouter>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<RpcDispatcher>,
        router: Arc<EventRouter>,
        lifecycle_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(lifecycle_capacity.max(1));
        Self {
            transport,
            link: Mutex::new(Link::default()),
            events,
            dispatcher,
            router,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start opening the transport.
    ///
    /// A call while already connecting or connected is logged and ignored.
    /// `Connected` is published once the transport reports the link open.
    pub fn connect(
        self: &Arc<Self>,
        endpoint: &str,
        handshake: Handshake,
    ) -> Result<(), SessionError> {
        let attempt = {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Disconnected {
                warn!(
                    state = %link.state,
                    endpoint = %endpoint,
                    "connect ignored: session is not disconnected"
                );
                return Ok(());
            }
            link.state = ConnectionState::Connecting;
            link.attempt += 1;
            link.attempt
        };

        info!(endpoint = %endpoint, attempt, "connecting");
        let sink = self.sink_for(attempt);
        if let Err(e) = self.transport.connect(endpoint, &handshake, sink) {
            let mut link = self.link.lock();
            if link.attempt == attempt && link.state == ConnectionState::Connecting {
                link.state = ConnectionState::Disconnected;
            }
            drop(link);
            warn!(endpoint = %endpoint, error = %e, "transport refused to connect");
            return Err(e.into());
        }
        Ok(())
    }

    /// Ask the transport to close. No-op while disconnected.
    ///
    /// The state changes when the transport reports `disconnected`.
    pub fn disconnect(&self) {
        let state = self.state();
        if state == ConnectionState::Disconnected {
            debug!("disconnect ignored: not connected");
            return;
        }
        info!(state = %state, "disconnecting");
        self.transport.disconnect();
    }

    /// Run `f` while holding the state lock, provided the link is connected.
    pub(crate) fn while_connected<R>(&self, f: impl FnOnce() -> R) -> Result<R, SessionError> {
        let link = self.link.lock();
        if link.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        Ok(f())
    }

    /// Hand a frame to the transport.
    ///
    /// A link that died before its `disconnected` event reached us reports
    /// `ConnectionLost`, same as a call caught by the disconnect itself.
    pub(crate) fn transmit(&self, frame: String) -> Result<(), SessionError> {
        self.transport.send(frame).map_err(|e| match e {
            TransportError::Closed | TransportError::NotOpen => {
                debug!(error = %e, "link gone before disconnect was reported");
                SessionError::ConnectionLost
            }
            other => SessionError::from(other),
        })
    }

    fn sink_for(self: &Arc<Self>, attempt: u64) -> TransportSink {
        let manager: Weak<Self> = Arc::downgrade(self);
        TransportSink::new(move |event| {
            if let Some(manager) = manager.upgrade() {
                manager.handle(attempt, event);
            }
        })
    }

    fn handle(&self, attempt: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                {
                    let mut link = self.link.lock();
                    if link.attempt != attempt || link.state != ConnectionState::Connecting {
                        debug!(attempt, "ignoring connected from a stale attempt");
                        return;
                    }
                    link.state = ConnectionState::Connected;
                }
                info!(attempt, "connected");
                self.publish(SessionEvent::Connected);
            }
            TransportEvent::Disconnected { code, reason } => {
                let failed = {
                    let mut link = self.link.lock();
                    if link.attempt != attempt || link.state == ConnectionState::Disconnected {
                        debug!(attempt, code, "ignoring disconnected from a stale attempt");
                        return;
                    }
                    link.state = ConnectionState::Disconnected;
                    self.dispatcher.fail_all()
                };
                info!(attempt, code, reason = %reason, failed = failed.len(), "disconnected");
                self.publish(SessionEvent::Disconnected { code, reason });
            }
            TransportEvent::Error(message) => {
                if self.link.lock().attempt != attempt {
                    debug!(attempt, error = %message, "ignoring error from a stale attempt");
                    return;
                }
                warn!(attempt, error = %message, "transport error");
                self.publish(SessionEvent::Error { message });
            }
            TransportEvent::Message(text) => {
                let live = {
                    let link = self.link.lock();
                    link.attempt == attempt && link.state != ConnectionState::Disconnected
                };
                if live {
                    self.route(&text);
                } else {
                    debug!(attempt, "dropping frame from a closed link");
                }
            }
        }
    }

    fn route(&self, text: &str) {
        match Frame::decode(text) {
            Ok(Frame::Response { id, outcome }) => {
                if let Err(anomaly) = self.dispatcher.resolve(id, outcome) {
                    self.dispatcher.record_anomaly(anomaly);
                }
            }
            Ok(Frame::Push { event, payload }) => {
                debug!(event = %event, "push event");
                self.router.dispatch(&event, &payload);
            }
            Ok(Frame::Request { id, operation, .. }) => {
                self.dispatcher
                    .record_anomaly(ProtocolAnomaly::UnexpectedRequest { id, operation });
            }
            Err(e) => {
                self.dispatcher
                    .record_anomaly(ProtocolAnomaly::UndecodableFrame(e.to_string()));
            }
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
