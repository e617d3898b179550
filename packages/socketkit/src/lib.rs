//! Client session runtime for a persistent socket carrying two kinds of
//! traffic: correlated request/response calls and server-pushed events.
//!
//! ```no_run
//! use std::sync::Arc;
//! use socketkit::{Credentials, Session, SessionEvent, WebSocketTransport};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new(Arc::new(WebSocketTransport::default()));
//! let mut lifecycle = session.lifecycle();
//!
//! session.on("room_updated", |payload| println!("room updated: {payload}"));
//!
//! let creds = Credentials { token: "abc".into(), account_id: Some(1), ..Default::default() };
//! session.connect("wss://ws.socketkit.com", creds.handshake())?;
//! while lifecycle.recv().await? != SessionEvent::Connected {}
//!
//! let me = session.call("get_current_client", json!({})).await?;
//! println!("{me}");
//! session.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mapping;
pub mod router;
pub mod session;
pub mod transport;

pub use connection::{ConnectionState, SessionEvent};
pub use dispatcher::PendingReply;
pub use error::{ProtocolAnomaly, RemoteError, SessionError, TransportError};
pub use frame::CorrelationId;
pub use handshake::{ConnectionKind, Credentials, Handshake};
pub use mapping::{CHAT_EVENTS, EventMapping};
pub use router::ListenerId;
pub use session::{Session, SessionStats};
pub use transport::memory::MemoryTransport;
pub use transport::websocket::WebSocketTransport;
pub use transport::{Transport, TransportEvent, TransportSink};
