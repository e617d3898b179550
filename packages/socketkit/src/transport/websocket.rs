//! WebSocket transport over tokio-tungstenite.
//!
//! One task per connection attempt owns the socket. It sends the handshake
//! as request id 0, waits for the matching response, then reports
//! `connected` and pumps frames both ways until either side closes.
//! Outbound frames reach the task through an unbounded channel so `send`
//! never blocks the caller.

use anyhow::{Context, Result, bail};
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::{
    self, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::error::{RemoteError, TransportError};
use crate::frame::{Frame, HANDSHAKE_ID, HANDSHAKE_OPERATION};
use crate::handshake::Handshake;
use crate::transport::{Transport, TransportSink};

/// Close code sent when the server rejects the handshake.
pub const HANDSHAKE_REJECTED: u16 = 4001;

const NORMAL_CLOSE: u16 = 1000;
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSE: u16 = 1006;

struct Link {
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}

pub struct WebSocketTransport {
    config: WebSocketConfig,
    link: Mutex<Option<Link>>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(WebSocketConfig::default())
    }
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
        }
    }
}

impl Transport for WebSocketTransport {
    fn connect(
        &self,
        endpoint: &str,
        handshake: &Handshake,
        sink: TransportSink,
    ) -> Result<(), TransportError> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let mut link = self.link.lock();
        if link.as_ref().is_some_and(Link::is_alive) {
            return Err(TransportError::AlreadyOpen);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        *link = Some(Link {
            tx,
            cancel: cancel.clone(),
        });

        runtime.spawn(run_connection(
            endpoint.to_string(),
            handshake.clone(),
            self.config.clone(),
            rx,
            cancel,
            sink,
        ));
        Ok(())
    }

    fn send(&self, frame: String) -> Result<(), TransportError> {
        let link = self.link.lock();
        let link = link.as_ref().ok_or(TransportError::NotOpen)?;
        if link.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        link.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn disconnect(&self) {
        if let Some(link) = self.link.lock().take() {
            link.cancel.cancel();
        }
    }
}

async fn run_connection(
    endpoint: String,
    handshake: Handshake,
    config: WebSocketConfig,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    sink: TransportSink,
) {
    let (code, reason) = match drive(&endpoint, &handshake, &config, outbound, &cancel, &sink).await
    {
        Ok(close) => close,
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "websocket connection failed");
            sink.error(format!("{e:#}"));
            (ABNORMAL_CLOSE, e.to_string())
        }
    };
    cancel.cancel();
    info!(endpoint = %endpoint, code, reason = %reason, "websocket closed");
    sink.disconnected(code, reason);
}

/// Runs one connection to completion and returns the close code and reason.
async fn drive(
    endpoint: &str,
    handshake: &Handshake,
    config: &WebSocketConfig,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    sink: &TransportSink,
) -> Result<(u16, String)> {
    debug!(endpoint = %endpoint, "opening websocket");
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(client_close()),
        opened = connect_async_with_config(endpoint, None, true) => {
            opened.context("websocket connect failed")?.0
        }
    };
    let (mut write, mut read) = stream.split();

    let hello = Frame::request(HANDSHAKE_ID, HANDSHAKE_OPERATION, handshake.payload().clone())
        .encode()?;
    write
        .send(Message::Text(hello.into()))
        .await
        .context("failed to send handshake")?;

    let mut early = Vec::new();
    let ack = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = write.send(close_message(NORMAL_CLOSE, "client disconnect")).await;
            return Ok(client_close());
        }
        ack = tokio::time::timeout(
            config.handshake_timeout,
            await_handshake(&mut read, &mut early),
        ) => {
            ack.map_err(|_| {
                anyhow::anyhow!("handshake timed out after {:?}", config.handshake_timeout)
            })??
        }
    };

    if let Err(rejection) = ack {
        warn!(endpoint = %endpoint, reason = %rejection, "handshake rejected");
        sink.error(format!("handshake rejected: {rejection}"));
        let _ = write
            .send(close_message(HANDSHAKE_REJECTED, &rejection.message))
            .await;
        return Ok((HANDSHAKE_REJECTED, rejection.message));
    }

    info!(endpoint = %endpoint, "websocket connected");
    sink.connected();
    for text in early.drain(..) {
        deliver(&text, config.max_message_size, sink);
    }

    let mut keepalive = config
        .keepalive
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(close_message(NORMAL_CLOSE, "client disconnect")).await;
                return Ok(client_close());
            }
            Some(frame) = outbound.recv() => {
                write
                    .send(Message::Text(frame.into()))
                    .await
                    .context("websocket write failed")?;
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    deliver(text.as_str(), config.max_message_size, sink);
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => deliver(text, config.max_message_size, sink),
                    Err(_) => debug!(len = bytes.len(), "dropping non-utf8 binary message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((NO_STATUS, String::new())));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("websocket read failed"),
                None => return Ok((ABNORMAL_CLOSE, "connection closed".to_string())),
            },
            _ = tick(&mut keepalive) => {
                write
                    .send(Message::Ping(Default::default()))
                    .await
                    .context("keepalive ping failed")?;
            }
        }
    }
}

/// Reads until the handshake response arrives.
///
/// Text that shows up first is kept in `early` and handed to the sink once
/// the connection is reported open.
async fn await_handshake<S>(
    read: &mut S,
    early: &mut Vec<String>,
) -> Result<Result<Value, RemoteError>>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        match msg.context("websocket read failed during handshake")? {
            Message::Text(text) => match Frame::decode(text.as_str()) {
                Ok(Frame::Response {
                    id: HANDSHAKE_ID,
                    outcome,
                }) => return Ok(outcome),
                _ => {
                    debug!(len = text.len(), "holding frame that arrived before handshake ack");
                    early.push(text.as_str().to_string());
                }
            },
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => early.push(text),
                Err(_) => debug!(len = bytes.len(), "dropping non-utf8 binary message"),
            },
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default();
                bail!("server closed the connection during handshake: {reason}");
            }
            _ => {}
        }
    }
    bail!("connection ended before handshake ack")
}

fn deliver(text: &str, max_message_size: usize, sink: &TransportSink) {
    if text.len() > max_message_size {
        warn!(
            len = text.len(),
            max = max_message_size,
            "dropping oversized message"
        );
        sink.error(format!(
            "message too large: {} bytes (max {})",
            text.len(),
            max_message_size
        ));
        return;
    }
    sink.message(text);
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

fn client_close() -> (u16, String) {
    (NORMAL_CLOSE, "client disconnect".to_string())
}
