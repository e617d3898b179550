//! In-process transport.
//!
//! Records every outbound frame and lets its holder play the server: accept
//! or reject the link, deliver frames, close it. An optional responder
//! answers requests synchronously as they are sent.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::TransportError;
use crate::frame::Frame;
use crate::handshake::Handshake;
use crate::transport::{Transport, TransportSink};

type Responder = Arc<dyn Fn(&Frame) -> Option<Frame> + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    sink: Option<TransportSink>,
    endpoint: Option<String>,
    handshake: Option<Handshake>,
    sent: Vec<String>,
    connect_calls: usize,
    disconnect_calls: usize,
    responder: Option<Responder>,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every outbound request with whatever `responder` returns.
    pub fn set_responder(
        &self,
        responder: impl Fn(&Frame) -> Option<Frame> + Send + Sync + 'static,
    ) {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.state.lock().endpoint.clone()
    }

    pub fn handshake(&self) -> Option<Handshake> {
        self.state.lock().handshake.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    /// Raw outbound frames, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Outbound frames decoded; undecodable ones are skipped.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent()
            .iter()
            .filter_map(|text| Frame::decode(text).ok())
            .collect()
    }

    fn current_sink(&self) -> Option<TransportSink> {
        self.state.lock().sink.clone()
    }

    /// Report the link as established.
    pub fn accept(&self) {
        if let Some(sink) = self.current_sink() {
            sink.connected();
        }
    }

    /// Report a transport error without closing the link.
    pub fn fail(&self, message: &str) {
        if let Some(sink) = self.current_sink() {
            sink.error(message);
        }
    }

    /// Deliver a raw inbound frame.
    pub fn deliver_raw(&self, text: &str) {
        if let Some(sink) = self.current_sink() {
            sink.message(text);
        }
    }

    /// Deliver an inbound frame.
    pub fn deliver(&self, frame: &Frame) {
        match frame.encode() {
            Ok(text) => self.deliver_raw(&text),
            Err(e) => debug!(error = %e, "memory transport: frame did not encode"),
        }
    }

    /// Close the link from the remote side.
    pub fn close(&self, code: u16, reason: &str) {
        let sink = self.state.lock().sink.take();
        if let Some(sink) = sink {
            sink.disconnected(code, reason);
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        endpoint: &str,
        handshake: &Handshake,
        sink: TransportSink,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.sink.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        state.sink = Some(sink);
        state.endpoint = Some(endpoint.to_string());
        state.handshake = Some(handshake.clone());
        state.connect_calls += 1;
        Ok(())
    }

    fn send(&self, frame: String) -> Result<(), TransportError> {
        let (sink, responder) = {
            let mut state = self.state.lock();
            let Some(sink) = state.sink.clone() else {
                return Err(TransportError::NotOpen);
            };
            state.sent.push(frame.clone());
            (sink, state.responder.clone())
        };

        if let Some(responder) = responder {
            if let Ok(request) = Frame::decode(&frame) {
                if let Some(reply) = responder(&request) {
                    match reply.encode() {
                        Ok(text) => sink.message(text),
                        Err(e) => debug!(error = %e, "memory transport: reply did not encode"),
                    }
                }
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        let sink = {
            let mut state = self.state.lock();
            state.disconnect_calls += 1;
            state.sink.take()
        };
        if let Some(sink) = sink {
            sink.disconnected(1000, "client disconnect");
        }
    }
}
