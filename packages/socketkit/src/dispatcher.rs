//! Request/response correlation.
//!
//! Every outbound call gets a fresh correlation id and an entry in the
//! pending table. The entry leaves the table exactly once: when the matching
//! response arrives, when the connection drops, or when the caller drops the
//! returned [`PendingReply`]. Removing the entry and settling its completion
//! happen together under the table lock, so no reply settles twice.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionManager;
use crate::error::{ProtocolAnomaly, RemoteError, SessionError};
use crate::frame::{CorrelationId, Frame, HANDSHAKE_ID};

/// Process-wide so ids stay unique across sessions sharing one server.
static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(HANDSHAKE_ID + 1);

fn next_correlation_id() -> CorrelationId {
    NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
}

type Completion = oneshot::Sender<Result<Value, SessionError>>;

struct PendingRequest {
    operation: String,
    created_at: Instant,
    completion: Completion,
}

/// Tracks outstanding requests by correlation id.
#[derive(Default)]
pub struct RpcDispatcher {
    /// Keyed by id; ids are allocated under this lock, so key order is
    /// creation order.
    pending: Mutex<BTreeMap<CorrelationId, PendingRequest>>,
    anomalies: AtomicU64,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue `operation` over `connection` and return a handle to its reply.
    ///
    /// Fails with [`SessionError::NotConnected`] unless the connection is
    /// `Connected`; the pending table is left untouched in that case.
    pub fn send(
        self: &Arc<Self>,
        connection: &ConnectionManager,
        operation: &str,
        payload: Value,
    ) -> Result<PendingReply, SessionError> {
        let reply = connection.while_connected(|| self.register(operation))?;
        let id = reply.id();

        let frame = match Frame::request(id, operation, payload).encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.cancel(id);
                return Err(SessionError::Encode(e.to_string()));
            }
        };

        trace!(id, operation = %operation, "sending request");
        if let Err(e) = connection.transmit(frame) {
            self.cancel(id);
            return Err(e);
        }
        Ok(reply)
    }

    /// Allocate an id and record a pending entry for it.
    fn register(self: &Arc<Self>, operation: &str) -> PendingReply {
        let (completion, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let id = next_correlation_id();
        pending.insert(
            id,
            PendingRequest {
                operation: operation.to_string(),
                created_at: Instant::now(),
                completion,
            },
        );
        PendingReply {
            id,
            rx,
            dispatcher: Arc::downgrade(self),
            settled: false,
        }
    }

    /// Settle the request `id` with the outcome carried by its response.
    pub fn resolve(
        &self,
        id: CorrelationId,
        outcome: Result<Value, RemoteError>,
    ) -> Result<(), ProtocolAnomaly> {
        let Some(request) = self.pending.lock().remove(&id) else {
            return Err(ProtocolAnomaly::UnknownCorrelationId(id));
        };
        debug!(
            id,
            operation = %request.operation,
            ok = outcome.is_ok(),
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "response received"
        );
        if request
            .completion
            .send(outcome.map_err(SessionError::Remote))
            .is_err()
        {
            debug!(id, "reply handle dropped before response arrived");
        }
        Ok(())
    }

    /// Settle every outstanding request with `ConnectionLost`, oldest first.
    ///
    /// Returns the ids that were failed, in the order they were settled.
    pub fn fail_all(&self) -> Vec<CorrelationId> {
        let mut pending = self.pending.lock();
        let drained = std::mem::take(&mut *pending);
        let mut failed = Vec::with_capacity(drained.len());
        for (id, request) in drained {
            trace!(id, operation = %request.operation, "failing request: connection lost");
            let _ = request.completion.send(Err(SessionError::ConnectionLost));
            failed.push(id);
        }
        failed
    }

    /// Forget request `id` without settling it. Returns whether it was pending.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let removed = self.pending.lock().remove(&id);
        if let Some(request) = &removed {
            debug!(id, operation = %request.operation, "request cancelled");
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Log an inbound frame that could not be matched. Never fails.
    pub fn record_anomaly(&self, anomaly: ProtocolAnomaly) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        warn!(anomaly = %anomaly, "protocol anomaly");
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }
}

/// Future returned by `send`; resolves once with the call's outcome.
///
/// Dropping it before it resolves removes the pending request, so a late
/// response is treated as unknown.
#[must_use = "dropping a PendingReply cancels the request"]
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Value, SessionError>>,
    dispatcher: Weak<RpcDispatcher>,
    settled: bool,
}

impl PendingReply {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            // The dispatcher went away with the request still pending.
            Poll::Ready(Err(_)) => Err(SessionError::ConnectionLost),
        };
        self.settled = true;
        Poll::Ready(outcome)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.cancel(self.id);
        }
    }
}
