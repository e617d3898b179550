use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::connection::{ConnectionManager, ConnectionState, SessionEvent};
use crate::dispatcher::{PendingReply, RpcDispatcher};
use crate::error::SessionError;
use crate::handshake::Handshake;
use crate::mapping::EventMapping;
use crate::router::{EventRouter, ListenerId};
use crate::transport::Transport;

const DEFAULT_LIFECYCLE_CAPACITY: usize = 64;

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub pending: usize,
    pub anomalies: u64,
}

/// One logical connection carrying calls and push events.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Session {
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<RpcDispatcher>,
    router: Arc<EventRouter>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_lifecycle_capacity(transport, DEFAULT_LIFECYCLE_CAPACITY)
    }

    pub fn with_lifecycle_capacity(transport: Arc<dyn Transport>, capacity: usize) -> Self {
        let dispatcher = Arc::new(RpcDispatcher::new());
        let router = Arc::new(EventRouter::new());
        let connection = Arc::new(ConnectionManager::new(
            transport,
            dispatcher.clone(),
            router.clone(),
            capacity,
        ));
        Self {
            connection,
            dispatcher,
            router,
        }
    }

    pub fn connect(&self, endpoint: &str, handshake: Handshake) -> Result<(), SessionError> {
        self.connection.connect(endpoint, handshake)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect()
    }

    /// Disconnect and wait up to `timeout` for the transport to confirm.
    ///
    /// Returns false if no `Disconnected` arrived in time.
    pub async fn close(&self, timeout: Duration) -> bool {
        let mut lifecycle = self.lifecycle();
        if self.state() == ConnectionState::Disconnected {
            return true;
        }
        self.disconnect();

        let closed = async {
            loop {
                match lifecycle.recv().await {
                    Ok(SessionEvent::Disconnected { .. }) | Err(RecvError::Closed) => return,
                    Err(RecvError::Lagged(_)) if self.state() == ConnectionState::Disconnected => {
                        return;
                    }
                    _ => {}
                }
            }
        };
        tokio::time::timeout(timeout, closed).await.is_ok()
    }

    /// Issue a call. Fails immediately with `NotConnected` unless connected;
    /// otherwise the returned future settles exactly once.
    pub fn send(&self, operation: &str, payload: Value) -> Result<PendingReply, SessionError> {
        self.dispatcher.send(&self.connection, operation, payload)
    }

    pub async fn call(&self, operation: &str, payload: Value) -> Result<Value, SessionError> {
        self.send(operation, payload)?.await
    }

    pub fn on(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.router.on(event, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.router.off(id)
    }

    /// Subscribe `listener` to every internal event in `mapping`; it receives
    /// the public name along with the payload.
    pub fn on_mapped(
        &self,
        mapping: EventMapping,
        listener: impl Fn(&'static str, &Value) + Send + Sync + 'static,
    ) -> Vec<ListenerId> {
        let listener = Arc::new(listener);
        mapping
            .iter()
            .map(|(internal, public)| {
                let listener = listener.clone();
                self.router
                    .on(internal, move |payload| listener(public, payload))
            })
            .collect()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Lifecycle notifications published after this call.
    pub fn lifecycle(&self) -> broadcast::Receiver<SessionEvent> {
        self.connection.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            pending: self.dispatcher.len(),
            anomalies: self.dispatcher.anomaly_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, TransportError};
    use crate::frame::Frame;
    use crate::mapping::CHAT_EVENTS;
    use crate::transport::TransportSink;
    use crate::transport::memory::MemoryTransport;
    use parking_lot::Mutex;
    use serde_json::json;

    fn connected() -> (Session, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let session = Session::new(transport.clone());
        session.connect("mem://test", Handshake::default()).unwrap();
        transport.accept();
        assert_eq!(session.state(), ConnectionState::Connected);
        (session, transport)
    }

    fn last_request_id(transport: &MemoryTransport) -> u64 {
        transport
            .sent_frames()
            .last()
            .and_then(Frame::correlation_id)
            .unwrap()
    }

    #[tokio::test]
    async fn round_trip_resolves_and_clears_pending() {
        let (session, transport) = connected();
        let reply = session.send("get_current_client", json!({})).unwrap();

        let sent = transport.sent_frames();
        assert_eq!(
            sent,
            vec![Frame::request(reply.id(), "get_current_client", json!({}))]
        );
        assert_eq!(session.stats().pending, 1);

        transport.deliver(&Frame::reply(reply.id(), json!({"id": 7})));
        assert_eq!(session.stats().pending, 0);
        assert_eq!(reply.await, Ok(json!({"id": 7})));
    }

    #[tokio::test]
    async fn remote_error_reaches_caller() {
        let (session, transport) = connected();
        transport.set_responder(|frame| match frame {
            Frame::Request { id, .. } => Some(Frame::reject(
                *id,
                RemoteError::from_value(json!({"code": "forbidden", "message": "nope"})),
            )),
            _ => None,
        });

        let err = session.call("create_room", json!({})).await.unwrap_err();
        let remote = err.remote().unwrap();
        assert_eq!(remote.code.as_deref(), Some("forbidden"));
        assert_eq!(remote.message, "nope");
    }

    #[test]
    fn send_while_not_connected_fails_without_pending() {
        let transport = Arc::new(MemoryTransport::new());
        let session = Session::new(transport.clone());

        assert_eq!(
            session.send("op", Value::Null).unwrap_err(),
            SessionError::NotConnected
        );

        session.connect("mem://test", Handshake::default()).unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(
            session.send("op", Value::Null).unwrap_err(),
            SessionError::NotConnected
        );
        assert_eq!(session.stats().pending, 0);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_call() {
        let (session, transport) = connected();

        let mut tasks = Vec::new();
        for n in 0..3 {
            let reply = session.send("slow", json!(n)).unwrap();
            tasks.push(tokio::spawn(reply));
        }

        session.disconnect();
        assert_eq!(transport.disconnect_calls(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.stats().pending, 0);

        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(SessionError::ConnectionLost));
        }
    }

    #[tokio::test]
    async fn unknown_response_invokes_no_listener() {
        let (session, transport) = connected();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        session.on("room_updated", move |_| *h.lock() += 1);

        let reply = session.send("op", Value::Null).unwrap();
        transport.deliver(&Frame::reply(reply.id() + 10_000, json!("stray")));

        assert_eq!(*hits.lock(), 0);
        assert_eq!(session.stats().anomalies, 1);
        assert_eq!(session.stats().pending, 1);
    }

    #[test]
    fn push_reaches_three_listeners_despite_first_panicking() {
        let (session, transport) = connected();
        let seen = Arc::new(Mutex::new(Vec::new()));

        session.on("room_updated", |_| panic!("first listener fails"));
        for n in 2..=3 {
            let seen = seen.clone();
            session.on("room_updated", move |p| seen.lock().push((n, p.clone())));
        }

        let payload = json!({"roomId": 1, "title": "t"});
        transport.deliver(&Frame::push("room_updated", payload.clone()));
        assert_eq!(
            *seen.lock(),
            vec![(2, payload.clone()), (3, payload)]
        );
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn concurrent_sends_get_distinct_ids() {
        let (session, transport) = connected();
        transport.set_responder(|frame| match frame {
            Frame::Request { id, payload, .. } => Some(Frame::reply(*id, payload.clone())),
            _ => None,
        });

        let mut tasks = Vec::new();
        for n in 0..32 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                session.call("echo", json!(n)).await
            }));
        }
        for (n, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), Ok(json!(n)));
        }

        let mut ids: Vec<_> = transport
            .sent_frames()
            .iter()
            .filter_map(Frame::correlation_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(session.stats().pending, 0);
    }

    #[tokio::test]
    async fn dropped_reply_ignores_late_response() {
        let (session, transport) = connected();
        let reply = session.send("op", Value::Null).unwrap();
        let id = reply.id();
        let other = session.send("other", Value::Null).unwrap();
        drop(reply);

        assert_eq!(session.stats().pending, 1);
        transport.deliver(&Frame::reply(id, json!("late")));
        assert_eq!(session.stats().anomalies, 1);

        transport.deliver(&Frame::reply(last_request_id(&transport), json!("ok")));
        assert_eq!(other.await, Ok(json!("ok")));
    }

    #[tokio::test]
    async fn timeout_layered_by_caller_cancels_request() {
        let (session, _transport) = connected();
        let reply = session.send("never", Value::Null).unwrap();
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(10), reply).await;
        assert!(outcome.is_err());
        assert_eq!(session.stats().pending, 0);
    }

    #[test]
    fn lifecycle_events_are_published() {
        let transport = Arc::new(MemoryTransport::new());
        let session = Session::new(transport.clone());
        let mut lifecycle = session.lifecycle();

        session.connect("mem://test", Handshake::default()).unwrap();
        transport.accept();
        transport.fail("hiccup");
        transport.close(4000, "kicked");

        assert_eq!(lifecycle.try_recv().unwrap(), SessionEvent::Connected);
        assert_eq!(
            lifecycle.try_recv().unwrap(),
            SessionEvent::Error {
                message: "hiccup".into()
            }
        );
        assert_eq!(
            lifecycle.try_recv().unwrap(),
            SessionEvent::Disconnected {
                code: 4000,
                reason: "kicked".into()
            }
        );
    }

    #[test]
    fn reconnect_after_disconnect_uses_new_handshake() {
        let (session, transport) = connected();
        session.disconnect();
        session
            .connect("mem://test", Handshake::new(json!({"token": "second"})))
            .unwrap();
        transport.accept();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_calls(), 2);
        assert_eq!(transport.handshake().unwrap().payload()["token"], "second");
    }

    #[test]
    fn mapped_listener_receives_public_name() {
        let (session, transport) = connected();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let ids = session.on_mapped(CHAT_EVENTS, move |name, payload| {
            s.lock().push((name, payload.clone()))
        });
        assert_eq!(ids.len(), CHAT_EVENTS.len());

        transport.deliver(&Frame::push("joined_to_room", json!({"roomId": 2})));
        transport.deliver(&Frame::push("get_messages", json!({})));
        assert_eq!(*seen.lock(), vec![("joined_to_room", json!({"roomId": 2}))]);

        for id in ids {
            assert!(session.off(id));
        }
        transport.deliver(&Frame::push("joined_to_room", json!({})));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn listener_can_send_from_callback() {
        let (session, transport) = connected();
        let inner = session.clone();
        session.on("room_event", move |_| {
            let reply = inner.send("ack", Value::Null).unwrap();
            std::mem::forget(reply);
        });

        transport.deliver(&Frame::push("room_event", Value::Null));
        assert_eq!(transport.sent_frames().len(), 1);
        assert_eq!(session.stats().pending, 1);
    }

    /// Accepts connections but can no longer carry frames, like a socket
    /// whose task has exited before reporting `disconnected`.
    #[derive(Default)]
    struct DeadLink {
        sink: Mutex<Option<TransportSink>>,
    }

    impl Transport for DeadLink {
        fn connect(
            &self,
            _endpoint: &str,
            _handshake: &Handshake,
            sink: TransportSink,
        ) -> Result<(), TransportError> {
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        fn send(&self, _frame: String) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        fn disconnect(&self) {}
    }

    #[test]
    fn send_on_dead_link_reports_connection_lost() {
        let transport = Arc::new(DeadLink::default());
        let session = Session::new(transport.clone());
        session.connect("mem://dead", Handshake::default()).unwrap();
        let sink = transport.sink.lock().clone().unwrap();
        sink.connected();
        assert_eq!(session.state(), ConnectionState::Connected);

        assert_eq!(
            session.send("op", Value::Null).unwrap_err(),
            SessionError::ConnectionLost
        );
        assert_eq!(session.stats().pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sends_racing_remote_close_all_settle() {
        for _ in 0..50 {
            let (session, transport) = connected();

            let mut senders = Vec::new();
            for _ in 0..8 {
                let session = session.clone();
                senders.push(tokio::spawn(async move {
                    let mut replies = Vec::new();
                    for n in 0..20 {
                        match session.send("op", json!(n)) {
                            Ok(reply) => replies.push(reply),
                            Err(e) => assert!(
                                matches!(
                                    e,
                                    SessionError::NotConnected | SessionError::ConnectionLost
                                ),
                                "unexpected send error: {e:?}"
                            ),
                        }
                        tokio::task::yield_now().await;
                    }
                    replies
                }));
            }

            let closer = {
                let transport = transport.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    transport.close(1006, "link dropped");
                })
            };
            closer.await.unwrap();

            for sender in senders {
                for reply in sender.await.unwrap() {
                    let outcome = tokio::time::timeout(Duration::from_secs(5), reply)
                        .await
                        .expect("reply never settled");
                    assert_eq!(outcome, Err(SessionError::ConnectionLost));
                }
            }
            assert_eq!(session.state(), ConnectionState::Disconnected);
            assert_eq!(session.stats().pending, 0);
        }
    }

    #[tokio::test]
    async fn close_waits_for_disconnected() {
        let (session, transport) = connected();
        let reply = session.send("op", Value::Null).unwrap();

        assert!(session.close(Duration::from_secs(1)).await);
        assert_eq!(transport.disconnect_calls(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(reply.await, Err(SessionError::ConnectionLost));

        // Already closed.
        assert!(session.close(Duration::from_secs(1)).await);
        assert_eq!(transport.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn close_gives_up_when_transport_never_confirms() {
        let transport = Arc::new(DeadLink::default());
        let session = Session::new(transport.clone());
        session.connect("mem://dead", Handshake::default()).unwrap();
        let sink = transport.sink.lock().clone().unwrap();
        sink.connected();

        assert!(!session.close(Duration::from_millis(50)).await);
        assert_eq!(session.state(), ConnectionState::Connected);
    }
}
