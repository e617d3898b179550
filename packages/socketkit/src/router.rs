//! Push-event fan-out.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, trace};

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`EventRouter::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: ListenerId,
    listener: Listener,
}

/// Maps event names to listeners, invoked in registration order.
///
/// Registering the same closure twice is allowed; it then runs twice per event.
#[derive(Default)]
pub struct EventRouter {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .entry(event.into())
            .or_default()
            .push(Subscription {
                id,
                listener: Arc::new(listener),
            });
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let mut removed = false;
        subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.subscriptions.read().get(event).map_or(0, Vec::len)
    }

    /// Invoke every listener for `event` with `payload`.
    ///
    /// Listeners run outside the lock, so they may register or remove
    /// listeners; such changes apply from the next event on. A panicking
    /// listener is logged and skipped. Returns how many listeners completed.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let snapshot: Vec<(ListenerId, Listener)> = match self.subscriptions.read().get(event) {
            Some(subs) => subs
                .iter()
                .map(|s| (s.id, s.listener.clone()))
                .collect(),
            None => {
                trace!(event = %event, "push event has no listeners");
                return 0;
            }
        };

        let mut completed = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    error!(
                        event = %event,
                        listener = id.0,
                        panic = %panic_message(panic.as_ref()),
                        "event listener panicked"
                    );
                }
            }
        }
        completed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> Arc<Mutex<Vec<(u32, Value)>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let router = EventRouter::new();
        let log = recorder();
        for n in 1..=3 {
            let log = log.clone();
            router.on("room_updated", move |p| log.lock().push((n, p.clone())));
        }

        let payload = json!({"roomId": 1});
        assert_eq!(router.dispatch("room_updated", &payload), 3);
        assert_eq!(
            *log.lock(),
            vec![(1, payload.clone()), (2, payload.clone()), (3, payload)]
        );
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let router = EventRouter::new();
        let log = recorder();
        router.on("room_updated", |_| panic!("listener failure"));
        for n in 2..=3 {
            let log = log.clone();
            router.on("room_updated", move |p| log.lock().push((n, p.clone())));
        }

        let payload = json!("P");
        assert_eq!(router.dispatch("room_updated", &payload), 2);
        assert_eq!(
            *log.lock(),
            vec![(2, payload.clone()), (3, payload.clone())]
        );

        // The router is still usable afterwards.
        assert_eq!(router.dispatch("room_updated", &payload), 2);
    }

    #[test]
    fn duplicate_registrations_each_fire() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicU64::new(0));
        let listener = {
            let hits = hits.clone();
            move |_: &Value| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        };
        router.on("x", listener.clone());
        router.on("x", listener);

        router.dispatch("x", &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn events_are_routed_by_name() {
        let router = EventRouter::new();
        let log = recorder();
        let l = log.clone();
        router.on("a", move |p| l.lock().push((1, p.clone())));

        assert_eq!(router.dispatch("b", &json!(1)), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn off_removes_only_that_listener() {
        let router = EventRouter::new();
        let log = recorder();
        let (l1, l2) = (log.clone(), log.clone());
        let first = router.on("a", move |_| l1.lock().push((1, Value::Null)));
        router.on("a", move |_| l2.lock().push((2, Value::Null)));

        assert!(router.off(first));
        assert!(!router.off(first));
        assert_eq!(router.listener_count("a"), 1);

        router.dispatch("a", &Value::Null);
        assert_eq!(*log.lock(), vec![(2, Value::Null)]);
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let router = Arc::new(EventRouter::new());
        let r = router.clone();
        router.on("a", move |_| {
            r.on("a", |_| {});
        });

        assert_eq!(router.dispatch("a", &Value::Null), 1);
        assert_eq!(router.listener_count("a"), 2);
    }
}
