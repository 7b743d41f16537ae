//! Synchronous publish/subscribe fabric between the mesh core and its
//! consumers.
//!
//! Delivery is ordered: `publish` runs every handler subscribed to the
//! event's kind, in subscription order, before returning. The handler list is
//! snapshotted at the start of each dispatch, so handlers may subscribe or
//! unsubscribe (themselves included) without disturbing the call in flight.
//! Nothing is retained; late subscribers never see earlier events.

use crate::events::{EventKind, MeshEvent};
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Handler = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

/// Cloneable handle on a shared subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for events of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        let mut table = self.table();
        table.next_id += 1;
        let id = SubscriptionId(table.next_id);
        table
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut table = self.table();
        let Some(handlers) = table.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    /// Deliver `event` to every handler currently subscribed to its kind
    pub fn publish(&self, event: MeshEvent) {
        let kind = event.kind();
        let snapshot: Vec<Handler> = {
            let table = self.table();
            table
                .by_kind
                .get(&kind)
                .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        trace!("Publishing {} to {} handler(s)", kind, snapshot.len());
        for handler in snapshot {
            handler(&event);
        }
    }

    /// Number of handlers subscribed to `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.table().by_kind.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table();
        let counts: HashMap<EventKind, usize> = table
            .by_kind
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerIdentity;

    fn left(name: &str) -> MeshEvent {
        MeshEvent::PeerLeft {
            peer: PeerIdentity::format(name, 1),
        }
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            bus.subscribe(EventKind::PeerLeft, move |_| {
                log.lock().unwrap().push(tag);
            });
        }

        bus.publish(left("a"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn only_matching_kind_is_delivered() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));

        let counter = hits.clone();
        bus.subscribe(EventKind::Disconnected, move |_| {
            *counter.lock().unwrap() += 1;
        });

        bus.publish(left("a"));
        assert_eq!(*hits.lock().unwrap(), 0);

        bus.publish(MeshEvent::Disconnected);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));

        let counter = hits.clone();
        let id = bus.subscribe(EventKind::PeerLeft, move |_| {
            *counter.lock().unwrap() += 1;
        });

        bus.publish(left("a"));
        assert!(bus.unsubscribe(EventKind::PeerLeft, id));
        assert!(!bus.unsubscribe(EventKind::PeerLeft, id));
        bus.publish(left("b"));

        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(EventKind::PeerLeft), 0);
    }

    #[test]
    fn subscribing_during_dispatch_does_not_affect_in_flight_publish() {
        let bus = EventBus::new();
        let late_hits = Arc::new(Mutex::new(0));

        let bus_clone = bus.clone();
        let late = late_hits.clone();
        bus.subscribe(EventKind::PeerLeft, move |_| {
            let late = late.clone();
            bus_clone.subscribe(EventKind::PeerLeft, move |_| {
                *late.lock().unwrap() += 1;
            });
        });

        bus.publish(left("a"));
        assert_eq!(*late_hits.lock().unwrap(), 0);
        assert_eq!(bus.subscriber_count(EventKind::PeerLeft), 2);

        // The handler added during the first dispatch sees the second one
        bus.publish(left("b"));
        assert_eq!(*late_hits.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribing_during_dispatch_keeps_snapshot() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let second_id = Arc::new(Mutex::new(None));

        let bus_clone = bus.clone();
        let victim = second_id.clone();
        let first_log = log.clone();
        bus.subscribe(EventKind::PeerLeft, move |_| {
            first_log.lock().unwrap().push("first");
            if let Some(id) = victim.lock().unwrap().take() {
                bus_clone.unsubscribe(EventKind::PeerLeft, id);
            }
        });

        let second_log = log.clone();
        let id = bus.subscribe(EventKind::PeerLeft, move |_| {
            second_log.lock().unwrap().push("second");
        });
        *second_id.lock().unwrap() = Some(id);

        bus.publish(left("a"));
        bus.publish(left("b"));

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "first"]);
    }

    #[test]
    fn late_subscriber_sees_no_replay() {
        let bus = EventBus::new();
        bus.publish(MeshEvent::Disconnected);

        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        bus.subscribe(EventKind::Disconnected, move |_| {
            *counter.lock().unwrap() += 1;
        });

        assert_eq!(*hits.lock().unwrap(), 0);
    }
}
