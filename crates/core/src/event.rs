//! In-process typed publish/subscribe.
//!
//! Dispatch is synchronous and runs handlers in registration order. A handler
//! that fails or panics is logged and skipped; the remaining handlers for the
//! event still run.

use bytes::Bytes;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

use crate::adapter::{AdapterInfo, AvailableAdapter};
use crate::error::Result;
use crate::progress::{DownloadProgress, TransferFailure, TransferProgress};
use crate::room::Room;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RoomJoined,
    RoomLeft,
    PeersUpdated,
    AdaptersAvailable,
    TransferProgress,
    TransferComplete,
    TransferError,
    DownloadProgress,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::RoomJoined,
        EventKind::RoomLeft,
        EventKind::PeersUpdated,
        EventKind::AdaptersAvailable,
        EventKind::TransferProgress,
        EventKind::TransferComplete,
        EventKind::TransferError,
        EventKind::DownloadProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RoomJoined => "room:joined",
            EventKind::RoomLeft => "room:left",
            EventKind::PeersUpdated => "peers:updated",
            EventKind::AdaptersAvailable => "adapters:available",
            EventKind::TransferProgress => "transfer:progress",
            EventKind::TransferComplete => "transfer:complete",
            EventKind::TransferError => "transfer:error",
            EventKind::DownloadProgress => "download:progress",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    RoomJoined(Room),
    RoomLeft(Room),
    PeersUpdated {
        topic: String,
        peers_count: u32,
    },
    AdaptersAvailable(Vec<AvailableAdapter>),
    TransferProgress(TransferProgress),
    TransferComplete {
        metadata: AdapterInfo,
        data: Bytes,
    },
    TransferError {
        topic: String,
        failure: TransferFailure,
        message: String,
    },
    DownloadProgress(DownloadProgress),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RoomJoined(_) => EventKind::RoomJoined,
            Event::RoomLeft(_) => EventKind::RoomLeft,
            Event::PeersUpdated { .. } => EventKind::PeersUpdated,
            Event::AdaptersAvailable(_) => EventKind::AdaptersAvailable,
            Event::TransferProgress(_) => EventKind::TransferProgress,
            Event::TransferComplete { .. } => EventKind::TransferComplete,
            Event::TransferError { .. } => EventKind::TransferError,
            Event::DownloadProgress(_) => EventKind::DownloadProgress,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct Subscription {
    id: u64,
    kind: EventKind,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.id != id);
        subscriptions.len() != before
    }
}

/// Cheap to clone; clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.write().push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        SubscriptionHandle {
            id,
            kind,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Forwards events of the given kinds into a channel, for async consumers.
    pub fn channel(&self, kinds: &[EventKind]) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let handles = kinds
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                self.subscribe(*kind, move |event| {
                    // receiver gone just means nobody is listening anymore
                    let _ = tx.send(event.clone());
                    Ok(())
                })
            })
            .collect();
        EventReceiver { rx, handles }
    }

    /// Delivers `event` to every handler registered for its kind.
    ///
    /// Returns the number of handlers that ran successfully.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or publish without deadlocking.
        let handlers: Vec<EventHandler> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|sub| sub.kind == kind)
            .map(|sub| Arc::clone(&sub.handler))
            .collect();

        trace!(event = %kind, handlers = handlers.len(), "Dispatching event");

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(event = %kind, error = %e, "Event handler failed"),
                Err(_) => error!(event = %kind, "Event handler panicked"),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscriptions
            .read()
            .iter()
            .filter(|sub| sub.kind == kind)
            .count()
    }
}

/// Returned by [`EventBus::subscribe`]; call [`unsubscribe`](Self::unsubscribe)
/// to stop receiving events.
#[must_use = "dropping the handle keeps the handler registered forever"]
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns false when the handler was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }
}

/// Channel end produced by [`EventBus::channel`]. Unsubscribes when dropped.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
    handles: Vec<SubscriptionHandle>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::room::RoomKind;
    use parking_lot::Mutex;

    fn joined() -> Event {
        Event::RoomJoined(Room::new(RoomKind::General, "ab".repeat(32), None))
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            let _ = bus.subscribe(EventKind::RoomJoined, move |_| {
                order.lock().push(i);
                Ok(())
            });
        }

        assert_eq!(bus.publish(joined()), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_only_matching_kind_receives() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let _ = bus.subscribe(EventKind::RoomLeft, move |_| {
            *h.lock() += 1;
            Ok(())
        });

        bus.publish(joined());
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h = Arc::clone(&hits);
        let _ = bus.subscribe(EventKind::RoomJoined, move |_| {
            h.lock().push("first");
            Err(CoreError::HandlerFailed("boom".into()))
        });
        let _ = bus.subscribe(EventKind::RoomJoined, |_| panic!("handler exploded"));
        let h = Arc::clone(&hits);
        let _ = bus.subscribe(EventKind::RoomJoined, move |_| {
            h.lock().push("last");
            Ok(())
        });

        assert_eq!(bus.publish(joined()), 1);
        assert_eq!(*hits.lock(), vec!["first", "last"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let handle = bus.subscribe(EventKind::RoomJoined, |_| Ok(()));
        assert_eq!(bus.subscriber_count(EventKind::RoomJoined), 1);
        assert!(handle.unsubscribe());
        assert_eq!(bus.subscriber_count(EventKind::RoomJoined), 0);
        assert_eq!(bus.publish(joined()), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let _ = bus.subscribe(EventKind::RoomJoined, move |_| {
            let _ = inner_bus.subscribe(EventKind::RoomLeft, |_| Ok(()));
            Ok(())
        });
        bus.publish(joined());
        assert_eq!(bus.subscriber_count(EventKind::RoomLeft), 1);
    }

    #[tokio::test]
    async fn test_channel_receives_and_cleans_up() {
        let bus = EventBus::new();
        {
            let mut rx = bus.channel(&[EventKind::RoomJoined, EventKind::PeersUpdated]);
            bus.publish(joined());
            bus.publish(Event::PeersUpdated {
                topic: "t".into(),
                peers_count: 2,
            });
            assert_eq!(rx.recv().await.unwrap().kind(), EventKind::RoomJoined);
            assert_eq!(rx.recv().await.unwrap().kind(), EventKind::PeersUpdated);
        }
        assert_eq!(bus.subscriber_count(EventKind::RoomJoined), 0);
    }

    #[test]
    fn test_kind_names() {
        let names: Vec<_> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        assert!(names.contains(&"adapters:available"));
        assert!(names.contains(&"download:progress"));
    }
}
