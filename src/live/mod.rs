//! External live-event fan-out
//!
//! The connector to the live platform (gifts, chat, follows, ...) publishes
//! named events here; plugins subscribe through their capability surface.
//! Every subscriber of an event runs concurrently, so a slow or failing
//! subscriber never holds back the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::{BoxFuture, join_all};

/// Type-erased, already error-wrapped subscriber
pub type LiveEventHandler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifier of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    owner: String,
    handler: LiveEventHandler,
}

/// Named-event hub between the live-event source and plugins
#[derive(Default)]
pub struct LiveEventHub {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for LiveEventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("LiveEventHub")
            .field("events", &subs.len())
            .finish_non_exhaustive()
    }
}

impl LiveEventHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `owner` to a named event
    pub fn subscribe(&self, owner: &str, event: &str, handler: LiveEventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(Subscriber {
                id,
                owner: owner.to_string(),
                handler,
            });
        id
    }

    /// Drop one subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in subs.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
        }
        subs.retain(|_, list| !list.is_empty());
        removed
    }

    /// Drop every subscription `owner` holds
    ///
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for list in subs.values_mut() {
            let before = list.len();
            list.retain(|s| s.owner != owner);
            removed += before - list.len();
        }
        subs.retain(|_, list| !list.is_empty());
        removed
    }

    /// Deliver an event to every subscriber
    ///
    /// Returns the number of subscribers invoked.
    pub async fn publish(&self, event: &str, data: serde_json::Value) -> usize {
        let handlers: Vec<LiveEventHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(|list| list.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        let count = handlers.len();
        join_all(handlers.iter().map(|handler| handler(data.clone()))).await;

        tracing::trace!(event = %event, subscribers = count, "published live event");
        count
    }

    /// Number of subscribers for an event
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> LiveEventHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_data| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = LiveEventHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        hub.subscribe("a", "gift", counting(&counter));
        hub.subscribe("b", "gift", counting(&counter));
        hub.subscribe("b", "chat", counting(&counter));

        assert_eq!(hub.publish("gift", json!({"coins": 5})).await, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_owner_stops_delivery() {
        let hub = LiveEventHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        hub.subscribe("a", "gift", counting(&counter));
        hub.subscribe("a", "chat", counting(&counter));
        hub.subscribe("b", "gift", counting(&counter));

        assert_eq!(hub.unsubscribe_owner("a"), 2);
        assert_eq!(hub.subscriber_count("chat"), 0);

        hub.publish("gift", json!(null)).await;
        hub.publish("chat", json!(null)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_single() {
        let hub = LiveEventHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = hub.subscribe("a", "gift", counting(&counter));
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
    }
}
