//! ==============================================================================
//! events.rs - process-wide event bus
//! ==============================================================================
//!
//! purpose:
//!     decouples modules. a publisher never waits for handlers to run; it only
//!     waits for room in each subscriber's bounded buffer.
//!
//! delivery:
//!     every subscription owns one task that runs its handler for one event
//!     at a time, so a subscriber sees a topic's publishes in publish order.
//!     nothing is promised about ordering across topics.
//!
//! payloads:
//!     payloads are type-erased. a handler that receives a shape it does not
//!     expect returns `EventError::IncorrectPayload`; that is logged and the
//!     event is treated as declined.
//!
//! ==============================================================================

use crate::error::EventError;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// payload: `DeviceInfo`
    DeviceLoggedOnNetwork,
    /// payload: device id (`String`)
    DeviceRemovedFromNetwork,
    /// payload: `SensorsDiff`
    SensorsRegisterChanged,
    /// payload: `MetricReadingRecord`
    MetricReadingsPostFailed,
    /// payload: `()`
    CacheRefreshed,
    /// payload: `Requirement`
    RequirementUpserted,
    /// payload: requirement id (`String`)
    RequirementRemoved,
    /// payload: `Location`
    LocationUpdated,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone)]
pub struct Event {
    pub topic: Topic,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Event {
    pub fn new<T: Any + Send + Sync>(topic: Topic, payload: T) -> Self {
        Self { topic, payload: Arc::new(payload) }
    }

    /// borrow the payload as `T`, or report an incorrect payload
    pub fn payload<T: Any + Send + Sync>(&self) -> Result<&T, EventError> {
        self.payload.downcast_ref::<T>().ok_or_else(|| EventError::IncorrectPayload {
            topic: self.topic.to_string(),
            expected: type_name::<T>(),
        })
    }
}

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), EventError>> + Send + Sync>;

/// wrap an async closure as an `EventHandler`
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EventError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

pub struct EventBus {
    buffer: usize,
    subscribers: RwLock<HashMap<Topic, Vec<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// handle returned by `subscribe`; dropping it keeps the subscription alive
pub struct Subscription {
    id: u64,
    topic: Topic,
    bus: Weak<EventBus>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.topic, self.id);
        }
    }
}

impl EventBus {
    /// `buffer` bounds how many undelivered events each subscriber may hold
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer: buffer.max(1),
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscribe(self: &Arc<Self>, topic: Topic, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel::<Event>(self.buffer);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match handler(event).await {
                    Ok(()) => {}
                    Err(e @ EventError::IncorrectPayload { .. }) => {
                        tracing::warn!(%topic, error = %e, "event declined");
                    }
                    Err(e) => tracing::warn!(%topic, error = %e, "event handler failed"),
                }
            }
        });

        self.subscribers.write().entry(topic).or_default().push(Subscriber { id, tx });
        tracing::debug!(%topic, subscription = id, "subscribed");
        Subscription { id, topic, bus: Arc::downgrade(self) }
    }

    /// hand `payload` to every subscriber of `topic`
    pub async fn publish<T: Any + Send + Sync>(&self, topic: Topic, payload: T) -> Result<(), EventError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::Closed);
        }
        let event = Event::new(topic, payload);
        let targets: Vec<mpsc::Sender<Event>> = self
            .subscribers
            .read()
            .get(&topic)
            .map(|subs| subs.iter().map(|s| s.tx.clone()).collect())
            .unwrap_or_default();

        tracing::debug!(%topic, subscribers = targets.len(), "publish");
        for tx in targets {
            // a closed receiver means the subscriber just left
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers.read().get(&topic).map_or(0, Vec::len)
    }

    /// drop every subscription and refuse further publishes
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().clear();
        tracing::debug!("event bus closed");
    }

    fn remove(&self, topic: Topic, id: u64) {
        let mut guard = self.subscribers.write();
        if let Some(subs) = guard.get_mut(&topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                guard.remove(&topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recording_handler(tx: mpsc::UnboundedSender<u32>) -> EventHandler {
        event_handler(move |event| {
            let tx = tx.clone();
            async move {
                let n = *event.payload::<u32>()?;
                let _ = tx.send(n);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn same_topic_is_fifo_per_subscriber() {
        let bus = EventBus::new(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(Topic::CacheRefreshed, recording_handler(tx));

        for n in 0..20u32 {
            bus.publish(Topic::CacheRefreshed, n).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn every_subscriber_gets_each_publish_once() {
        let bus = EventBus::new(8);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bus.subscribe(Topic::RequirementRemoved, recording_handler(tx1));
        bus.subscribe(Topic::RequirementRemoved, recording_handler(tx2));
        bus.subscribe(Topic::LocationUpdated, recording_handler(mpsc::unbounded_channel().0));

        bus.publish(Topic::RequirementRemoved, 7u32).await.unwrap();
        assert_eq!(rx1.recv().await, Some(7));
        assert_eq!(rx2.recv().await, Some(7));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrong_payload_is_declined_not_fatal() {
        let bus = EventBus::new(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(Topic::CacheRefreshed, recording_handler(tx));

        bus.publish(Topic::CacheRefreshed, "not a number".to_string()).await.unwrap();
        bus.publish(Topic::CacheRefreshed, 3u32).await.unwrap();
        assert_eq!(rx.recv().await, Some(3));
    }

    #[test]
    fn payload_mismatch_is_distinguished() {
        let event = Event::new(Topic::LocationUpdated, 1u8);
        assert!(matches!(event.payload::<String>(), Err(EventError::IncorrectPayload { .. })));
        assert_eq!(*event.payload::<u8>().unwrap(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_and_close() {
        let bus = EventBus::new(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = bus.subscribe(Topic::CacheRefreshed, recording_handler(tx));
        assert_eq!(bus.subscriber_count(Topic::CacheRefreshed), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(Topic::CacheRefreshed), 0);
        bus.publish(Topic::CacheRefreshed, 1u32).await.unwrap();
        assert_eq!(rx.recv().await, None);

        bus.close();
        assert!(matches!(bus.publish(Topic::CacheRefreshed, 1u32).await, Err(EventError::Closed)));
    }
}
