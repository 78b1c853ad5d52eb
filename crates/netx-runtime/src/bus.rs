//! Typed publish/subscribe channel.
//!
//! An [`EventBus`] fans values out to any number of independent
//! subscribers without polling. Two switches shape its behavior:
//!
//! - **replay**: a new subscriber first receives the latest published value
//! - **distinct**: a value equal to the latest one is not published again
//!
//! State buses (tunnel state, connectivity issues, ongoing work) use both.
//! Activity streams use neither.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Behavior switches for an [`EventBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusOptions {
    /// Replay the latest value to new subscribers
    pub replay: bool,
    /// Suppress consecutive duplicate values
    pub distinct: bool,
}

impl BusOptions {
    /// Options for a "current value" bus
    pub const STATE: BusOptions = BusOptions { replay: true, distinct: true };

    /// Options for a plain event stream
    pub const STREAM: BusOptions = BusOptions { replay: false, distinct: false };
}

struct BusInner<T> {
    latest: Option<T>,
    subscribers: Vec<UnboundedSender<T>>,
}

/// Publish/subscribe channel with an explicit subscriber list
///
/// Cloning the bus yields another handle to the same channel.
pub struct EventBus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
    options: BusOptions,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            options: self.options,
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> EventBus<T> {
    /// Create a bus with the given options
    pub fn new(options: BusOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                latest: None,
                subscribers: Vec::new(),
            })),
            options,
        }
    }

    /// Plain event stream: no replay, every value delivered
    pub fn stream() -> Self {
        Self::new(BusOptions::STREAM)
    }

    /// Current-value bus: replay latest, drop consecutive duplicates
    pub fn state() -> Self {
        Self::new(BusOptions::STATE)
    }

    /// Current-value bus that starts out holding `initial`
    pub fn seeded(initial: T) -> Self {
        let bus = Self::state();
        bus.lock().latest = Some(initial);
        bus
    }

    /// Publish a value to every live subscriber.
    ///
    /// Returns `false` when the value was suppressed as a duplicate.
    pub fn publish(&self, value: T) -> bool {
        let mut inner = self.lock();
        if self.options.distinct && inner.latest.as_ref() == Some(&value) {
            return false;
        }

        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        inner.latest = Some(value);
        true
    }

    /// Subscribe to future values (and the latest one, if replaying)
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if self.options.replay {
            if let Some(latest) = &inner.latest {
                let _ = tx.send(latest.clone());
            }
        }

        inner.subscribers.push(tx);
        Subscription { rx }
    }

    /// Copy of the latest published value
    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    /// Number of subscribers still listening
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of an [`EventBus`] subscription
///
/// Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wait for the next value. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an already delivered value without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait for the first value matching `predicate`, skipping the rest
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        while let Some(value) = self.rx.recv().await {
            if predicate(&value) {
                return Some(value);
            }
        }
        None
    }

    /// Drain everything delivered so far
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            values.push(value);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_does_not_replay() {
        let bus = EventBus::stream();
        bus.publish(1u32);

        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());

        bus.publish(2);
        assert_eq!(sub.try_recv(), Some(2));
    }

    #[test]
    fn test_state_replays_latest() {
        let bus = EventBus::state();
        bus.publish("a".to_string());
        bus.publish("b".to_string());

        let mut sub = bus.subscribe();
        assert_eq!(sub.drain(), vec!["b".to_string()]);
    }

    #[test]
    fn test_distinct_suppresses_duplicates() {
        let bus = EventBus::state();
        let mut sub = bus.subscribe();

        assert!(bus.publish(true));
        assert!(!bus.publish(true));
        assert!(bus.publish(false));

        assert_eq!(sub.drain(), vec![true, false]);
    }

    #[test]
    fn test_stream_delivers_duplicates() {
        let bus = EventBus::stream();
        let mut sub = bus.subscribe();

        bus.publish(7u8);
        bus.publish(7u8);

        assert_eq!(sub.drain(), vec![7, 7]);
    }

    #[test]
    fn test_seeded_bus() {
        let bus = EventBus::seeded(0u32);
        assert_eq!(bus.latest(), Some(0));

        let mut sub = bus.subscribe();
        assert_eq!(sub.try_recv(), Some(0));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::stream();
        let sub_a = bus.subscribe();
        let _sub_b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub_a);
        bus.publish(1u8);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_skips_non_matching() {
        let bus = EventBus::stream();
        let mut sub = bus.subscribe();

        let publisher = bus.clone();
        tokio::spawn(async move {
            for i in 0..5u32 {
                publisher.publish(i);
            }
        });

        assert_eq!(sub.wait_for(|v| *v >= 3).await, Some(3));
    }
}
