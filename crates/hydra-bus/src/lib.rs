//! Pub/sub broadcast of [`HydraEvent`]s to zero or more subscribers, with a
//! bounded history buffer new subscribers can drain to catch up.
//!
//! Each subscriber gets its own buffered channel so a slow subscriber can't
//! stall a fast one; `publish` is a best-effort fan-out — a full or
//! disconnected subscriber is dropped rather than blocking the publisher.

use std::collections::VecDeque;
use std::sync::Mutex;

use hydra_core::Envelope;

const DEFAULT_HISTORY_CAP: usize = 1024;
const DEFAULT_SUBSCRIBER_CAP: usize = 256;

struct Subscriber {
    tx: flume::Sender<Envelope>,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    history: VecDeque<Envelope>,
    history_cap: usize,
}

/// Typed, bounded-history event bus. Cheap to clone (wraps an `Arc`
/// internally via the mutex being shared); construct one per orchestrator
/// and hand clones to every phase runner.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(history_cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                history: VecDeque::with_capacity(history_cap.min(4096)),
                history_cap,
            }),
        }
    }

    /// Publish an event to every live subscriber and append it to the
    /// bounded history buffer, dropping the oldest entry once full.
    pub fn publish(&self, event: Envelope) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");

        if inner.history.len() >= inner.history_cap {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());

        inner.subscribers.retain(|s| {
            if let Err(flume::TrySendError::Disconnected(_)) = s.tx.try_send(event.clone()) {
                false
            } else {
                true
            }
        });
    }

    /// Subscribe to future events. The returned receiver is bounded —
    /// a subscriber that never drains will start losing the oldest
    /// unconsumed events once the channel fills, rather than back-pressuring
    /// the publisher (per the "drop-oldest on full" design note).
    pub fn subscribe(&self) -> flume::Receiver<Envelope> {
        let (tx, rx) = flume::bounded(DEFAULT_SUBSCRIBER_CAP);
        self.inner
            .lock()
            .expect("event bus mutex poisoned")
            .subscribers
            .push(Subscriber { tx });
        rx
    }

    /// Snapshot of the most recent events, oldest first, for a subscriber
    /// that wants to catch up on history instead of starting from now.
    pub fn history(&self) -> Vec<Envelope> {
        self.inner
            .lock()
            .expect("event bus mutex poisoned")
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event bus mutex poisoned").subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_core::events::{BatchStartEvent, HydraEvent};

    fn ev(batch: u64) -> Envelope {
        Envelope::new(HydraEvent::BatchStart(BatchStartEvent { batch }))
    }

    #[test]
    fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(ev(1));
        let received = rx.try_recv().unwrap();
        match received.event {
            HydraEvent::BatchStart(e) => assert_eq!(e.batch, 1),
            _ => panic!("wrong event kind"),
        }
    }

    #[test]
    fn disconnected_subscriber_is_dropped_on_next_publish() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe();
        } // dropped immediately
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(ev(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn history_is_capped_and_oldest_is_dropped() {
        let bus = EventBus::with_history_cap(2);
        bus.publish(ev(1));
        bus.publish(ev(2));
        bus.publish(ev(3));
        let history = bus.history();
        assert_eq!(history.len(), 2);
        match (&history[0].event, &history[1].event) {
            (HydraEvent::BatchStart(a), HydraEvent::BatchStart(b)) => {
                assert_eq!(a.batch, 2);
                assert_eq!(b.batch, 3);
            }
            _ => panic!("wrong event kinds"),
        }
    }
}
