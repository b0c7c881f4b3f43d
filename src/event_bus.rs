//! Typed publish/subscribe fan-out. Each event kind owns its channel: a
//! most-recent-value cache, an ordered subscriber list, and an independent
//! mutex. Subscribing returns an RAII handle; dropping it unsubscribes.

use crate::cvl_supervisor::CvlState;
use crate::live_data::{AlarmEvent, LiveSnapshot, StatusEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct CvlStateChange {
    pub old_state: CvlState,
    pub new_state: CvlState,
    pub new_cvl_v: f32,
    pub new_ccl_a: f32,
    pub new_dcl_a: f32,
    pub duration_in_old_state_ms: u64,
}

/// Wraps any published payload with a monotonic sequence number and a
/// millisecond timestamp, as every subscriber observes it.
#[derive(Debug, Clone)]
pub struct Envelope<T: Clone> {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub payload: T,
}

type Callback<T> = Box<dyn Fn(&Envelope<T>) + Send + Sync>;

struct Subscriber<T: Clone> {
    id: u64,
    callback: Callback<T>,
}

struct ChannelInner<T: Clone> {
    subscribers: Vec<Subscriber<T>>,
    latest: Option<Envelope<T>>,
}

pub struct EventChannel<T: Clone> {
    inner: Mutex<ChannelInner<T>>,
    sequence: AtomicU64,
    next_subscriber_id: AtomicU64,
    total_published: AtomicU64,
    total_delivered: AtomicU64,
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        EventChannel {
            inner: Mutex::new(ChannelInner {
                subscribers: Vec::new(),
                latest: None,
            }),
            sequence: AtomicU64::new(0),
            next_subscriber_id: AtomicU64::new(0),
            total_published: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> EventChannel<T> {
    pub fn publish(&self, payload: T) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let envelope = Envelope {
            sequence,
            timestamp_ms,
            payload,
        };

        self.total_published.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.inner.lock();
        guard.latest = Some(envelope.clone());
        for sub in &guard.subscribers {
            (sub.callback)(&envelope);
            self.total_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&Envelope<T>) + Send + Sync + 'static,
    ) -> SubscriptionHandle<T> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().subscribers.push(Subscriber {
            id,
            callback: Box::new(callback),
        });
        SubscriptionHandle {
            channel: Arc::downgrade(self),
            id,
        }
    }

    pub fn latest(&self) -> Option<Envelope<T>> {
        self.inner.lock().latest.clone()
    }

    pub fn statistics(&self) -> ChannelStatistics {
        ChannelStatistics {
            total_published: self.total_published.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            subscriber_count: self.inner.lock().subscribers.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStatistics {
    pub total_published: u64,
    pub total_delivered: u64,
    pub subscriber_count: usize,
}

/// RAII unsubscribe handle. Dropping it removes the callback from its
/// channel's subscriber list.
pub struct SubscriptionHandle<T: Clone> {
    channel: Weak<EventChannel<T>>,
    id: u64,
}

impl<T: Clone> Drop for SubscriptionHandle<T> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.inner.lock().subscribers.retain(|s| s.id != self.id);
        }
    }
}

/// Concrete event kinds carried by the bus (§4.11).
#[derive(Default)]
pub struct EventBus {
    pub live_data: Arc<EventChannel<LiveSnapshot>>,
    pub alarm_raised: Arc<EventChannel<AlarmEvent>>,
    pub alarm_cleared: Arc<EventChannel<AlarmEvent>>,
    pub warning_raised: Arc<EventChannel<AlarmEvent>>,
    pub cvl_state_changed: Arc<EventChannel<CvlStateChange>>,
    pub status_message: Arc<EventChannel<StatusEvent>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(EventBus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_data::AlarmSeverity;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn p9_sequence_numbers_strictly_increase() {
        let channel: Arc<EventChannel<u32>> = Arc::new(EventChannel::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _handle = channel.subscribe(move |env| {
            seen_clone.lock().unwrap().push(env.sequence);
        });
        for i in 0..10 {
            channel.publish(i);
        }
        let recorded = seen.lock().unwrap().clone();
        for window in recorded.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[test]
    fn subscribers_invoked_in_registration_order() {
        let channel: Arc<EventChannel<u32>> = Arc::new(EventChannel::default());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let o1 = order.clone();
        let _h1 = channel.subscribe(move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        let _h2 = channel.subscribe(move |_| o2.lock().unwrap().push(2));
        channel.publish(42);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let channel: Arc<EventChannel<u32>> = Arc::new(EventChannel::default());
        let count = Arc::new(StdMutex::new(0));
        let count_clone = count.clone();
        let handle = channel.subscribe(move |_| *count_clone.lock().unwrap() += 1);
        channel.publish(1);
        drop(handle);
        channel.publish(2);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn latest_reflects_most_recent_publish() {
        let channel: Arc<EventChannel<u32>> = Arc::new(EventChannel::default());
        assert!(channel.latest().is_none());
        channel.publish(7);
        channel.publish(9);
        assert_eq!(channel.latest().unwrap().payload, 9);
    }

    #[test]
    fn event_bus_channels_are_independent() {
        let bus = EventBus::new();
        bus.status_message.publish(StatusEvent {
            message: "hello".into(),
            severity: AlarmSeverity::Info,
        });
        assert!(bus.alarm_raised.latest().is_none());
        assert!(bus.status_message.latest().is_some());
    }
}
