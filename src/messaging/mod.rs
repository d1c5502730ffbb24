//! Per-frame metadata records and the publish/subscribe bus that carries them

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::PublishError;

/// Row-major 3x3 identity. No geometric correction is applied upstream.
pub const IDENTITY_TRANSFORM: [f32; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Metadata for one frame on one logical stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadataRecord {
    pub frame_id: u64,
    /// Same end-of-frame time that was pushed with the buffer
    pub timestamp_eof_ns: u64,
    pub transform: [f32; 9],
}

impl FrameMetadataRecord {
    pub fn new(frame_id: u64, timestamp_eof_ns: u64) -> Self {
        Self {
            frame_id,
            timestamp_eof_ns,
            transform: IDENTITY_TRANSFORM,
        }
    }
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    /// Bus-monotonic time at publish
    pub log_mono_time_ns: u64,
    pub record: FrameMetadataRecord,
}

/// Producer side of a metadata bus. Delivery order to any one subscriber
/// matches publish order.
pub trait MetadataPublisher: Send + Sync {
    fn publish(&self, topic: &str, record: &FrameMetadataRecord) -> Result<(), PublishError>;
}

impl<T: MetadataPublisher + ?Sized> MetadataPublisher for Arc<T> {
    fn publish(&self, topic: &str, record: &FrameMetadataRecord) -> Result<(), PublishError> {
        (**self).publish(topic, record)
    }
}

struct Inner {
    topics: Mutex<HashMap<String, Vec<Sender<Envelope>>>>,
    capacity: usize,
    epoch: Instant,
    dropped: AtomicU64,
}

/// In-process topic bus over bounded channels. A subscriber that falls
/// `capacity` messages behind loses new messages instead of stalling the
/// publisher; subscribers that went away are pruned on the next publish.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    /// Declare the topics this bus serves
    pub fn new<I, S>(topics: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = topics
            .into_iter()
            .map(|t| (t.into(), Vec::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(topics),
                capacity: capacity.max(1),
                epoch: Instant::now(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, topic: &str) -> Result<Subscriber, PublishError> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let senders = topics
            .get_mut(topic)
            .ok_or_else(|| PublishError::UnknownTopic(topic.to_string()))?;
        let (tx, rx) = flume::bounded(self.inner.capacity);
        senders.push(tx);
        Ok(Subscriber { rx })
    }

    /// Messages dropped for slow subscribers since the bus was created
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl MetadataPublisher for MessageBus {
    fn publish(&self, topic: &str, record: &FrameMetadataRecord) -> Result<(), PublishError> {
        let envelope = Envelope {
            topic: topic.to_string(),
            log_mono_time_ns: self.inner.epoch.elapsed().as_nanos() as u64,
            record: record.clone(),
        };

        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let senders = topics
            .get_mut(topic)
            .ok_or_else(|| PublishError::UnknownTopic(topic.to_string()))?;

        senders.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camerad_bus_dropped_total", "topic" => topic.to_string())
                    .increment(1);
                warn!("Subscriber on {} is full, dropping frame {}", topic, record.frame_id);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Pruning closed subscriber on {}", topic);
                false
            }
        });
        Ok(())
    }
}

/// Receive side of one topic subscription
pub struct Subscriber {
    rx: Receiver<Envelope>,
}

impl Subscriber {
    /// Next message if one is queued
    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Block for the next message; `None` once the bus is gone
    pub fn recv(&self) -> Option<Envelope> {
        self.rx.recv().ok()
    }

    /// Everything queued right now, in publish order
    pub fn drain(&self) -> Vec<Envelope> {
        self.rx.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_publish_order_to_each_subscriber() {
        let bus = MessageBus::new(["roadCameraState"], 16);
        let a = bus.subscribe("roadCameraState").unwrap();
        let b = bus.subscribe("roadCameraState").unwrap();

        for id in 0..5 {
            bus.publish("roadCameraState", &FrameMetadataRecord::new(id, id * 10))
                .unwrap();
        }

        for sub in [a, b] {
            let ids: Vec<u64> = sub.drain().iter().map(|e| e.record.frame_id).collect();
            assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn undeclared_topic_is_rejected() {
        let bus = MessageBus::new(["roadCameraState"], 4);
        let record = FrameMetadataRecord::new(0, 0);
        assert!(matches!(
            bus.publish("driverCameraState", &record),
            Err(PublishError::UnknownTopic(_))
        ));
        assert!(bus.subscribe("driverCameraState").is_err());
    }

    #[test]
    fn slow_subscriber_drops_newest_without_blocking() {
        let bus = MessageBus::new(["t"], 2);
        let sub = bus.subscribe("t").unwrap();
        for id in 0..4 {
            bus.publish("t", &FrameMetadataRecord::new(id, 0)).unwrap();
        }
        let ids: Vec<u64> = sub.drain().iter().map(|e| e.record.frame_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(bus.dropped(), 2);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = MessageBus::new(["t"], 2);
        drop(bus.subscribe("t").unwrap());
        bus.publish("t", &FrameMetadataRecord::new(0, 0)).unwrap();
        bus.publish("t", &FrameMetadataRecord::new(1, 0)).unwrap();
        assert_eq!(bus.dropped(), 0);
    }

    #[test]
    fn records_carry_identity_transform() {
        let record = FrameMetadataRecord::new(3, 99);
        assert_eq!(record.transform, IDENTITY_TRANSFORM);
        assert_eq!(record.transform[0] + record.transform[4] + record.transform[8], 3.0);
    }
}
