//! In-process ring distributor
//!
//! Each stream owns a fixed number of slots. Publishing past capacity evicts
//! the oldest frame; readers hold `Arc`s, so an evicted frame stays alive for
//! whoever is still looking at it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{debug, info};

use super::{DistributedFrame, FrameDistributor};
use crate::convert::PlanarLayout;
use crate::DistributionError;

struct StreamRing {
    key: String,
    width: u32,
    height: u32,
    frame_len: usize,
    slots: Mutex<HeapRb<Arc<DistributedFrame>>>,
    latest: ArcSwapOption<DistributedFrame>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_evicted: AtomicU64,
    readers: AtomicUsize,
}

/// Counters for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_written: u64,
    pub frames_evicted: u64,
    pub readers: usize,
    pub buffered: usize,
}

/// Cheaply cloneable handle; clones share the same streams
#[derive(Clone, Default)]
pub struct RingDistributor {
    streams: Arc<RwLock<HashMap<String, Arc<StreamRing>>>>,
}

impl RingDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    fn ring(&self, stream_key: &str) -> Result<Arc<StreamRing>, DistributionError> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_key)
            .cloned()
            .ok_or_else(|| DistributionError::UnknownStream(stream_key.to_string()))
    }

    /// Attach a reader to a registered stream
    pub fn subscribe(&self, stream_key: &str) -> Result<FrameReader, DistributionError> {
        let ring = self.ring(stream_key)?;
        ring.stats.readers.fetch_add(1, Ordering::Relaxed);
        Ok(FrameReader {
            ring,
            last_frame_id: None,
        })
    }

    pub fn stats(&self, stream_key: &str) -> Result<StreamStats, DistributionError> {
        let ring = self.ring(stream_key)?;
        let buffered = ring
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .occupied_len();
        Ok(StreamStats {
            frames_written: ring.stats.frames_written.load(Ordering::Relaxed),
            frames_evicted: ring.stats.frames_evicted.load(Ordering::Relaxed),
            readers: ring.stats.readers.load(Ordering::Relaxed),
            buffered,
        })
    }

    /// Registered stream keys, sorted
    pub fn streams(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl FrameDistributor for RingDistributor {
    fn register_stream(
        &self,
        stream_key: &str,
        buffer_count: usize,
        width: u32,
        height: u32,
    ) -> Result<(), DistributionError> {
        if buffer_count == 0 {
            return Err(DistributionError::NoBuffers(stream_key.to_string()));
        }

        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(stream_key) {
            return Err(DistributionError::AlreadyRegistered(stream_key.to_string()));
        }

        let frame_len = PlanarLayout { width, height }.nv12_len();
        streams.insert(
            stream_key.to_string(),
            Arc::new(StreamRing {
                key: stream_key.to_string(),
                width,
                height,
                frame_len,
                slots: Mutex::new(HeapRb::new(buffer_count)),
                latest: ArcSwapOption::empty(),
                stats: CachePadded::new(Stats::default()),
            }),
        );
        info!(
            "Registered stream {:?}: {} buffers of {}x{} ({} bytes)",
            stream_key, buffer_count, width, height, frame_len
        );
        Ok(())
    }

    fn publish(
        &self,
        stream_key: &str,
        planar: Bytes,
        frame_id: u64,
        timestamp_sof_ns: u64,
        timestamp_eof_ns: u64,
    ) -> Result<(), DistributionError> {
        let ring = self.ring(stream_key)?;
        if planar.len() != ring.frame_len {
            return Err(DistributionError::SizeMismatch {
                key: ring.key.clone(),
                expected: ring.frame_len,
                actual: planar.len(),
            });
        }

        let frame = Arc::new(DistributedFrame {
            frame_id,
            timestamp_sof_ns,
            timestamp_eof_ns,
            width: ring.width,
            height: ring.height,
            data: planar,
        });

        let evicted = ring
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_overwrite(frame.clone());
        ring.latest.store(Some(frame));

        ring.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = evicted {
            ring.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("camerad_distributor_evicted_total", "stream" => ring.key.clone())
                .increment(1);
            debug!("Stream {:?} evicted frame {}", ring.key, old.frame_id);
        }
        Ok(())
    }
}

/// Read side of one stream. Never copies frame payloads.
pub struct FrameReader {
    ring: Arc<StreamRing>,
    last_frame_id: Option<u64>,
}

impl FrameReader {
    pub fn stream_key(&self) -> &str {
        &self.ring.key
    }

    /// Most recently published frame
    pub fn latest(&self) -> Option<Arc<DistributedFrame>> {
        self.ring.latest.load_full()
    }

    /// Buffered frames newer than anything this reader has returned, oldest
    /// first. Frames evicted before the reader got to them are skipped.
    pub fn poll(&mut self) -> Vec<Arc<DistributedFrame>> {
        let fresh: Vec<Arc<DistributedFrame>> = {
            let slots = self
                .ring
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .filter(|f| self.last_frame_id.map_or(true, |last| f.frame_id > last))
                .cloned()
                .collect()
        };
        if let Some(newest) = fresh.last() {
            self.last_frame_id = Some(newest.frame_id);
        }
        fresh
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.ring.stats.readers.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn readers_share_the_published_payload() {
        let dist = RingDistributor::new();
        dist.register_stream("road", 3, 4, 2).unwrap();
        let mut a = dist.subscribe("road").unwrap();
        let mut b = dist.subscribe("road").unwrap();

        let payload = frame(12, 7);
        dist.publish("road", payload.clone(), 0, 10, 10).unwrap();

        let fa = a.poll();
        let fb = b.poll();
        assert_eq!(fa.len(), 1);
        assert!(Arc::ptr_eq(&fa[0], &fb[0]));
        assert_eq!(fa[0].data.as_ptr(), payload.as_ptr());
        assert_eq!(dist.stats("road").unwrap().readers, 2);
    }

    #[test]
    fn overflow_evicts_oldest_and_poll_skips_ahead() {
        let dist = RingDistributor::new();
        dist.register_stream("road", 2, 2, 2).unwrap();
        let mut reader = dist.subscribe("road").unwrap();

        for id in 0..5 {
            dist.publish("road", frame(6, id as u8), id, id, id).unwrap();
        }

        let ids: Vec<u64> = reader.poll().iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(reader.poll().is_empty());
        assert_eq!(reader.latest().unwrap().frame_id, 4);

        let stats = dist.stats("road").unwrap();
        assert_eq!(stats.frames_written, 5);
        assert_eq!(stats.frames_evicted, 3);
        assert_eq!(stats.buffered, 2);
    }

    #[test]
    fn rejects_bad_registration_and_publish() {
        let dist = RingDistributor::new();
        dist.register_stream("road", 1, 2, 2).unwrap();

        assert!(matches!(
            dist.register_stream("road", 1, 2, 2),
            Err(DistributionError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            dist.register_stream("wide_road", 0, 2, 2),
            Err(DistributionError::NoBuffers(_))
        ));
        assert!(matches!(
            dist.publish("driver", frame(6, 0), 0, 0, 0),
            Err(DistributionError::UnknownStream(_))
        ));
        assert!(matches!(
            dist.publish("road", frame(5, 0), 0, 0, 0),
            Err(DistributionError::SizeMismatch {
                expected: 6,
                actual: 5,
                ..
            })
        ));
    }

    #[test]
    fn dropping_a_reader_is_counted() {
        let dist = RingDistributor::new();
        dist.register_stream("road", 1, 2, 2).unwrap();
        let reader = dist.subscribe("road").unwrap();
        assert_eq!(dist.stats("road").unwrap().readers, 1);
        drop(reader);
        assert_eq!(dist.stats("road").unwrap().readers, 0);
    }
}
