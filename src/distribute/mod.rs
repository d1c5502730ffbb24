//! Multi-stream frame distribution
//!
//! The pipeline pushes each converted buffer once per logical stream. A
//! distributor makes it visible to any number of readers without copying it
//! per reader.

pub mod ringbuf;

pub use self::ringbuf::{FrameReader, RingDistributor, StreamStats};

use std::sync::Arc;

use bytes::Bytes;

use crate::DistributionError;

/// A converted frame as readers see it
#[derive(Debug, Clone)]
pub struct DistributedFrame {
    pub frame_id: u64,
    pub timestamp_sof_ns: u64,
    pub timestamp_eof_ns: u64,
    pub width: u32,
    pub height: u32,
    /// NV12 payload, shared by every stream and reader of this frame
    pub data: Bytes,
}

/// Producer side of a frame distribution service. Implementations are
/// internally synchronized; one producer thread may call `publish` repeatedly.
pub trait FrameDistributor: Send + Sync {
    /// Create the buffer pool for one stream. Called once per stream at startup.
    fn register_stream(
        &self,
        stream_key: &str,
        buffer_count: usize,
        width: u32,
        height: u32,
    ) -> Result<(), DistributionError>;

    /// Make one frame visible on a stream
    fn publish(
        &self,
        stream_key: &str,
        planar: Bytes,
        frame_id: u64,
        timestamp_sof_ns: u64,
        timestamp_eof_ns: u64,
    ) -> Result<(), DistributionError>;
}

impl<T: FrameDistributor + ?Sized> FrameDistributor for Arc<T> {
    fn register_stream(
        &self,
        stream_key: &str,
        buffer_count: usize,
        width: u32,
        height: u32,
    ) -> Result<(), DistributionError> {
        (**self).register_stream(stream_key, buffer_count, width, height)
    }

    fn publish(
        &self,
        stream_key: &str,
        planar: Bytes,
        frame_id: u64,
        timestamp_sof_ns: u64,
        timestamp_eof_ns: u64,
    ) -> Result<(), DistributionError> {
        (**self).publish(stream_key, planar, frame_id, timestamp_sof_ns, timestamp_eof_ns)
    }
}
