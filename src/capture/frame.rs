use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One interleaved RGB capture, alive for a single pipeline iteration
pub struct Frame {
    /// Row-major RGB24, `width * height * 3` bytes
    pub data: Bytes,

    /// Source-side metadata
    pub meta: FrameMetadata,

    /// When the source handed the frame over
    pub timestamp: Instant,
}

/// Frame metadata as reported by the source. The pipeline assigns its own
/// frame ids; `sequence` is diagnostic only.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Wire format the device delivered before decoding to RGB
    pub source_format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl Frame {
    /// Wrap already-decoded RGB24 pixels.
    pub fn rgb(data: impl Into<Bytes>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data: data.into(),
            meta: FrameMetadata {
                sequence,
                width,
                height,
                stride: width.saturating_mul(3),
                source_format: PixelFormat::Rgb24,
                device_timestamp: None,
            },
            timestamp: Instant::now(),
        }
    }
}

/// Pixel formats we understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
        }
    }
}
