//! V4L2 capture from mmap'd driver buffers

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Type as ControlType, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder::decode_frame;
use super::{Frame, FrameMetadata, FrameSource, PixelFormat};
use crate::{utils, CaptureConfig, InitializationError};

/// Physical camera on a V4L2 node
pub struct V4l2Capture {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    config: CaptureConfig,
    sequence: u64,
}

impl V4l2Capture {
    /// Open the device and negotiate format, frame rate and controls
    pub fn open(mut config: CaptureConfig) -> Result<Self, InitializationError> {
        if config.device.is_empty() {
            let found = utils::auto_detect_device()?;
            config.device = found.path;
            config.format = found.format;
        }
        info!("Initializing V4L2 capture: {}", config.device);

        let device = Device::with_path(&config.device).map_err(|e| open_error(&config, e))?;

        let caps = device.query_caps().map_err(|e| open_error(&config, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(InitializationError::CaptureOpen {
                device: config.device,
                reason: "device doesn't support video capture".into(),
            });
        }

        let fourcc = match config.format {
            PixelFormat::Mjpeg | PixelFormat::Yuyv => FourCC::new(&config.format.fourcc()),
            other => {
                return Err(InitializationError::CaptureOpen {
                    device: config.device,
                    reason: format!("unsupported capture format {:?}", other),
                })
            }
        };

        let mut fmt = device.format().map_err(|e| open_error(&config, e))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc;
        let actual = device.set_format(&fmt).map_err(|e| open_error(&config, e))?;
        if actual.width != config.width || actual.height != config.height || actual.fourcc != fourcc
        {
            return Err(InitializationError::CaptureOpen {
                device: config.device,
                reason: format!(
                    "driver negotiated {}x{} {}, wanted {}x{} {}",
                    actual.width, actual.height, actual.fourcc, config.width, config.height, fourcc
                ),
            });
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Could not set {} fps: {}", config.fps, e);
        }

        let capture = Self {
            device: Box::new(device),
            stream: None,
            config,
            sequence: 0,
        };
        capture.apply_controls()?;
        Ok(capture)
    }

    /// Apply `config.controls` by v4l2-ctl name. Unknown names are logged and skipped.
    fn apply_controls(&self) -> Result<(), InitializationError> {
        if self.config.controls.is_empty() {
            return Ok(());
        }

        let descriptions = self
            .device
            .query_controls()
            .map_err(|e| open_error(&self.config, e))?;

        for (name, &value) in &self.config.controls {
            let Some(desc) = descriptions
                .iter()
                .find(|d| utils::control_key(&d.name) == *name)
            else {
                warn!("Device has no control named {:?}", name);
                continue;
            };

            let value = match desc.typ {
                ControlType::Boolean => Value::Boolean(value != 0),
                _ => Value::Integer(value),
            };
            let control = Control {
                id: desc.id,
                value: value.clone(),
            };
            match self.device.set_control(control) {
                Ok(()) => info!("Set control {} = {:?}", name, value),
                Err(e) => warn!("Failed to set control {}: {}", name, e),
            }
        }
        Ok(())
    }

    /// Start streaming with memory-mapped buffers
    pub fn start_stream(&mut self) -> Result<(), InitializationError> {
        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)
                .map_err(|e| open_error(&self.config, e))?;

        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }
}

impl FrameSource for V4l2Capture {
    #[instrument(skip(self), level = "trace")]
    fn read(&mut self) -> Option<Frame> {
        let stream = self.stream.as_mut()?;

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                warn!("Dequeue failed: {}", e);
                return None;
            }
        };
        let timestamp = Instant::now();

        let used = (meta.bytesused as usize).min(buf.len());
        let rgb = match decode_frame(
            &buf[..used],
            self.config.format,
            self.config.width,
            self.config.height,
        ) {
            Ok(rgb) => rgb,
            Err(e) => {
                debug!("Dropping undecodable frame: {}", e);
                return None;
            }
        };

        let device_timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        self.sequence += 1;
        Some(Frame {
            data: Bytes::from(rgb),
            meta: FrameMetadata {
                sequence: self.sequence,
                width: self.config.width,
                height: self.config.height,
                stride: self.config.width.saturating_mul(3),
                source_format: self.config.format,
                device_timestamp: Some(device_timestamp),
            },
            timestamp,
        })
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}

fn open_error(config: &CaptureConfig, e: std::io::Error) -> InitializationError {
    InitializationError::CaptureOpen {
        device: config.device.clone(),
        reason: e.to_string(),
    }
}
