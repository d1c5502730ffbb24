//! Capture pipeline orchestration
//!
//! One iteration per tick: read, convert, push the buffer to every logical
//! stream, publish every stream's metadata record, advance the frame id, wait.
//! Everything runs on the caller's thread; the only blocking points are the
//! source read, the conversion and the tick.

pub mod cancel;
pub mod ratekeeper;

pub use cancel::CancelToken;
pub use ratekeeper::{tick_interval, Ratekeeper, Tick};

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument};

use crate::capture::{self, Frame, FrameSource};
use crate::convert::{self, ColorConvert};
use crate::distribute::FrameDistributor;
use crate::messaging::{FrameMetadataRecord, MetadataPublisher};
use crate::{Config, InitializationError, PipelineError};

/// One named output identity fed from the shared source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalStream {
    pub stream_key: String,
    pub metadata_topic: String,
}

impl LogicalStream {
    pub fn new(stream_key: impl Into<String>, metadata_topic: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            metadata_topic: metadata_topic.into(),
        }
    }
}

/// Static pipeline configuration, fixed for the life of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub width: u32,
    pub height: u32,
    pub target_rate_hz: f64,
    /// Distributor slots per stream
    pub buffer_count: usize,
    /// Publish order within a frame follows this order
    pub streams: Vec<LogicalStream>,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), InitializationError> {
        if self.width == 0 || self.height == 0 {
            return Err(InitializationError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        tick_interval(self.target_rate_hz)?;
        if self.streams.is_empty() {
            return Err(InitializationError::NoStreams);
        }

        let mut keys = HashSet::new();
        let mut topics = HashSet::new();
        for stream in &self.streams {
            if !keys.insert(stream.stream_key.as_str()) {
                return Err(InitializationError::DuplicateStream {
                    kind: "stream key",
                    name: stream.stream_key.clone(),
                });
            }
            if !topics.insert(stream.metadata_topic.as_str()) {
                return Err(InitializationError::DuplicateStream {
                    kind: "metadata topic",
                    name: stream.metadata_topic.clone(),
                });
            }
        }
        Ok(())
    }
}

/// What one call to [`CapturePipeline::run_iteration`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// A frame went out on every stream under this id
    Published { frame_id: u64 },
    /// The source had nothing; nothing was published
    NoFrame,
    /// Cancelled before anything was published
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_published: u64,
    pub frames_skipped: u64,
    pub lagged_ticks: u64,
    pub last_frame_id: Option<u64>,
}

pub struct CapturePipeline<S, C, D, P, K = Ratekeeper> {
    settings: PipelineSettings,
    source: S,
    converter: C,
    distributor: D,
    publisher: P,
    ticker: K,
    frame_id: u64,
    start: Instant,
    stats: PipelineStats,
}

impl<D, P> CapturePipeline<Box<dyn FrameSource>, Box<dyn ColorConvert>, D, P, Ratekeeper>
where
    D: FrameDistributor,
    P: MetadataPublisher,
{
    /// Bring up the configured converter and source, then register streams.
    /// The compute context comes up before the camera is opened.
    pub fn from_config(
        config: &Config,
        distributor: D,
        publisher: P,
    ) -> Result<Self, InitializationError> {
        let settings = config.settings();
        settings.validate()?;

        let converter = convert::open(&config.convert, settings.width, settings.height)?;
        let source = capture::open(&config.capture)?;
        let ticker = Ratekeeper::new(
            settings.target_rate_hz,
            config
                .pipeline
                .delay_warn_threshold_ms
                .map(Duration::from_millis),
        )?;

        Self::initialize(settings, source, converter, distributor, publisher, ticker)
    }
}

impl<S, C, D, P, K> CapturePipeline<S, C, D, P, K>
where
    S: FrameSource,
    C: ColorConvert,
    D: FrameDistributor,
    P: MetadataPublisher,
    K: Tick,
{
    /// Check that every collaborator agrees on the frame size, register each
    /// stream's buffer pool and start counting from frame 0.
    pub fn initialize(
        settings: PipelineSettings,
        source: S,
        converter: C,
        distributor: D,
        publisher: P,
        ticker: K,
    ) -> Result<Self, InitializationError> {
        settings.validate()?;

        let expected = (settings.width, settings.height);
        let layout = converter.layout();
        if (layout.width, layout.height) != expected {
            return Err(InitializationError::DimensionMismatch {
                expected,
                actual: (layout.width, layout.height),
            });
        }
        if source.dimensions() != expected {
            return Err(InitializationError::DimensionMismatch {
                expected,
                actual: source.dimensions(),
            });
        }

        for stream in &settings.streams {
            distributor.register_stream(
                &stream.stream_key,
                settings.buffer_count,
                settings.width,
                settings.height,
            )?;
        }

        info!(
            "Pipeline ready: {}x{} @ {} Hz, streams [{}]",
            settings.width,
            settings.height,
            settings.target_rate_hz,
            settings
                .streams
                .iter()
                .map(|s| format!("{} -> {}", s.stream_key, s.metadata_topic))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            settings,
            source,
            converter,
            distributor,
            publisher,
            ticker,
            frame_id: 0,
            start: Instant::now(),
            stats: PipelineStats::default(),
        })
    }

    /// The id the next published frame will carry
    pub fn next_frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// One capture, convert, publish cycle followed by the tick wait
    #[instrument(skip_all, level = "trace", fields(frame_id = self.frame_id))]
    pub fn run_iteration(&mut self, cancel: &CancelToken) -> Result<Iteration, PipelineError> {
        if cancel.is_cancelled() {
            return Ok(Iteration::Cancelled);
        }

        let frame = self.source.read();
        if cancel.is_cancelled() {
            return Ok(Iteration::Cancelled);
        }

        let outcome = match frame {
            Some(frame) => Iteration::Published {
                frame_id: self.publish_frame(frame)?,
            },
            None => {
                self.stats.frames_skipped += 1;
                metrics::counter!("camerad_frames_skipped_total").increment(1);
                debug!("No frame available");
                Iteration::NoFrame
            }
        };

        if self.ticker.tick(cancel) {
            self.stats.lagged_ticks += 1;
        }
        Ok(outcome)
    }

    /// Convert one frame and push it to every stream, buffers first, then
    /// metadata. Returns the id it was published under.
    fn publish_frame(&mut self, frame: Frame) -> Result<u64, PipelineError> {
        let convert_start = Instant::now();
        let converted = self.converter.convert(&frame.data)?;
        metrics::histogram!("camerad_convert_time_us")
            .record(convert_start.elapsed().as_micros() as f64);

        // End-of-frame time is approximated by the end of conversion
        let capture_time_ns = self.start.elapsed().as_nanos() as u64;
        let frame_id = self.frame_id;

        for stream in &self.settings.streams {
            self.distributor.publish(
                &stream.stream_key,
                converted.data.clone(),
                frame_id,
                capture_time_ns,
                capture_time_ns,
            )?;
        }

        let record = FrameMetadataRecord::new(frame_id, capture_time_ns);
        for stream in &self.settings.streams {
            self.publisher.publish(&stream.metadata_topic, &record)?;
        }

        self.frame_id += 1;
        self.stats.frames_published += 1;
        self.stats.last_frame_id = Some(frame_id);
        metrics::counter!("camerad_frames_published_total").increment(1);
        debug!(
            frame_id,
            device_sequence = frame.meta.sequence,
            capture_time_ns,
            "Published frame"
        );
        Ok(frame_id)
    }

    /// Iterate until cancelled or a fatal error
    pub fn run_forever(&mut self, cancel: &CancelToken) -> Result<PipelineStats, PipelineError> {
        info!("Capture loop running");
        while !cancel.is_cancelled() {
            if let Err(e) = self.run_iteration(cancel) {
                error!("Capture loop stopped: {}", e);
                return Err(e);
            }
        }
        info!(
            "Capture loop cancelled after {} frames ({} skipped)",
            self.stats.frames_published, self.stats.frames_skipped
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(streams: Vec<LogicalStream>) -> PipelineSettings {
        PipelineSettings {
            width: 4,
            height: 4,
            target_rate_hz: 30.0,
            buffer_count: 5,
            streams,
        }
    }

    #[test]
    fn rejects_duplicate_keys_and_topics() {
        let dup_key = settings(vec![
            LogicalStream::new("road", "a"),
            LogicalStream::new("road", "b"),
        ]);
        assert!(matches!(
            dup_key.validate(),
            Err(InitializationError::DuplicateStream { kind: "stream key", .. })
        ));

        let dup_topic = settings(vec![
            LogicalStream::new("road", "a"),
            LogicalStream::new("wide_road", "a"),
        ]);
        assert!(matches!(
            dup_topic.validate(),
            Err(InitializationError::DuplicateStream {
                kind: "metadata topic",
                ..
            })
        ));
    }

    #[test]
    fn rejects_empty_streams_and_bad_rates() {
        assert!(matches!(
            settings(vec![]).validate(),
            Err(InitializationError::NoStreams)
        ));

        let mut s = settings(vec![LogicalStream::new("road", "a")]);
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e-20] {
            s.target_rate_hz = rate;
            assert!(matches!(s.validate(), Err(InitializationError::InvalidRate(_))));
        }
    }
}
