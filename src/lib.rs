pub mod capture;
pub mod convert;
pub mod distribute;
pub mod error;
pub mod messaging;
pub mod pipeline;
pub mod utils;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{
    ConversionError, DistributionError, InitializationError, PipelineError, PublishError,
};
pub use pipeline::{CancelToken, CapturePipeline, LogicalStream, PipelineSettings};

/// Environment prefix for overrides, e.g. `CAMERAD_PIPELINE__TARGET_RATE_HZ=20`
pub const ENV_PREFIX: &str = "CAMERAD";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub convert: ConvertConfig,
    pub pipeline: PipelineConfig,
    pub bus: BusConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    V4l2,
    TestPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Device node; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Device controls by their v4l2-ctl name. Entries from a config file
    /// are merged over the defaults.
    pub controls: BTreeMap<String, i64>,
    /// Test pattern only: report "no frame" on every Nth read
    pub drop_every: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertBackend {
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuBackend {
    Vulkan,
    Metal,
    Dx12,
    Gl,
    Auto,
}

impl From<GpuBackend> for wgpu::Backends {
    fn from(backend: GpuBackend) -> Self {
        match backend {
            GpuBackend::Vulkan => wgpu::Backends::VULKAN,
            GpuBackend::Metal => wgpu::Backends::METAL,
            GpuBackend::Dx12 => wgpu::Backends::DX12,
            GpuBackend::Gl => wgpu::Backends::GL,
            GpuBackend::Auto => wgpu::Backends::all(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    pub backend: ConvertBackend,
    pub gpu_backend: GpuBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub target_rate_hz: f64,
    /// Ratekeeper warns when an iteration overruns its slot by more than this
    pub delay_warn_threshold_ms: Option<u64>,
    /// Ring slots per logical stream in the distributor
    pub distributor_buffer_count: usize,
    /// Pin the pipeline thread to this core
    pub cpu_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Queue depth per subscriber before messages are dropped for it
    pub subscriber_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_key: String,
    pub metadata_topic: String,
}

/// Backlight compensation off, fixed focus, manual exposure
fn default_controls() -> BTreeMap<String, i64> {
    [
        ("backlight_compensation", 1),
        ("sharpness", 200),
        ("focus_automatic_continuous", 0),
        ("focus_absolute", 5),
        ("auto_exposure", 1),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: SourceKind::V4l2,
                device: "/dev/video0".into(),
                width: 1920,
                height: 1080,
                fps: 30,
                format: PixelFormat::Mjpeg,
                buffer_count: 4,
                controls: default_controls(),
                drop_every: None,
            },
            convert: ConvertConfig {
                backend: ConvertBackend::Gpu,
                gpu_backend: GpuBackend::Auto,
            },
            pipeline: PipelineConfig {
                target_rate_hz: 30.0,
                delay_warn_threshold_ms: None,
                distributor_buffer_count: 5,
                cpu_core: None,
            },
            bus: BusConfig {
                subscriber_capacity: 64,
            },
            streams: vec![
                StreamConfig {
                    stream_key: "road".into(),
                    metadata_topic: "roadCameraState".into(),
                },
                StreamConfig {
                    stream_key: "wide_road".into(),
                    metadata_topic: "wideRoadCameraState".into(),
                },
            ],
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `CAMERAD_*` environment
    /// overrides. The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self, InitializationError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InitializationError> {
        self.settings().validate()
    }

    /// The static pipeline settings this configuration describes
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            width: self.capture.width,
            height: self.capture.height,
            target_rate_hz: self.pipeline.target_rate_hz,
            buffer_count: self.pipeline.distributor_buffer_count,
            streams: self
                .streams
                .iter()
                .map(|s| LogicalStream::new(&s.stream_key, &s.metadata_topic))
                .collect(),
        }
    }

    /// Every metadata topic, in stream order
    pub fn topics(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.streams
            .iter()
            .filter(|s| seen.insert(s.metadata_topic.as_str()))
            .map(|s| s.metadata_topic.clone())
            .collect()
    }
}
