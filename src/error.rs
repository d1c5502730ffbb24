//! Error taxonomy for the capture pipeline.
//!
//! Only two classes are fatal by design: setup failures and conversion
//! failures. A capture source reporting "no frame" never becomes an error.

use thiserror::Error;

/// Device, compute context, kernel or configuration setup failed.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error("failed to create GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    #[error("conversion kernel failed to build: {0}")]
    Kernel(String),

    #[error("failed to allocate device memory: {0}")]
    Allocation(String),

    #[error("failed to open capture device {device}: {reason}")]
    CaptureOpen { device: String, reason: String },

    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("converter is sized for {actual:?}, pipeline expects {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("target rate {0} Hz does not give a usable tick interval")]
    InvalidRate(f64),

    #[error("no logical streams configured")]
    NoStreams,

    #[error("duplicate {kind} {name:?}")]
    DuplicateStream { kind: &'static str, name: String },

    #[error("failed to register stream: {0}")]
    Registration(#[from] DistributionError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// GPU dispatch or synchronization failed mid-run.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("input is {actual} bytes, expected {expected}")]
    InputSize { expected: usize, actual: usize },

    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),

    #[error("device readback failed: {0}")]
    Readback(String),
}

/// Frame distributor rejected a registration or a publish.
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("stream {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("stream {0:?} is not registered")]
    UnknownStream(String),

    #[error("stream {key:?} expects {expected} byte frames, got {actual}")]
    SizeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("stream {0:?} needs at least one buffer")]
    NoBuffers(String),
}

/// Metadata bus rejected a publish.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("topic {0:?} was not declared on this bus")]
    UnknownTopic(String),
}

/// Anything that ends a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}
