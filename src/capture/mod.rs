//! Frame sources
//!
//! A source hands the pipeline one decoded RGB24 frame per successful read.
//! `None` from [`FrameSource::read`] means "no frame right now" and is never
//! an error: the pipeline skips the iteration and tries again next tick.

pub mod decoder;
pub mod frame;
pub mod pattern;
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use pattern::TestPattern;
pub use v4l2::V4l2Capture;

use crate::{CaptureConfig, InitializationError, SourceKind};

pub trait FrameSource: Send {
    /// Block until the device yields a frame, or report that none is available.
    fn read(&mut self) -> Option<Frame>;

    /// Output dimensions as (width, height)
    fn dimensions(&self) -> (u32, u32);
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read(&mut self) -> Option<Frame> {
        (**self).read()
    }

    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }
}

/// Open the source named by the configuration
pub fn open(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, InitializationError> {
    match config.source {
        SourceKind::V4l2 => {
            let mut capture = V4l2Capture::open(config.clone())?;
            capture.start_stream()?;
            Ok(Box::new(capture))
        }
        SourceKind::TestPattern => Ok(Box::new(TestPattern::new(
            config.width,
            config.height,
            config.drop_every,
        )?)),
    }
}
