//! RGB24 to NV12 colour conversion
//!
//! Output layout: a full-resolution luma plane (`width * height` bytes)
//! followed by one interleaved U/V plane with a sample pair for every 2x2
//! block, rounded up at odd edges. Both backends use the same BT.601
//! limited-range integer math and produce byte-identical output.

pub mod cpu;
pub mod gpu;

pub use cpu::CpuConverter;
pub use gpu::WgpuConverter;

use bytes::Bytes;

use crate::{ConversionError, ConvertBackend, ConvertConfig, InitializationError};

/// Fixed geometry of one NV12 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanarLayout {
    pub width: u32,
    pub height: u32,
}

impl PlanarLayout {
    pub fn new(width: u32, height: u32) -> Result<Self, InitializationError> {
        if width == 0 || height == 0 {
            return Err(InitializationError::InvalidDimensions { width, height });
        }
        Ok(Self { width, height })
    }

    /// Chroma samples per row
    pub fn uv_width(&self) -> u32 {
        self.width.div_ceil(2)
    }

    /// Chroma rows
    pub fn uv_height(&self) -> u32 {
        self.height.div_ceil(2)
    }

    pub fn rgb_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn y_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn uv_len(&self) -> usize {
        self.uv_width() as usize * self.uv_height() as usize * 2
    }

    /// Total NV12 size; `1.5 * width * height` when both are even
    pub fn nv12_len(&self) -> usize {
        self.y_len() + self.uv_len()
    }

    pub fn check_input(&self, rgb: &[u8]) -> Result<(), ConversionError> {
        if rgb.len() != self.rgb_len() {
            return Err(ConversionError::InputSize {
                expected: self.rgb_len(),
                actual: rgb.len(),
            });
        }
        Ok(())
    }
}

/// One converted frame. Cloning shares the payload.
#[derive(Debug, Clone)]
pub struct ConvertedBuffer {
    pub data: Bytes,
    pub layout: PlanarLayout,
}

impl ConvertedBuffer {
    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.layout.y_len()]
    }

    pub fn uv_plane(&self) -> &[u8] {
        &self.data[self.layout.y_len()..]
    }
}

pub trait ColorConvert: Send {
    fn layout(&self) -> PlanarLayout;

    /// Convert one RGB24 frame, blocking until the result is in host memory.
    fn convert(&mut self, rgb: &[u8]) -> Result<ConvertedBuffer, ConversionError>;
}

impl<T: ColorConvert + ?Sized> ColorConvert for Box<T> {
    fn layout(&self) -> PlanarLayout {
        (**self).layout()
    }

    fn convert(&mut self, rgb: &[u8]) -> Result<ConvertedBuffer, ConversionError> {
        (**self).convert(rgb)
    }
}

/// Build the configured backend. A GPU that cannot be brought up is fatal;
/// there is no silent fallback to the CPU path.
pub fn open(
    config: &ConvertConfig,
    width: u32,
    height: u32,
) -> Result<Box<dyn ColorConvert>, InitializationError> {
    let layout = PlanarLayout::new(width, height)?;
    match config.backend {
        ConvertBackend::Gpu => Ok(Box::new(WgpuConverter::new(
            layout,
            config.gpu_backend.into(),
        )?)),
        ConvertBackend::Cpu => Ok(Box::new(CpuConverter::new(layout))),
    }
}

// BT.601 limited range, shared by both backends

#[inline]
pub(crate) fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
pub(crate) fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}
