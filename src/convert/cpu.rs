use bytes::Bytes;

use super::{chroma, luma, ColorConvert, ConvertedBuffer, PlanarLayout};
use crate::ConversionError;

/// Scalar NV12 conversion. Reference for the GPU kernel and fallback for
/// hosts configured without one.
pub struct CpuConverter {
    layout: PlanarLayout,
}

impl CpuConverter {
    pub fn new(layout: PlanarLayout) -> Self {
        Self { layout }
    }
}

impl ColorConvert for CpuConverter {
    fn layout(&self) -> PlanarLayout {
        self.layout
    }

    fn convert(&mut self, rgb: &[u8]) -> Result<ConvertedBuffer, ConversionError> {
        self.layout.check_input(rgb)?;
        Ok(ConvertedBuffer {
            data: Bytes::from(rgb_to_nv12(rgb, self.layout)),
            layout: self.layout,
        })
    }
}

/// Convert a full RGB24 frame. `rgb` must be exactly `layout.rgb_len()` bytes.
pub fn rgb_to_nv12(rgb: &[u8], layout: PlanarLayout) -> Vec<u8> {
    let (w, h) = (layout.width as usize, layout.height as usize);
    let mut out = vec![0u8; layout.nv12_len()];
    let (y_plane, uv_plane) = out.split_at_mut(layout.y_len());

    let pixel = |x: usize, y: usize| {
        let i = (y * w + x) * 3;
        (rgb[i] as i32, rgb[i + 1] as i32, rgb[i + 2] as i32)
    };

    for y in 0..h {
        for x in 0..w {
            let (r, g, b) = pixel(x, y);
            y_plane[y * w + x] = luma(r, g, b);
        }
    }

    let uv_w = layout.uv_width() as usize;
    for by in 0..layout.uv_height() as usize {
        for bx in 0..uv_w {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for y in (by * 2)..(by * 2 + 2).min(h) {
                for x in (bx * 2)..(bx * 2 + 2).min(w) {
                    let (pr, pg, pb) = pixel(x, y);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            // Rounded mean over the pixels that exist
            let (u, v) = chroma((r + n / 2) / n, (g + n / 2) / n, (b + n / 2) / n);
            let i = (by * uv_w + bx) * 2;
            uv_plane[i] = u;
            uv_plane[i + 1] = v;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(layout: PlanarLayout, rgb: [u8; 3]) -> Vec<u8> {
        rgb.repeat(layout.width as usize * layout.height as usize)
    }

    #[test]
    fn solid_colour_is_uniform_per_plane() {
        let layout = PlanarLayout::new(4, 4).unwrap();
        let mut converter = CpuConverter::new(layout);
        let out = converter.convert(&solid(layout, [0, 0, 255])).unwrap();

        assert_eq!(out.data.len(), 24);
        assert!(out.y_plane().iter().all(|&y| y == luma(0, 0, 255)));
        assert_eq!(out.uv_plane(), [240, 110].repeat(4).as_slice());
    }

    #[test]
    fn chroma_averages_its_block() {
        // Left column black, right column white: one block, mean is mid grey
        let layout = PlanarLayout::new(2, 2).unwrap();
        let rgb = [0, 0, 0, 255, 255, 255, 0, 0, 0, 255, 255, 255];
        let out = rgb_to_nv12(&rgb, layout);
        assert_eq!(&out[..4], &[16, 235, 16, 235]);
        assert_eq!(&out[4..], &[128, 128]);
    }

    #[test]
    fn odd_edges_average_only_real_pixels() {
        let layout = PlanarLayout::new(3, 3).unwrap();
        let mut rgb = solid(layout, [0, 0, 0]);
        // Bottom-right pixel is alone in its block
        rgb[24..27].copy_from_slice(&[255, 0, 0]);
        let out = rgb_to_nv12(&rgb, layout);

        assert_eq!(out.len(), layout.nv12_len());
        let uv = &out[layout.y_len()..];
        assert_eq!(&uv[6..8], &[90, 240]);
        assert_eq!(&uv[0..2], &[128, 128]);
    }

    #[test]
    fn repeated_calls_are_byte_identical() {
        let layout = PlanarLayout::new(7, 5).unwrap();
        let rgb: Vec<u8> = (0..layout.rgb_len()).map(|i| (i * 31 % 251) as u8).collect();
        let mut converter = CpuConverter::new(layout);
        let a = converter.convert(&rgb).unwrap();
        let b = converter.convert(&rgb).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn wrong_input_size_is_rejected() {
        let layout = PlanarLayout::new(4, 2).unwrap();
        let err = CpuConverter::new(layout).convert(&[0; 10]).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::InputSize {
                expected: 24,
                actual: 10
            }
        ));
    }
}
