//! Device payload to RGB24 decoding

use zune_jpeg::JpegDecoder;

use super::frame::PixelFormat;
use crate::convert::PlanarLayout;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("jpeg: {0}")]
    Jpeg(String),
    #[error("payload is {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },
}

pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, DecodeError> {
    let rgb_len = PlanarLayout { width, height }.rgb_len();
    let rgb = match format {
        PixelFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(data);
            decoder
                .decode()
                .map_err(|e| DecodeError::Jpeg(format!("{e:?}")))?
        }
        PixelFormat::Rgb24 => data.to_vec(),
        PixelFormat::Yuyv => yuyv_to_rgb(data, width, height)?,
    };

    if rgb.len() != rgb_len {
        return Err(DecodeError::Truncated {
            expected: rgb_len,
            actual: rgb.len(),
        });
    }
    Ok(rgb)
}

/// YUYV 4:2:2 to RGB24, BT.601 limited range
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
    // Each macropixel covers two horizontal pixels, odd widths are padded
    let macropixels_per_row = (width as usize).div_ceil(2);
    let expected = macropixels_per_row * 4 * height as usize;
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }

    let mut rgb = Vec::with_capacity(PlanarLayout { width, height }.rgb_len());
    for row in data[..expected].chunks_exact(macropixels_per_row * 4) {
        let mut written = 0;
        for mp in row.chunks_exact(4) {
            let (y0, u, y1, v) = (mp[0], mp[1], mp[2], mp[3]);
            for y in [y0, y1] {
                if written == width as usize {
                    break;
                }
                rgb.extend_from_slice(&ycbcr_to_rgb(y, u, v));
                written += 1;
            }
        }
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_grey_decodes_to_grey() {
        // Y=126 U=V=128 is mid grey
        let data = [126u8, 128, 126, 128].repeat(2);
        let rgb = decode_frame(&data, PixelFormat::Yuyv, 2, 2).unwrap();
        assert_eq!(rgb.len(), 12);
        assert!(rgb.iter().all(|&c| c == rgb[0]));
        assert!((120..=135).contains(&rgb[0]));
    }

    #[test]
    fn yuyv_odd_width_drops_padding_pixel() {
        // 3 wide needs two macropixels per row
        let data = [16, 128, 16, 128, 235, 128, 235, 128];
        let rgb = decode_frame(&data, PixelFormat::Yuyv, 3, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn huge_dimensions_do_not_wrap() {
        // 65536 * 65536 wraps to zero in u32
        let err = decode_frame(&[0; 6], PixelFormat::Rgb24, 65536, 65536).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated { expected, actual: 6 } if expected == 65536 * 65536 * 3
        ));

        let err = decode_frame(&[0; 8], PixelFormat::Yuyv, 65536, 65536).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { actual: 8, .. }));
    }

    #[test]
    fn short_payload_is_rejected() {
        let err = decode_frame(&[0; 5], PixelFormat::Rgb24, 2, 1).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { expected: 6, actual: 5 }));
    }
}
