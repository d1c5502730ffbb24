use crate::capture::frame::PixelFormat;
use crate::InitializationError;
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

// Detected capture device info
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// Find the first capture node offering MJPEG or YUYV, preferring MJPEG
pub fn auto_detect_device() -> Result<FoundDevice, InitializationError> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        let fourccs: Vec<FourCC> = formats.iter().map(|f| f.fourcc).collect();
        for format in [PixelFormat::Mjpeg, PixelFormat::Yuyv] {
            if fourccs.contains(&FourCC::new(&format.fourcc())) {
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                return Ok(FoundDevice::new(path, format));
            }
        }
    }

    Err(InitializationError::CaptureOpen {
        device: "auto".into(),
        reason: "no suitable capture device found".into(),
    })
}

/// Normalise a driver control label the way `v4l2-ctl` prints it,
/// e.g. "Focus, Automatic Continuous" -> "focus_automatic_continuous"
pub fn control_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.is_empty() && !key.ends_with('_') {
            key.push('_');
        }
    }
    while key.ends_with('_') {
        key.pop();
    }
    key
}

#[cfg(test)]
mod tests {
    use super::control_key;

    #[test]
    fn control_names_match_v4l2_ctl() {
        assert_eq!(
            control_key("Focus, Automatic Continuous"),
            "focus_automatic_continuous"
        );
        assert_eq!(
            control_key("Backlight Compensation"),
            "backlight_compensation"
        );
        assert_eq!(control_key("Exposure Time, Absolute"), "exposure_time_absolute");
        assert_eq!(control_key("  Sharpness "), "sharpness");
    }
}
