//! Synthetic frame source for running without a camera

use tracing::info;

use super::{Frame, FrameSource};
use crate::convert::PlanarLayout;
use crate::InitializationError;

/// Moving RGB gradient. Every frame is a pure function of its sequence number.
pub struct TestPattern {
    width: u32,
    height: u32,
    drop_every: Option<u64>,
    reads: u64,
    sequence: u64,
}

impl TestPattern {
    pub fn new(
        width: u32,
        height: u32,
        drop_every: Option<u64>,
    ) -> Result<Self, InitializationError> {
        if width == 0 || height == 0 {
            return Err(InitializationError::InvalidDimensions { width, height });
        }
        info!("Test pattern source {}x{}", width, height);
        Ok(Self {
            width,
            height,
            drop_every: drop_every.filter(|&n| n > 0),
            reads: 0,
            sequence: 0,
        })
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let layout = PlanarLayout {
            width: self.width,
            height: self.height,
        };
        let shift = sequence % 256;
        let (w, h) = (self.width as u64, self.height as u64);
        let mut data = Vec::with_capacity(layout.rgb_len());
        for y in 0..h {
            for x in 0..w {
                data.push((x * 255 / w + shift) as u8);
                data.push((y * 255 / h + shift) as u8);
                data.push(((x ^ y) + shift) as u8);
            }
        }
        data
    }
}

impl FrameSource for TestPattern {
    fn read(&mut self) -> Option<Frame> {
        self.reads += 1;
        if matches!(self.drop_every, Some(n) if self.reads % n == 0) {
            return None;
        }

        let sequence = self.sequence;
        self.sequence += 1;
        Some(Frame::rgb(
            self.render(sequence),
            self.width,
            self.height,
            sequence,
        ))
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_every_nth_read() {
        let mut source = TestPattern::new(4, 2, Some(3)).unwrap();
        let hits: Vec<bool> = (0..6).map(|_| source.read().is_some()).collect();
        assert_eq!(hits, [true, true, false, true, true, false]);
    }

    #[test]
    fn frames_have_rgb_size_and_consecutive_sequences() {
        let mut source = TestPattern::new(5, 3, None).unwrap();
        let a = source.read().unwrap();
        let b = source.read().unwrap();
        assert_eq!(a.data.len(), 5 * 3 * 3);
        assert_eq!(a.meta.sequence + 1, b.meta.sequence);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn rejects_empty_frames() {
        assert!(TestPattern::new(0, 10, None).is_err());
    }
}
