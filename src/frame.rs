//! Frames and source descriptors.
//!
//! - `Frame`: owned 2D pixel grid. Once captured it is never mutated; later
//!   stages produce new frames instead.
//! - `FrameDescriptor`: static format metadata reported by a capture source
//!   after `init`. It never changes for the lifetime of the source.
//!
//! All pixel data is interleaved, row-major, 8 bits per channel. Three-channel
//! frames are RGB.

use anyhow::{anyhow, Result};

/// Bits per channel supported by the processing stages.
pub const PIXEL_DEPTH_8U: u8 = 8;

/// Static format reported by a capture source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Bits per channel.
    pub pixel_depth: u8,
    /// Source delivers a raw color-filter-array mosaic that must be
    /// demosaiced to mono instead of being used as grayscale directly.
    pub needs_bayer: bool,
}

impl FrameDescriptor {
    /// Number of bytes a frame with this descriptor occupies.
    pub fn byte_len(&self) -> Result<usize> {
        frame_byte_len(self.width, self.height, self.channels, self.pixel_depth)
    }

    /// Returns true when `frame` has exactly the geometry this descriptor promises.
    pub fn matches(&self, frame: &Frame) -> bool {
        frame.width == self.width
            && frame.height == self.height
            && frame.channels == self.channels
            && frame.pixel_depth == self.pixel_depth
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "source reported empty frame size {}x{}",
                self.width,
                self.height
            ));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(anyhow!(
                "unsupported channel count {} (expected 1 or 3)",
                self.channels
            ));
        }
        if self.pixel_depth != PIXEL_DEPTH_8U {
            return Err(anyhow!(
                "unsupported pixel depth {} bits (expected {})",
                self.pixel_depth,
                PIXEL_DEPTH_8U
            ));
        }
        if self.needs_bayer && self.channels != 1 {
            return Err(anyhow!(
                "filter-array sources must deliver a single channel, got {}",
                self.channels
            ));
        }
        Ok(())
    }
}

/// Owned pixel grid.
///
/// There is intentionally no mutable access to the pixel data: a frame is
/// immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    channels: u8,
    pixel_depth: u8,
    data: Vec<u8>,
}

impl Frame {
    /// Build an 8-bit frame, validating that `data` covers the whole grid.
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        let expected = frame_byte_len(width, height, channels, PIXEL_DEPTH_8U)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {} bytes for {}x{}x{}, got {}",
                expected,
                width,
                height,
                channels,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            channels,
            pixel_depth: PIXEL_DEPTH_8U,
            data,
        })
    }

    /// Single-channel frame.
    pub fn mono(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, 1, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn pixel_depth(&self) -> u8 {
        self.pixel_depth
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_mono(&self) -> bool {
        self.channels == 1
    }

    /// Fraction of non-zero pixels in a single-channel frame.
    ///
    /// For masks this is the foreground ratio.
    pub fn nonzero_ratio(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let lit = self.data.iter().filter(|&&p| p != 0).count();
        lit as f32 / self.data.len() as f32
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

fn frame_byte_len(width: u32, height: u32, channels: u8, pixel_depth: u8) -> Result<usize> {
    let bytes_per_channel = (pixel_depth as usize).div_ceil(8);
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(channels as usize))
        .and_then(|v| v.checked_mul(bytes_per_channel))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(channels: u8, needs_bayer: bool) -> FrameDescriptor {
        FrameDescriptor {
            width: 4,
            height: 2,
            channels,
            pixel_depth: PIXEL_DEPTH_8U,
            needs_bayer,
        }
    }

    #[test]
    fn frame_rejects_short_buffers() {
        assert!(Frame::new(4, 2, 3, vec![0u8; 23]).is_err());
        assert!(Frame::new(4, 2, 3, vec![0u8; 24]).is_ok());
    }

    #[test]
    fn descriptor_matches_frame_geometry() -> Result<()> {
        let desc = descriptor(1, false);
        assert!(desc.matches(&Frame::mono(4, 2, vec![0u8; 8])?));
        assert!(!desc.matches(&Frame::mono(2, 4, vec![0u8; 8])?));
        assert!(!desc.matches(&Frame::new(4, 2, 3, vec![0u8; 24])?));
        assert_eq!(desc.byte_len()?, 8);
        Ok(())
    }

    #[test]
    fn descriptor_validation_rejects_color_mosaic() {
        assert!(descriptor(1, true).validate().is_ok());
        assert!(descriptor(3, false).validate().is_ok());
        assert!(descriptor(3, true).validate().is_err());
        assert!(descriptor(2, false).validate().is_err());
    }

    #[test]
    fn nonzero_ratio_counts_lit_pixels() -> Result<()> {
        let mask = Frame::mono(2, 2, vec![0, 255, 255, 0])?;
        assert_eq!(mask.nonzero_ratio(), 0.5);
        Ok(())
    }
}
