//! Per-stream preprocessing.
//!
//! The mode is selected once from the source descriptor and then applied to
//! every captured frame before it reaches the estimator. The estimator only
//! ever sees single-channel 8-bit frames.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

use crate::frame::{Frame, FrameDescriptor};

/// 2x2 color-filter-array arrangement, named by its top-left row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BayerPattern {
    Rg,
    Bg,
    Gr,
    Gb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cfa {
    R,
    G,
    B,
}

impl BayerPattern {
    /// Filter color at (x, y) of the sensor.
    fn color_at(self, x: usize, y: usize) -> Cfa {
        let layout = match self {
            BayerPattern::Rg => [[Cfa::R, Cfa::G], [Cfa::G, Cfa::B]],
            BayerPattern::Bg => [[Cfa::B, Cfa::G], [Cfa::G, Cfa::R]],
            BayerPattern::Gr => [[Cfa::G, Cfa::R], [Cfa::B, Cfa::G]],
            BayerPattern::Gb => [[Cfa::G, Cfa::B], [Cfa::R, Cfa::G]],
        };
        layout[y % 2][x % 2]
    }
}

impl FromStr for BayerPattern {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "RG" => Ok(BayerPattern::Rg),
            "BG" => Ok(BayerPattern::Bg),
            "GR" => Ok(BayerPattern::Gr),
            "GB" => Ok(BayerPattern::Gb),
            other => Err(anyhow!(
                "General.Bayer: unrecognized pattern '{}' (expected RG, BG, GR or GB)",
                other
            )),
        }
    }
}

impl fmt::Display for BayerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BayerPattern::Rg => "RG",
            BayerPattern::Bg => "BG",
            BayerPattern::Gr => "GR",
            BayerPattern::Gb => "GB",
        };
        f.write_str(name)
    }
}

/// Conversion applied to each captured frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreprocessMode {
    Passthrough,
    ColorToMono,
    FilterArrayToMono(BayerPattern),
}

impl PreprocessMode {
    /// Select the mode for a source.
    ///
    /// `bayer` is the configured pattern string; it is only parsed when the
    /// source actually delivers a mosaic, and an unrecognized value is an error.
    pub fn select(descriptor: &FrameDescriptor, bayer: &str) -> Result<Self> {
        if descriptor.channels == 3 {
            return Ok(PreprocessMode::ColorToMono);
        }
        if descriptor.channels == 1 && descriptor.needs_bayer {
            return Ok(PreprocessMode::FilterArrayToMono(bayer.parse()?));
        }
        Ok(PreprocessMode::Passthrough)
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, PreprocessMode::Passthrough)
    }

    /// Convert a captured frame. Returns `None` for passthrough, in which case
    /// the source frame is fed to the estimator unchanged.
    pub fn apply(&self, frame: &Frame) -> Result<Option<Frame>> {
        match self {
            PreprocessMode::Passthrough => Ok(None),
            PreprocessMode::ColorToMono => color_to_mono(frame).map(Some),
            PreprocessMode::FilterArrayToMono(pattern) => {
                bayer_to_mono(frame, *pattern).map(Some)
            }
        }
    }
}

impl fmt::Display for PreprocessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreprocessMode::Passthrough => f.write_str("passthrough"),
            PreprocessMode::ColorToMono => f.write_str("color-to-mono"),
            PreprocessMode::FilterArrayToMono(pattern) => {
                write!(f, "bayer-{}-to-mono", pattern)
            }
        }
    }
}

/// RGB to luma using BT.601 weights in 14-bit fixed point.
pub fn color_to_mono(frame: &Frame) -> Result<Frame> {
    if frame.channels() != 3 {
        return Err(anyhow!(
            "color-to-mono expects 3 channels, got {}",
            frame.channels()
        ));
    }
    let gray = frame
        .data()
        .chunks_exact(3)
        .map(|px| luma(px[0] as u32, px[1] as u32, px[2] as u32))
        .collect();
    Frame::mono(frame.width(), frame.height(), gray)
}

/// Demosaic a raw filter-array frame straight to luma.
///
/// Every output pixel is computed from the 2x2 sensor window anchored at it
/// (clamped at the right and bottom edges), which always holds one red, two
/// green and one blue sample.
pub fn bayer_to_mono(frame: &Frame, pattern: BayerPattern) -> Result<Frame> {
    if frame.channels() != 1 {
        return Err(anyhow!(
            "bayer-to-mono expects 1 channel, got {}",
            frame.channels()
        ));
    }
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let raw = frame.data();
    if w < 2 || h < 2 {
        return Frame::mono(frame.width(), frame.height(), raw.to_vec());
    }

    let mut gray = vec![0u8; w * h];
    for y in 0..h {
        let y0 = y.min(h - 2);
        for x in 0..w {
            let x0 = x.min(w - 2);
            let (mut r, mut g, mut b) = (0u32, 0u32, 0u32);
            for dy in 0..2 {
                for dx in 0..2 {
                    let sx = x0 + dx;
                    let sy = y0 + dy;
                    let value = raw[sy * w + sx] as u32;
                    match pattern.color_at(sx, sy) {
                        Cfa::R => r += value,
                        Cfa::G => g += value,
                        Cfa::B => b += value,
                    }
                }
            }
            // two green samples per window
            gray[y * w + x] = luma_half_green(r, g, b);
        }
    }
    Frame::mono(frame.width(), frame.height(), gray)
}

const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

fn luma(r: u32, g: u32, b: u32) -> u8 {
    let y = (r * LUMA_R + g * LUMA_G + b * LUMA_B + (1 << (LUMA_SHIFT - 1))) >> LUMA_SHIFT;
    y.min(255) as u8
}

fn luma_half_green(r: u32, g2: u32, b: u32) -> u8 {
    let y = (2 * r * LUMA_R + g2 * LUMA_G + 2 * b * LUMA_B + (1 << LUMA_SHIFT)) >> (LUMA_SHIFT + 1);
    y.min(255) as u8
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
