//! Per-pixel adaptive mixture-of-Gaussians background model.
//!
//! Each pixel keeps up to `mixtures` weighted Gaussians kept sorted by
//! `weight / sigma`, strongest first. The leading components whose cumulative
//! weight exceeds `background_ratio` model the background; a sample matched by
//! any other component (or by none) is foreground.

use anyhow::{anyhow, Result};

use super::MogParams;

/// Mask value for foreground pixels.
pub const FOREGROUND: u8 = 255;
/// Mask value for background pixels.
pub const BACKGROUND: u8 = 0;

#[derive(Clone, Copy, Debug, Default)]
struct Gaussian {
    weight: f32,
    mean: f32,
    variance: f32,
}

impl Gaussian {
    fn sort_key(&self) -> f32 {
        if self.variance > 0.0 {
            self.weight / self.variance.sqrt()
        } else {
            0.0
        }
    }

    fn is_active(&self) -> bool {
        self.weight > 0.0
    }
}

/// How a frame updates the model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpdateRate {
    /// Adapt with the given learning rate.
    Adapt(f32),
    /// Classify against the existing state without mutating it.
    Freeze,
}

/// Accumulated statistical state for one stream.
///
/// Never shared between streams: each pixel's history is only meaningful
/// for the sensor position it was learned from.
pub struct MogModel {
    width: u32,
    height: u32,
    params: MogParams,
    components: Vec<Gaussian>,
    frames_seen: u64,
}

impl MogModel {
    /// Allocate the per-pixel component table. Fails when the table would
    /// not fit in memory for this frame size and mixture count.
    pub fn new(width: u32, height: u32, params: MogParams) -> Result<Self> {
        let components = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(params.mixtures()))
            .filter(|&count| {
                count
                    .checked_mul(std::mem::size_of::<Gaussian>())
                    .is_some_and(|bytes| bytes <= isize::MAX as usize)
            })
            .ok_or_else(|| {
                anyhow!(
                    "MogParameters.NumMixtures {} is too large for a {}x{} frame",
                    params.mixtures(),
                    width,
                    height
                )
            })?;
        Ok(Self {
            width,
            height,
            components: vec![Gaussian::default(); components],
            params,
            frames_seen: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn params(&self) -> &MogParams {
        &self.params
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Account for a new frame and resolve the rate it is processed with.
    ///
    /// A negative learning rate selects `1 / min(frames, history)`. Zero
    /// freezes the model once it has been initialized by a first frame.
    pub fn begin_frame(&mut self, learning_rate: f32) -> UpdateRate {
        self.frames_seen += 1;
        if learning_rate >= 0.0 && self.frames_seen > 1 {
            if learning_rate == 0.0 {
                UpdateRate::Freeze
            } else {
                UpdateRate::Adapt(learning_rate.min(1.0))
            }
        } else {
            let span = self.frames_seen.min(self.params.history().max(1) as u64);
            UpdateRate::Adapt(1.0 / span as f32)
        }
    }

    /// Update one pixel with `value` and return its mask value.
    pub fn process_pixel(&mut self, index: usize, value: u8, rate: UpdateRate) -> u8 {
        match rate {
            UpdateRate::Freeze => self.classify_pixel(index, value),
            UpdateRate::Adapt(alpha) => self.update_pixel(index, value, alpha),
        }
    }

    /// Run a whole frame through the model on the calling thread.
    pub fn apply(&mut self, input: &[u8], mask: &mut [u8], learning_rate: f32) -> Result<()> {
        let pixels = self.pixel_count();
        if input.len() != pixels || mask.len() != pixels {
            return Err(anyhow!(
                "model is {}x{} but got {} input and {} mask pixels",
                self.width,
                self.height,
                input.len(),
                mask.len()
            ));
        }
        let rate = self.begin_frame(learning_rate);
        for (index, (&value, out)) in input.iter().zip(mask.iter_mut()).enumerate() {
            *out = self.process_pixel(index, value, rate);
        }
        Ok(())
    }

    fn pixel_components(&self, index: usize) -> &[Gaussian] {
        let k = self.params.mixtures();
        &self.components[index * k..(index + 1) * k]
    }

    fn classify_pixel(&self, index: usize, value: u8) -> u8 {
        let comps = self.pixel_components(index);
        let threshold = self.params.variance_threshold();
        let pix = value as f32;
        let hit = comps
            .iter()
            .take_while(|c| c.is_active())
            .position(|c| {
                let diff = pix - c.mean;
                diff * diff < threshold * c.variance
            });
        let background = background_count(comps, self.params.background_ratio());
        match hit {
            Some(position) if position < background => BACKGROUND,
            _ => FOREGROUND,
        }
    }

    fn update_pixel(&mut self, index: usize, value: u8, alpha: f32) -> u8 {
        let k = self.params.mixtures();
        let threshold = self.params.variance_threshold();
        let min_variance = self.params.min_variance();
        let initial_weight = self.params.initial_weight();
        let initial_variance = self.params.initial_variance();
        let background_ratio = self.params.background_ratio();
        let comps = &mut self.components[index * k..(index + 1) * k];
        let pix = value as f32;

        let active = comps.iter().take_while(|c| c.is_active()).count();
        let matched = comps[..active].iter().position(|c| {
            let diff = pix - c.mean;
            diff * diff < threshold * c.variance
        });

        for c in comps[..active].iter_mut() {
            c.weight *= 1.0 - alpha;
            if c.weight < f32::EPSILON {
                c.weight = 0.0;
            }
        }

        let mut hit = match matched {
            Some(i) => {
                let c = &mut comps[i];
                let diff = pix - c.mean;
                c.weight += alpha;
                c.mean += alpha * diff;
                c.variance =
                    (c.variance + alpha * (diff * diff - c.variance)).max(min_variance);
                i
            }
            None => {
                // Replace the weakest component, or take the first free slot.
                let slot = active.min(k - 1);
                comps[slot] = Gaussian {
                    weight: initial_weight,
                    mean: pix,
                    variance: initial_variance,
                };
                slot
            }
        };

        let total: f32 = comps.iter().map(|c| c.weight).sum();
        if total > 0.0 {
            for c in comps.iter_mut() {
                c.weight /= total;
            }
        }

        // Keep components ordered by weight / sigma, strongest first. Free
        // slots have a zero key and settle at the tail.
        for i in 1..k {
            let mut j = i;
            while j > 0 && comps[j - 1].sort_key() < comps[j].sort_key() {
                comps.swap(j - 1, j);
                if hit == j {
                    hit = j - 1;
                } else if hit == j - 1 {
                    hit = j;
                }
                j -= 1;
            }
        }

        if hit < background_count(comps, background_ratio) {
            BACKGROUND
        } else {
            FOREGROUND
        }
    }
}

/// Number of leading components that together explain the background.
fn background_count(comps: &[Gaussian], background_ratio: f32) -> usize {
    let mut cumulative = 0.0;
    for (i, c) in comps.iter().enumerate() {
        if !c.is_active() {
            return i;
        }
        cumulative += c.weight;
        if cumulative > background_ratio {
            return i + 1;
        }
    }
    comps.len()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
