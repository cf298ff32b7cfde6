//! Foreground/background estimator stage.
//!
//! `MogParams` carries the numeric tuning of the mixture model. Only the
//! mixture count is checked here; everything else is passed through as
//! configured. `MogEstimator` runs the model synchronously on the calling
//! thread; the offloaded worker drives the same `MogModel` through the
//! command queue instead.

mod mog;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use mog::{MogModel, UpdateRate, BACKGROUND, FOREGROUND};

pub const DEFAULT_HISTORY: u32 = 200;
pub const DEFAULT_MIXTURES: usize = 5;
pub const DEFAULT_BACKGROUND_RATIO: f32 = 0.7;
/// Squared match threshold in standard deviations (2.5 sigma).
pub const DEFAULT_VARIANCE_THRESHOLD: f32 = 2.5 * 2.5;
pub const DEFAULT_INITIAL_WEIGHT: f32 = 0.05;
/// Squared default noise sigma of 15 gray levels.
pub const DEFAULT_INITIAL_VARIANCE: f32 = 15.0 * 15.0;
pub const DEFAULT_MIN_VARIANCE: f32 = 15.0 * 15.0;
/// Upper bound on `MogParameters.NumMixtures`.
pub const MAX_MIXTURES: usize = 64;

/// Mixture model tuning.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MogParams {
    history: u32,
    mixtures: usize,
    background_ratio: f32,
    variance_threshold: f32,
    initial_weight: f32,
    initial_variance: f32,
    min_variance: f32,
}

impl MogParams {
    /// Configure the model. Fails when `mixtures` is not in
    /// `1..=MAX_MIXTURES`.
    pub fn new(history: u32, mixtures: i64, background_ratio: f32) -> Result<Self> {
        if mixtures <= 0 {
            return Err(anyhow!(
                "MogParameters.NumMixtures must be greater than zero (got {})",
                mixtures
            ));
        }
        let mixtures = usize::try_from(mixtures)
            .ok()
            .filter(|&count| count <= MAX_MIXTURES)
            .ok_or_else(|| {
                anyhow!(
                    "MogParameters.NumMixtures must be at most {} (got {})",
                    MAX_MIXTURES,
                    mixtures
                )
            })?;
        Ok(Self {
            history,
            mixtures,
            background_ratio,
            variance_threshold: DEFAULT_VARIANCE_THRESHOLD,
            initial_weight: DEFAULT_INITIAL_WEIGHT,
            initial_variance: DEFAULT_INITIAL_VARIANCE,
            min_variance: DEFAULT_MIN_VARIANCE,
        })
    }

    pub fn with_variance_threshold(mut self, value: f32) -> Self {
        self.variance_threshold = value;
        self
    }

    pub fn with_initial_weight(mut self, value: f32) -> Self {
        self.initial_weight = value;
        self
    }

    pub fn with_initial_variance(mut self, value: f32) -> Self {
        self.initial_variance = value;
        self
    }

    pub fn with_min_variance(mut self, value: f32) -> Self {
        self.min_variance = value;
        self
    }

    pub fn history(&self) -> u32 {
        self.history
    }

    pub fn mixtures(&self) -> usize {
        self.mixtures
    }

    pub fn background_ratio(&self) -> f32 {
        self.background_ratio
    }

    pub fn variance_threshold(&self) -> f32 {
        self.variance_threshold
    }

    pub fn initial_weight(&self) -> f32 {
        self.initial_weight
    }

    pub fn initial_variance(&self) -> f32 {
        self.initial_variance
    }

    pub fn min_variance(&self) -> f32 {
        self.min_variance
    }
}

impl Default for MogParams {
    fn default() -> Self {
        Self {
            history: DEFAULT_HISTORY,
            mixtures: DEFAULT_MIXTURES,
            background_ratio: DEFAULT_BACKGROUND_RATIO,
            variance_threshold: DEFAULT_VARIANCE_THRESHOLD,
            initial_weight: DEFAULT_INITIAL_WEIGHT,
            initial_variance: DEFAULT_INITIAL_VARIANCE,
            min_variance: DEFAULT_MIN_VARIANCE,
        }
    }
}

/// Synchronous estimator: `apply` blocks until the mask is ready.
pub struct MogEstimator {
    model: MogModel,
}

impl MogEstimator {
    pub fn new(width: u32, height: u32, params: MogParams) -> Result<Self> {
        Ok(Self {
            model: MogModel::new(width, height, params)?,
        })
    }

    pub fn model(&self) -> &MogModel {
        &self.model
    }

    /// Feed one single-channel frame and return the foreground mask.
    pub fn apply(&mut self, input: &Frame, learning_rate: f32) -> Result<Frame> {
        if !input.is_mono() {
            return Err(anyhow!(
                "estimator expects a single-channel frame, got {} channels",
                input.channels()
            ));
        }
        if input.width() != self.model.width() || input.height() != self.model.height() {
            return Err(anyhow!(
                "frame size {}x{} does not match estimator {}x{}",
                input.width(),
                input.height(),
                self.model.width(),
                self.model.height()
            ));
        }
        let mut mask = vec![BACKGROUND; input.pixel_count()];
        self.model.apply(input.data(), &mut mask, learning_rate)?;
        Frame::mono(input.width(), input.height(), mask)
    }
}
