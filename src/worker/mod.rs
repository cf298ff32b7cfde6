//! Per-stream pipelines.
//!
//! A worker owns one capture source, its preprocessing mode and one
//! estimator binding. Each cycle the scheduler calls `grab_frame`, then
//! `process_frame` for streams whose grab succeeded, then `finish_frame`
//! once any shared command queue has been finished.
//!
//! Two strategies implement the same contract:
//! - `SyncWorker` runs the estimator on the calling thread.
//! - `OffloadWorker` records transfer, compute and read-back commands on the
//!   accelerator queue; its mask only updates in `finish_frame`.

mod offload;
mod stream;
mod sync;

pub use offload::OffloadWorker;
pub use sync::SyncWorker;

use anyhow::{anyhow, bail, Result};
use std::fmt;
use std::str::FromStr;

use crate::accel::AccelContext;
use crate::config::PipelineConfig;
use crate::estimator::{
    MogParams, DEFAULT_INITIAL_VARIANCE, DEFAULT_INITIAL_WEIGHT, DEFAULT_MIN_VARIANCE,
    DEFAULT_VARIANCE_THRESHOLD,
};
use crate::frame::Frame;

/// `General.Pipeline`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PipelineStrategy {
    Sync,
    #[default]
    Offload,
}

impl FromStr for PipelineStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(PipelineStrategy::Sync),
            "offload" => Ok(PipelineStrategy::Offload),
            other => Err(anyhow!(
                "General.Pipeline must be 'sync' or 'offload' (got '{}')",
                other
            )),
        }
    }
}

impl fmt::Display for PipelineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStrategy::Sync => f.write_str("sync"),
            PipelineStrategy::Offload => f.write_str("offload"),
        }
    }
}

/// Where a worker is within the current cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Initialized, nothing grabbed yet.
    Ready,
    /// Last grab delivered a frame that has not been processed.
    Grabbed,
    /// Frame of this cycle handed to the estimator.
    Processed,
    /// Last grab delivered nothing.
    Idle,
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct WorkerStats {
    pub frames_grabbed: u64,
    pub grab_failures: u64,
    pub frames_processed: u64,
}

/// Estimator tuning that only the offloaded strategy honors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelTuning {
    pub variance_threshold: f32,
    pub initial_weight: f32,
    pub initial_variance: f32,
    pub min_variance: f32,
}

impl Default for KernelTuning {
    fn default() -> Self {
        Self {
            variance_threshold: DEFAULT_VARIANCE_THRESHOLD,
            initial_weight: DEFAULT_INITIAL_WEIGHT,
            initial_variance: DEFAULT_INITIAL_VARIANCE,
            min_variance: DEFAULT_MIN_VARIANCE,
        }
    }
}

/// Everything needed to build one stream.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Presentation title, also used in log lines.
    pub title: String,
    pub identifier: String,
    /// Filter-array pattern name, checked only when the source needs it.
    pub bayer: String,
    pub learning_rate: f32,
    pub history: u32,
    pub mixtures: i64,
    pub background_ratio: f32,
    pub tuning: KernelTuning,
    pub show_intermediate: bool,
}

impl StreamSettings {
    pub(crate) fn params(&self, strategy: PipelineStrategy) -> Result<MogParams> {
        let params = MogParams::new(self.history, self.mixtures, self.background_ratio)
            .map_err(|err| anyhow!("{}: {}", self.title, err))?;
        Ok(match strategy {
            PipelineStrategy::Sync => params,
            PipelineStrategy::Offload => params
                .with_variance_threshold(self.tuning.variance_threshold)
                .with_initial_weight(self.tuning.initial_weight)
                .with_initial_variance(self.tuning.initial_variance)
                .with_min_variance(self.tuning.min_variance),
        })
    }
}

/// One stream pipeline as seen by the scheduler.
pub trait Worker {
    fn title(&self) -> &str;

    fn state(&self) -> WorkerState;

    /// Pull the next frame. `false` means no new data this cycle.
    fn grab_frame(&mut self) -> bool;

    /// Preprocess and estimate the frame grabbed this cycle.
    ///
    /// Errors when the last `grab_frame` did not succeed.
    fn process_frame(&mut self) -> Result<()>;

    /// Collect results that complete asynchronously. Called after the shared
    /// queue (if any) has finished.
    fn finish_frame(&mut self) -> Result<()> {
        Ok(())
    }

    fn source_frame(&self) -> Option<&Frame>;

    /// Estimator input of the last processed frame, kept only when requested.
    fn intermediate_frame(&self) -> Option<&Frame>;

    /// Latest foreground mask.
    fn final_frame(&self) -> Option<&Frame>;

    fn stats(&self) -> &WorkerStats;

    /// Release the source. Idempotent.
    fn deinit(&mut self);
}

/// Build a worker for `settings` using `strategy`.
///
/// The offloaded strategy needs the accelerator context.
pub fn build_worker(
    settings: &StreamSettings,
    strategy: PipelineStrategy,
    accel: Option<&AccelContext>,
) -> Result<Box<dyn Worker>> {
    match strategy {
        PipelineStrategy::Sync => Ok(Box::new(SyncWorker::new(settings)?)),
        PipelineStrategy::Offload => {
            let accel = accel.ok_or_else(|| {
                anyhow!("{}: offloaded pipeline needs an accelerator context", settings.title)
            })?;
            Ok(Box::new(OffloadWorker::new(settings, accel.clone())?))
        }
    }
}

/// Build one worker per configured stream with the configured strategy.
///
/// A stream that fails to open or configure is logged and left out; the
/// others still run. Fails only when no stream could be built.
pub fn build_stream_set(
    config: &PipelineConfig,
    accel: Option<&AccelContext>,
) -> Result<Vec<Box<dyn Worker>>> {
    let mut workers = Vec::new();
    for settings in config.stream_settings() {
        match build_worker(&settings, config.pipeline, accel) {
            Ok(worker) => workers.push(worker),
            Err(err) => log::warn!("{} excluded: {:#}", settings.title, err),
        }
    }
    if workers.is_empty() {
        bail!("no video stream could be opened");
    }
    Ok(workers)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
