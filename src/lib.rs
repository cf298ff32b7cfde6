//! Multi-stream mixture-of-Gaussians background subtraction.
//!
//! This crate drives several independently configured video streams through
//! an adaptive foreground/background estimator at a fixed cadence.
//!
//! # Architecture
//!
//! Each stream is a pipeline of three stages:
//!
//! 1. **Capture**: a `CaptureSource` delivers frames with a format fixed at
//!    `init`. A failed grab skips the stream for one cycle.
//! 2. **Preprocessing**: chosen once from the source format; color and
//!    filter-array frames are reduced to one channel.
//! 3. **Estimation**: a per-stream mixture model produces a binary mask,
//!    either on the calling thread or as commands on a shared queue.
//!
//! The `Scheduler` grabs every stream, processes the ones that delivered a
//! frame, finishes the queue, presents the results and paces the loop.
//!
//! # Module Structure
//!
//! - `frame`: Frames and capture descriptors
//! - `ingest`: Capture sources (synthetic, image sequences, V4L2, FFmpeg, frame grabber)
//! - `preprocess`: Preprocessing mode selection and conversions
//! - `estimator`: Mixture-of-Gaussians model
//! - `accel`: Devices, command queue and device images
//! - `worker`: Per-stream pipelines (sync and offloaded)
//! - `present`: Result presentation
//! - `scheduler`: The fixed-cadence loop
//! - `config`: Configuration file and environment loading

pub mod accel;
pub mod config;
pub mod estimator;
pub mod frame;
pub mod ingest;
pub mod present;
pub mod preprocess;
pub mod scheduler;
pub mod worker;

pub use accel::{AccelContext, CommandQueue, DeviceSelection, HostQueue, WorkGroupSize};
pub use config::PipelineConfig;
pub use estimator::{MogEstimator, MogParams, BACKGROUND, FOREGROUND};
pub use frame::{Frame, FrameDescriptor};
pub use ingest::{CaptureSource, SourceVariant};
pub use present::{LogPresenter, Presenter, SnapshotPresenter};
pub use preprocess::{BayerPattern, PreprocessMode};
pub use scheduler::{CancelToken, RunSummary, Scheduler, SchedulerOptions, StopReason};
pub use worker::{
    build_stream_set, build_worker, PipelineStrategy, StreamSettings, Worker, WorkerState,
};
