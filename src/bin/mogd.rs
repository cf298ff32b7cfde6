//! mogd - multi-stream background subtraction daemon
//!
//! This daemon:
//! 1. Loads the configuration (file, then environment overrides)
//! 2. Opens the accelerator queue when the offloaded pipeline is selected
//! 3. Builds one pipeline per configured video stream, skipping any that fail
//! 4. Runs the fixed-cadence loop until the streams run dry or Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mog_pipeline::accel::{available_platforms, describe_platforms};
use mog_pipeline::{
    build_stream_set, AccelContext, CommandQueue, LogPresenter, PipelineConfig, PipelineStrategy,
    Presenter, Scheduler, SchedulerOptions, SnapshotPresenter,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(long, env = "MOG_CONFIG")]
    config: Option<PathBuf>,
    /// Write the latest frame of every channel as PNG into this directory.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// Stop after this many cycles.
    #[arg(long)]
    max_cycles: Option<u64>,
    /// Print accelerator platforms and devices, then exit.
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list_devices {
        print!("{}", describe_platforms(&available_platforms()));
        return Ok(());
    }

    let config = PipelineConfig::load(args.config.as_deref())?;
    log::info!(
        "mogd {} starting: pipeline={}, frame interval {} ms",
        env!("CARGO_PKG_VERSION"),
        config.pipeline,
        config.frame_interval_ms
    );

    let accel = match config.pipeline {
        PipelineStrategy::Offload => Some(AccelContext::create(
            config.device_selection,
            config.work_group()?,
        )?),
        PipelineStrategy::Sync => None,
    };

    let workers = build_stream_set(&config, accel.as_ref())?;
    log::info!("{} stream(s) running", workers.len());

    let presenter: Box<dyn Presenter> = match &args.snapshot_dir {
        Some(dir) => {
            log::info!("writing snapshots to {}", dir.display());
            Box::new(SnapshotPresenter::new(dir)?)
        }
        None => Box::new(LogPresenter),
    };
    let queue: Option<Arc<dyn CommandQueue>> = accel.as_ref().map(|ctx| ctx.queue().clone());
    let options = SchedulerOptions {
        frame_interval: Duration::from_millis(config.frame_interval_ms),
        show_source_frame: config.show_source_frame,
        show_intermediate_frame: config.show_intermediate_frame,
        max_cycles: args.max_cycles,
    };
    let mut scheduler = Scheduler::new(workers, queue, presenter, options);

    let cancel = scheduler.cancel_token();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .expect("error setting Ctrl-C handler");

    let summary = scheduler.run()?;
    log::info!(
        "mogd stopped after {} cycle(s) ({:?})",
        summary.cycles,
        summary.stop_reason
    );
    Ok(())
}
