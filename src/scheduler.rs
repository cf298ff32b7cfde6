//! Fixed-cadence multi-stream loop.
//!
//! One cycle:
//! 1. grab a frame on every stream
//! 2. stop if no stream delivered one
//! 3. process every stream that delivered one
//! 4. flush and finish the shared command queue, then collect results
//! 5. present every stream that has a mask
//! 6. sleep for the rest of the frame interval (at least 1 ms)
//!
//! Cancellation is observed at the pacing point, so a running cycle always
//! completes, queue included.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::accel::CommandQueue;
use crate::present::Presenter;
use crate::worker::Worker;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const MIN_PACING: Duration = Duration::from_millis(1);

/// Cross-thread stop request, checked between cycles.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        if let Ok(mut cancelled) = flag.lock() {
            *cancelled = true;
        }
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.0.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleep up to `timeout`, returning early once cancelled. Returns whether
    /// the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let Ok(guard) = flag.lock() else {
            return true;
        };
        match wake.wait_timeout_while(guard, timeout, |cancelled| !*cancelled) {
            Ok((cancelled, _)) => *cancelled,
            Err(_) => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// Every stream failed to grab this cycle.
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The stream set was empty; no cycle ran.
    NoStreams,
    Exhausted,
    Cancelled,
    CycleLimit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub stop_reason: StopReason,
}

#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub frame_interval: Duration,
    pub show_source_frame: bool,
    pub show_intermediate_frame: bool,
    pub max_cycles: Option<u64>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(30),
            show_source_frame: false,
            show_intermediate_frame: false,
            max_cycles: None,
        }
    }
}

pub struct Scheduler {
    workers: Vec<Box<dyn Worker>>,
    queue: Option<Arc<dyn CommandQueue>>,
    presenter: Box<dyn Presenter>,
    options: SchedulerOptions,
    cancel: CancelToken,
    grabbed: Vec<bool>,
    last_cycle: Duration,
}

impl Scheduler {
    /// `queue` is the command queue shared by offloaded workers, if any.
    pub fn new(
        workers: Vec<Box<dyn Worker>>,
        queue: Option<Arc<dyn CommandQueue>>,
        presenter: Box<dyn Presenter>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            grabbed: vec![false; workers.len()],
            workers,
            queue,
            presenter,
            options,
            cancel: CancelToken::new(),
            last_cycle: Duration::ZERO,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn workers(&self) -> &[Box<dyn Worker>] {
        &self.workers
    }

    /// Run one grab/process/present pass without pacing.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let started = Instant::now();

        for (worker, grabbed) in self.workers.iter_mut().zip(self.grabbed.iter_mut()) {
            *grabbed = worker.grab_frame();
        }
        if !self.grabbed.iter().any(|&grabbed| grabbed) {
            self.last_cycle = started.elapsed();
            return Ok(CycleOutcome::Exhausted);
        }

        for (worker, &grabbed) in self.workers.iter_mut().zip(&self.grabbed) {
            if grabbed {
                worker.process_frame()?;
            }
        }

        if let Some(queue) = &self.queue {
            queue.flush()?;
            queue
                .finish()
                .map_err(|err| anyhow!("accelerator queue failed: {:#}", err))?;
        }
        for (worker, &grabbed) in self.workers.iter_mut().zip(&self.grabbed) {
            if grabbed {
                worker.finish_frame()?;
            }
        }

        for worker in &self.workers {
            let Some(mask) = worker.final_frame() else {
                continue;
            };
            let title = worker.title();
            self.presenter.present(title, mask)?;
            if self.options.show_source_frame {
                if let Some(source) = worker.source_frame() {
                    self.presenter.present(&format!("{} source", title), source)?;
                }
            }
            if self.options.show_intermediate_frame {
                if let Some(intermediate) = worker.intermediate_frame() {
                    self.presenter
                        .present(&format!("{} intermediate frame", title), intermediate)?;
                }
            }
        }

        self.last_cycle = started.elapsed();
        Ok(CycleOutcome::Continue)
    }

    /// Cycle until exhaustion, cancellation or the cycle limit. Every worker
    /// is closed on return, including on error.
    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.run_loop();
        self.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<RunSummary> {
        if self.workers.is_empty() {
            return Ok(RunSummary {
                cycles: 0,
                stop_reason: StopReason::NoStreams,
            });
        }

        let mut cycles = 0u64;
        let mut last_health_log = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.summary(cycles, StopReason::Cancelled));
            }
            let started = Instant::now();
            let outcome = self.run_cycle()?;
            cycles += 1;
            if outcome == CycleOutcome::Exhausted {
                return Ok(self.summary(cycles, StopReason::Exhausted));
            }
            if self.options.max_cycles.is_some_and(|max| cycles >= max) {
                return Ok(self.summary(cycles, StopReason::CycleLimit));
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health();
                last_health_log = Instant::now();
            }

            let pause = self
                .options
                .frame_interval
                .saturating_sub(started.elapsed())
                .max(MIN_PACING);
            if self.cancel.wait_timeout(pause) {
                return Ok(self.summary(cycles, StopReason::Cancelled));
            }
        }
    }

    fn summary(&self, cycles: u64, stop_reason: StopReason) -> RunSummary {
        log::debug!("scheduler stopped after {} cycle(s): {:?}", cycles, stop_reason);
        RunSummary {
            cycles,
            stop_reason,
        }
    }

    fn log_health(&self) {
        for worker in &self.workers {
            let stats = worker.stats();
            log::info!(
                "{} grabbed={} failed={} processed={}",
                worker.title(),
                stats.frames_grabbed,
                stats.grab_failures,
                stats.frames_processed
            );
        }
        log::info!("last cycle took {:?}", self.last_cycle);
    }

    /// Close every stream. Idempotent.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.deinit();
        }
    }
}
