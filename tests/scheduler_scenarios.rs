use anyhow::{bail, Result};
use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mog_pipeline::accel::{available_platforms, Command, Event};
use mog_pipeline::scheduler::CycleOutcome;
use mog_pipeline::worker::{KernelTuning, WorkerStats};
use mog_pipeline::{
    build_stream_set, build_worker, AccelContext, CommandQueue, Frame, PipelineConfig,
    PipelineStrategy, Presenter, Scheduler, SchedulerOptions, StopReason, StreamSettings,
    WorkGroupSize, Worker, WorkerState,
};

// ----------------------------------------------------------------------------
// Test doubles
// ----------------------------------------------------------------------------

type Presented = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

#[derive(Default)]
struct RecordingPresenter {
    presented: Presented,
}

impl Presenter for RecordingPresenter {
    fn present(&mut self, channel: &str, frame: &Frame) -> Result<()> {
        self.presented
            .lock()
            .unwrap()
            .push((channel.to_string(), frame.data().to_vec()));
        Ok(())
    }
}

/// Queue that runs nothing until `finish` and logs every call.
#[derive(Default)]
struct RecordingQueue {
    log: Mutex<Vec<String>>,
    pending: Mutex<Vec<(Event, Command)>>,
    completed: Mutex<HashSet<Event>>,
    next: Mutex<u64>,
}

impl RecordingQueue {
    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl CommandQueue for RecordingQueue {
    fn enqueue(&self, command: Command) -> Result<Event> {
        let mut next = self.next.lock().unwrap();
        *next += 1;
        let event = Event::new(*next);
        self.log
            .lock()
            .unwrap()
            .push(format!("enqueue {}", command.kind()));
        self.pending.lock().unwrap().push((event, command));
        Ok(event)
    }

    fn flush(&self) -> Result<()> {
        self.log.lock().unwrap().push("flush".to_string());
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.log.lock().unwrap().push("finish".to_string());
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (event, command) in pending {
            command.run()?;
            self.completed.lock().unwrap().insert(event);
        }
        Ok(())
    }

    fn is_complete(&self, event: Event) -> bool {
        self.log.lock().unwrap().push("is_complete".to_string());
        self.completed.lock().unwrap().contains(&event)
    }
}

/// Worker with a scripted grab sequence that fails the test if it is asked
/// to process after a failed grab.
struct ScriptedWorker {
    title: String,
    grabs: Vec<bool>,
    cycle: usize,
    last_grab: bool,
    processed: Arc<Mutex<Vec<usize>>>,
    mask: Option<Frame>,
    stats: WorkerStats,
    closed: bool,
}

impl ScriptedWorker {
    fn new(title: &str, grabs: Vec<bool>, processed: Arc<Mutex<Vec<usize>>>) -> Self {
        Self {
            title: title.to_string(),
            grabs,
            cycle: 0,
            last_grab: false,
            processed,
            mask: None,
            stats: WorkerStats::default(),
            closed: false,
        }
    }
}

impl Worker for ScriptedWorker {
    fn title(&self) -> &str {
        &self.title
    }

    fn state(&self) -> WorkerState {
        if self.closed {
            WorkerState::Closed
        } else if self.last_grab {
            WorkerState::Grabbed
        } else {
            WorkerState::Idle
        }
    }

    fn grab_frame(&mut self) -> bool {
        self.last_grab = self.grabs.get(self.cycle).copied().unwrap_or(false);
        self.cycle += 1;
        self.last_grab
    }

    fn process_frame(&mut self) -> Result<()> {
        if !self.last_grab {
            bail!("{} processed after a failed grab", self.title);
        }
        self.processed.lock().unwrap().push(self.cycle);
        self.mask = Some(Frame::mono(1, 1, vec![self.cycle as u8])?);
        Ok(())
    }

    fn source_frame(&self) -> Option<&Frame> {
        None
    }

    fn intermediate_frame(&self) -> Option<&Frame> {
        None
    }

    fn final_frame(&self) -> Option<&Frame> {
        self.mask.as_ref()
    }

    fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    fn deinit(&mut self) {
        self.closed = true;
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn stream(title: &str, identifier: &str) -> StreamSettings {
    StreamSettings {
        title: title.to_string(),
        identifier: identifier.to_string(),
        bayer: "RG".to_string(),
        learning_rate: -1.0,
        history: 200,
        mixtures: 3,
        background_ratio: 0.7,
        tuning: KernelTuning::default(),
        show_intermediate: false,
    }
}

fn sync_worker(title: &str, identifier: &str) -> Box<dyn Worker> {
    build_worker(&stream(title, identifier), PipelineStrategy::Sync, None).expect("build worker")
}

fn fast_options() -> SchedulerOptions {
    SchedulerOptions {
        frame_interval: Duration::from_millis(1),
        ..SchedulerOptions::default()
    }
}

fn presented_for<'a>(presented: &'a [(String, Vec<u8>)], channel: &str) -> Vec<&'a Vec<u8>> {
    presented
        .iter()
        .filter(|(name, _)| name == channel)
        .map(|(_, data)| data)
        .collect()
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn failed_grab_keeps_previous_mask_while_sibling_updates() -> Result<()> {
    let presenter = RecordingPresenter::default();
    let presented = presenter.presented.clone();
    let workers = vec![
        sync_worker("gate", "stub://gate?width=16&height=12&drop=5"),
        sync_worker("yard", "stub://yard?width=16&height=12&seed=9"),
    ];
    let mut scheduler = Scheduler::new(workers, None, Box::new(presenter), fast_options());

    for _ in 0..5 {
        assert_eq!(scheduler.run_cycle()?, CycleOutcome::Continue);
    }

    let gate = scheduler.workers()[0].as_ref();
    let yard = scheduler.workers()[1].as_ref();
    assert_eq!(gate.state(), WorkerState::Idle);
    assert_eq!(gate.stats().frames_processed, 4);
    assert_eq!(yard.stats().frames_processed, 5);

    {
        let presented = presented.lock().unwrap();
        let gate_masks = presented_for(&presented, "gate");
        let yard_masks = presented_for(&presented, "yard");
        assert_eq!(gate_masks.len(), 5);
        assert_eq!(yard_masks.len(), 5);
        assert_eq!(gate_masks[4], gate_masks[3]);
        assert_eq!(
            yard_masks[4].as_slice(),
            scheduler.workers()[1].final_frame().unwrap().data()
        );
    }

    assert_eq!(scheduler.run_cycle()?, CycleOutcome::Continue);
    assert_eq!(scheduler.workers()[0].stats().frames_processed, 5);
    Ok(())
}

#[test]
fn process_never_follows_a_failed_grab() -> Result<()> {
    let processed_a = Arc::new(Mutex::new(Vec::new()));
    let processed_b = Arc::new(Mutex::new(Vec::new()));
    let workers: Vec<Box<dyn Worker>> = vec![
        Box::new(ScriptedWorker::new(
            "a",
            vec![true, false, true, false, false],
            processed_a.clone(),
        )),
        Box::new(ScriptedWorker::new(
            "b",
            vec![false, true, true, true, false],
            processed_b.clone(),
        )),
    ];
    let presenter = RecordingPresenter::default();
    let presented = presenter.presented.clone();
    let mut scheduler = Scheduler::new(workers, None, Box::new(presenter), fast_options());

    let summary = scheduler.run()?;
    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.cycles, 5);
    assert_eq!(*processed_a.lock().unwrap(), vec![1, 3]);
    assert_eq!(*processed_b.lock().unwrap(), vec![2, 3, 4]);

    // Stream "a" has a mask from cycle 1 on, "b" only from cycle 2.
    let presented = presented.lock().unwrap();
    assert_eq!(presented_for(&presented, "a").len(), 4);
    assert_eq!(presented_for(&presented, "b").len(), 3);
    assert!(scheduler
        .workers()
        .iter()
        .all(|worker| worker.state() == WorkerState::Closed));
    Ok(())
}

#[test]
fn queue_is_finished_before_any_read_back_is_consumed() -> Result<()> {
    let queue = Arc::new(RecordingQueue::default());
    let device = available_platforms()[0].devices[0].clone();
    let accel = AccelContext::with_queue(device, queue.clone(), WorkGroupSize::new(4, 4)?);

    let workers = vec![
        build_worker(
            &stream("left", "stub://left?width=9&height=7"),
            PipelineStrategy::Offload,
            Some(&accel),
        )?,
        build_worker(
            &stream("right", "stub://right?width=5&height=5&drop=2"),
            PipelineStrategy::Offload,
            Some(&accel),
        )?,
    ];
    let presenter = RecordingPresenter::default();
    let presented = presenter.presented.clone();
    let shared: Arc<dyn CommandQueue> = queue.clone();
    let mut scheduler = Scheduler::new(workers, Some(shared), Box::new(presenter), fast_options());

    for _ in 0..3 {
        assert_eq!(scheduler.run_cycle()?, CycleOutcome::Continue);
    }

    let log = queue.entries();
    let mut finished_since_enqueue = true;
    for entry in &log {
        match entry.as_str() {
            "finish" => finished_since_enqueue = true,
            "is_complete" => assert!(finished_since_enqueue, "read-back before finish: {:?}", log),
            e if e.starts_with("enqueue") => finished_since_enqueue = false,
            _ => {}
        }
    }
    assert_eq!(log.iter().filter(|e| *e == "finish").count(), 3);
    assert_eq!(log.iter().filter(|e| *e == "is_complete").count(), 5);

    // Per stream, transfers bracket the compute step.
    let kinds: Vec<&str> = log
        .iter()
        .filter(|e| e.starts_with("enqueue"))
        .map(|e| e.as_str())
        .take(3)
        .collect();
    assert_eq!(kinds, vec!["enqueue write", "enqueue compute", "enqueue read"]);

    assert_eq!(scheduler.workers()[1].stats().frames_processed, 2);
    assert_eq!(presented_for(&presented.lock().unwrap(), "right").len(), 3);
    Ok(())
}

fn load_config(contents: &str) -> Result<PipelineConfig> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    PipelineConfig::load(Some(file.path()))
}

fn titles(workers: &[Box<dyn Worker>]) -> Vec<&str> {
    workers.iter().map(|worker| worker.title()).collect()
}

#[test]
fn empty_stream_slot_is_not_built() -> Result<()> {
    let cfg = load_config(
        r#"
        [General]
        Pipeline = "sync"
        VideoStream1 = "stub://one?width=8&height=8"
        VideoStream2 = ""
        VideoStream3 = "stub://three?width=8&height=8"
        "#,
    )?;

    let workers = build_stream_set(&cfg, None)?;
    assert_eq!(titles(&workers), vec!["Video Stream 1", "Video Stream 3"]);
    Ok(())
}

#[test]
fn zero_mixtures_fails_only_that_stream() -> Result<()> {
    let cfg = load_config(
        r#"
        [General]
        Pipeline = "sync"
        VideoStream1 = "stub://one?width=8&height=8"
        VideoStream2 = "stub://two?width=8&height=8"
        VideoStream3 = "stub://three?width=8&height=8"

        [Streams.VideoStream2]
        NumMixtures = 0
        "#,
    )?;

    let workers = build_stream_set(&cfg, None)?;
    assert_eq!(titles(&workers), vec!["Video Stream 1", "Video Stream 3"]);
    Ok(())
}

#[test]
fn stream_set_fails_when_no_stream_opens() -> Result<()> {
    let cfg = load_config(
        r#"
        [General]
        Pipeline = "sync"
        VideoStream1 = "stub://one?offline=1"
        VideoStream2 = "stub://two?width=8&height=8"

        [Streams.VideoStream2]
        NumMixtures = 0
        "#,
    )?;

    let err = build_stream_set(&cfg, None).err().unwrap();
    assert!(err.to_string().contains("no video stream"));
    Ok(())
}

#[test]
fn loop_ends_when_every_stream_is_exhausted() -> Result<()> {
    let workers = vec![
        sync_worker("short", "stub://short?width=4&height=4&frames=2"),
        sync_worker("long", "stub://long?width=4&height=4&frames=4"),
    ];
    let mut scheduler = Scheduler::new(
        workers,
        None,
        Box::new(RecordingPresenter::default()),
        fast_options(),
    );
    let summary = scheduler.run()?;
    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.cycles, 5);
    assert_eq!(scheduler.workers()[0].stats().frames_processed, 2);
    assert_eq!(scheduler.workers()[1].stats().frames_processed, 4);
    Ok(())
}

#[test]
fn cancellation_stops_at_the_pacing_point() -> Result<()> {
    let workers = vec![sync_worker("cam", "stub://cam?width=4&height=4")];
    let options = SchedulerOptions {
        frame_interval: Duration::from_millis(100),
        ..SchedulerOptions::default()
    };
    let mut scheduler = Scheduler::new(
        workers,
        None,
        Box::new(RecordingPresenter::default()),
        options,
    );
    let token = scheduler.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        token.cancel();
    });

    let summary = scheduler.run()?;
    canceller.join().unwrap();
    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert!(summary.cycles >= 1);
    assert_eq!(scheduler.workers()[0].state(), WorkerState::Closed);
    Ok(())
}

#[test]
fn cycle_limit_and_diagnostic_channels() -> Result<()> {
    let mut settings = stream("color", "stub://color?width=6&height=4&channels=3");
    settings.show_intermediate = true;
    let workers = vec![build_worker(&settings, PipelineStrategy::Sync, None)?];
    let presenter = RecordingPresenter::default();
    let presented = presenter.presented.clone();
    let options = SchedulerOptions {
        show_source_frame: true,
        show_intermediate_frame: true,
        max_cycles: Some(2),
        ..fast_options()
    };
    let mut scheduler = Scheduler::new(workers, None, Box::new(presenter), options);

    let summary = scheduler.run()?;
    assert_eq!(summary.stop_reason, StopReason::CycleLimit);
    assert_eq!(summary.cycles, 2);

    let presented = presented.lock().unwrap();
    let channels: Vec<&str> = presented.iter().take(3).map(|(c, _)| c.as_str()).collect();
    assert_eq!(
        channels,
        vec!["color", "color source", "color intermediate frame"]
    );
    assert_eq!(presented_for(&presented, "color source")[0].len(), 6 * 4 * 3);
    assert_eq!(presented_for(&presented, "color intermediate frame")[0].len(), 6 * 4);
    Ok(())
}
