//! Offloaded pipeline: the estimator runs as queued commands.
//!
//! `process_frame` records three commands on the shared queue:
//! 1. write: estimator input into this stream's device input image
//! 2. compute: the mixture model over the image, tile by tile
//! 3. read: the device mask into this stream's host read-back buffer
//!
//! The new mask is taken from the read-back buffer in `finish_frame`, which
//! refuses to run before the read command has completed.

use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Mutex};

use super::stream::StreamCore;
use super::{PipelineStrategy, StreamSettings, Worker, WorkerState, WorkerStats};
use crate::accel::{AccelContext, Command, CommandKind, DeviceImage, Event};
use crate::estimator::MogModel;
use crate::frame::Frame;

pub struct OffloadWorker {
    core: StreamCore,
    accel: AccelContext,
    model: Arc<Mutex<MogModel>>,
    input: DeviceImage,
    output: DeviceImage,
    readback: Arc<Mutex<Vec<u8>>>,
    pending_read: Option<Event>,
}

impl OffloadWorker {
    pub fn new(settings: &StreamSettings, accel: AccelContext) -> Result<Self> {
        let params = settings.params(PipelineStrategy::Offload)?;
        let core = StreamCore::open(settings)?;
        let descriptor = core.descriptor();
        let model = MogModel::new(descriptor.width, descriptor.height, params)?;
        let input = accel.create_image(descriptor.width, descriptor.height)?;
        let output = accel.create_image(descriptor.width, descriptor.height)?;
        Ok(Self {
            readback: Arc::new(Mutex::new(vec![0u8; output.len()])),
            model: Arc::new(Mutex::new(model)),
            core,
            accel,
            input,
            output,
            pending_read: None,
        })
    }

    fn enqueue_estimate(&self, input: Frame) -> Result<Event> {
        let queue = self.accel.queue();
        let title = self.core.title();

        let device_input = self.input.clone();
        let pixels = input.into_data();
        queue.enqueue(Command::new(
            CommandKind::Write,
            format!("{} input", title),
            move || device_input.write(&pixels),
        ))?;

        let model = self.model.clone();
        let device_input = self.input.clone();
        let device_output = self.output.clone();
        let group = self.accel.work_group();
        let learning_rate = self.core.learning_rate;
        queue.enqueue(Command::new(
            CommandKind::Compute,
            format!("{} mog", title),
            move || {
                let mut model = model
                    .lock()
                    .map_err(|_| anyhow!("estimator state lock poisoned"))?;
                let src = device_input.lock()?;
                let mut dst = device_output.lock()?;
                let width = model.width();
                let rate = model.begin_frame(learning_rate);
                group.for_each_tile(width, model.height(), |xs, ys| {
                    for y in ys {
                        let row = (y * width) as usize;
                        for x in xs.clone() {
                            let index = row + x as usize;
                            dst[index] = model.process_pixel(index, src[index], rate);
                        }
                    }
                });
                Ok(())
            },
        ))?;

        let device_output = self.output.clone();
        let readback = self.readback.clone();
        queue.enqueue(Command::new(
            CommandKind::Read,
            format!("{} mask", title),
            move || {
                let mut host = readback
                    .lock()
                    .map_err(|_| anyhow!("read-back buffer lock poisoned"))?;
                device_output.read_into(&mut host)
            },
        ))
    }
}

impl Worker for OffloadWorker {
    fn title(&self) -> &str {
        self.core.title()
    }

    fn state(&self) -> WorkerState {
        self.core.state()
    }

    fn grab_frame(&mut self) -> bool {
        self.core.grab()
    }

    fn process_frame(&mut self) -> Result<()> {
        if self.pending_read.is_some() {
            bail!("{}: previous frame was never finished", self.core.title());
        }
        let input = self.core.estimator_input()?;
        self.pending_read = Some(self.enqueue_estimate(input)?);
        Ok(())
    }

    fn finish_frame(&mut self) -> Result<()> {
        let Some(event) = self.pending_read else {
            return Ok(());
        };
        if !self.accel.queue().is_complete(event) {
            bail!(
                "{}: mask read-back has not completed; finish the queue first",
                self.core.title()
            );
        }
        self.pending_read = None;
        let pixels = self
            .readback
            .lock()
            .map_err(|_| anyhow!("read-back buffer lock poisoned"))?
            .clone();
        let mask = Frame::mono(self.output.width(), self.output.height(), pixels)?;
        self.core.store_mask(mask);
        Ok(())
    }

    fn source_frame(&self) -> Option<&Frame> {
        self.core.source_frame()
    }

    fn intermediate_frame(&self) -> Option<&Frame> {
        self.core.intermediate_frame()
    }

    fn final_frame(&self) -> Option<&Frame> {
        self.core.mask()
    }

    fn stats(&self) -> &WorkerStats {
        self.core.stats()
    }

    fn deinit(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{available_platforms, HostQueue, WorkGroupSize};
    use crate::estimator::{MogEstimator, FOREGROUND};
    use crate::worker::tests::settings;
    use crate::worker::SyncWorker;

    fn context(group: WorkGroupSize) -> Result<AccelContext> {
        let device = available_platforms()[0].devices[0].clone();
        Ok(AccelContext::with_queue(
            device,
            Arc::new(HostQueue::new("test")?),
            group,
        ))
    }

    #[test]
    fn mask_updates_only_after_finish() -> Result<()> {
        let accel = context(WorkGroupSize::new(3, 2)?)?;
        let mut worker = OffloadWorker::new(&settings("stub://cam?width=10&height=7"), accel.clone())?;
        assert!(worker.grab_frame());
        worker.process_frame()?;
        assert!(worker.final_frame().is_none());
        assert!(worker.finish_frame().is_err());

        accel.queue().finish()?;
        worker.finish_frame()?;
        let mask = worker.final_frame().unwrap();
        assert_eq!((mask.width(), mask.height()), (10, 7));
        assert_eq!(worker.stats().frames_processed, 1);
        Ok(())
    }

    #[test]
    fn matches_the_synchronous_estimator() -> Result<()> {
        let identifier = "stub://cam?width=12&height=9&seed=3";
        let accel = context(WorkGroupSize::new(5, 4)?)?;
        let mut offload = OffloadWorker::new(&settings(identifier), accel.clone())?;
        let mut sync = SyncWorker::new(&settings(identifier))?;

        for _ in 0..6 {
            assert!(offload.grab_frame());
            assert!(sync.grab_frame());
            offload.process_frame()?;
            sync.process_frame()?;
            accel.queue().finish()?;
            offload.finish_frame()?;
            assert_eq!(
                offload.final_frame().unwrap().data(),
                sync.final_frame().unwrap().data()
            );
        }
        Ok(())
    }

    #[test]
    fn configured_tuning_reaches_the_model() -> Result<()> {
        let accel = context(WorkGroupSize::default())?;
        let mut stream = settings("stub://cam?width=4&height=4");
        stream.tuning.variance_threshold = 0.0;
        let worker = OffloadWorker::new(&stream, accel)?;
        let model = worker.model.lock().unwrap();
        assert_eq!(model.params().variance_threshold(), 0.0);

        // Nothing ever matches with a zero threshold.
        let mut reference = MogEstimator::new(1, 1, *model.params())?;
        reference.apply(&Frame::mono(1, 1, vec![50])?, -1.0)?;
        let mask = reference.apply(&Frame::mono(1, 1, vec![50])?, -1.0)?;
        assert_eq!(mask.data(), &[FOREGROUND]);
        Ok(())
    }
}
