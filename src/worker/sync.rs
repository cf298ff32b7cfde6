//! Synchronous pipeline: the estimator runs inside `process_frame`.

use anyhow::Result;

use super::stream::StreamCore;
use super::{PipelineStrategy, StreamSettings, Worker, WorkerState, WorkerStats};
use crate::estimator::MogEstimator;
use crate::frame::Frame;

pub struct SyncWorker {
    core: StreamCore,
    estimator: MogEstimator,
}

impl SyncWorker {
    pub fn new(settings: &StreamSettings) -> Result<Self> {
        let params = settings.params(PipelineStrategy::Sync)?;
        let core = StreamCore::open(settings)?;
        let descriptor = core.descriptor();
        Ok(Self {
            estimator: MogEstimator::new(descriptor.width, descriptor.height, params)?,
            core,
        })
    }
}

impl Worker for SyncWorker {
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
        let input = self.core.estimator_input()?;
        let mask = self.estimator.apply(&input, self.core.learning_rate)?;
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
    use crate::worker::tests::settings;

    #[test]
    fn process_requires_a_successful_grab() -> Result<()> {
        let mut worker = SyncWorker::new(&settings("stub://cam?width=8&height=6&drop=1"))?;
        assert_eq!(worker.state(), WorkerState::Ready);
        assert!(worker.process_frame().is_err());

        assert!(!worker.grab_frame());
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.process_frame().is_err());
        assert!(worker.final_frame().is_none());

        assert!(worker.grab_frame());
        worker.process_frame()?;
        assert_eq!(worker.state(), WorkerState::Processed);
        assert!(worker.process_frame().is_err());

        let mask = worker.final_frame().unwrap();
        assert_eq!((mask.width(), mask.height(), mask.channels()), (8, 6, 1));
        assert_eq!(worker.stats().frames_processed, 1);
        assert_eq!(worker.stats().grab_failures, 1);
        Ok(())
    }

    #[test]
    fn color_stream_keeps_mono_intermediate_when_asked() -> Result<()> {
        let mut stream = settings("stub://cam?width=8&height=6&channels=3");
        stream.show_intermediate = true;
        let mut worker = SyncWorker::new(&stream)?;
        assert!(worker.grab_frame());
        worker.process_frame()?;
        assert_eq!(worker.source_frame().unwrap().channels(), 3);
        assert_eq!(worker.intermediate_frame().unwrap().channels(), 1);

        let mut quiet = SyncWorker::new(&settings("stub://cam?width=8&height=6&channels=3"))?;
        assert!(quiet.grab_frame());
        quiet.process_frame()?;
        assert!(quiet.intermediate_frame().is_none());
        Ok(())
    }

    #[test]
    fn bad_pattern_fails_only_mosaic_streams() {
        let mut mosaic = settings("stub://cam?width=8&height=6&bayer=1");
        mosaic.bayer = "XY".to_string();
        let err = SyncWorker::new(&mosaic).err().unwrap();
        assert!(err.to_string().contains("General.Bayer"));

        let mut plain = settings("stub://cam?width=8&height=6");
        plain.bayer = "XY".to_string();
        assert!(SyncWorker::new(&plain).is_ok());
    }

    #[test]
    fn deinit_is_idempotent() -> Result<()> {
        let mut worker = SyncWorker::new(&settings("stub://cam?width=4&height=4"))?;
        worker.deinit();
        worker.deinit();
        assert_eq!(worker.state(), WorkerState::Closed);
        assert!(!worker.grab_frame());
        Ok(())
    }
}
