//! Source, preprocessing and frame slots shared by both pipeline strategies.

use anyhow::{bail, Result};

use super::{StreamSettings, WorkerState, WorkerStats};
use crate::frame::{Frame, FrameDescriptor};
use crate::ingest::CaptureSource;
use crate::preprocess::PreprocessMode;

pub(crate) struct StreamCore {
    title: String,
    source: CaptureSource,
    descriptor: FrameDescriptor,
    mode: PreprocessMode,
    keep_intermediate: bool,
    pub(crate) learning_rate: f32,
    state: WorkerState,
    stats: WorkerStats,
    source_frame: Option<Frame>,
    intermediate_frame: Option<Frame>,
    mask: Option<Frame>,
}

impl StreamCore {
    /// Open the source and fix the preprocessing mode.
    ///
    /// A source that fails to open or reports an unusable format makes the
    /// whole stream fail; the source is released on the way out.
    pub(crate) fn open(settings: &StreamSettings) -> Result<Self> {
        let mut source = CaptureSource::new(&settings.identifier);
        source.init()?;
        let Some(descriptor) = source.describe() else {
            bail!("capture source '{}' reported no format", settings.identifier);
        };
        let mode = PreprocessMode::select(&descriptor, &settings.bayer)?;
        log::info!(
            "{}: {} ({}x{}, {} channel(s)), preprocessing {}",
            settings.title,
            settings.identifier,
            descriptor.width,
            descriptor.height,
            descriptor.channels,
            mode
        );
        Ok(Self {
            title: settings.title.clone(),
            source,
            descriptor,
            mode,
            keep_intermediate: settings.show_intermediate,
            learning_rate: settings.learning_rate,
            state: WorkerState::Ready,
            stats: WorkerStats::default(),
            source_frame: None,
            intermediate_frame: None,
            mask: None,
        })
    }

    pub(crate) fn title(&self) -> &str {
        &self.title
    }

    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }

    pub(crate) fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub(crate) fn grab(&mut self) -> bool {
        if self.state == WorkerState::Closed {
            return false;
        }
        match self.source.grab() {
            Some(frame) => {
                self.source_frame = Some(frame);
                self.stats.frames_grabbed += 1;
                self.state = WorkerState::Grabbed;
                true
            }
            None => {
                self.stats.grab_failures += 1;
                self.state = WorkerState::Idle;
                false
            }
        }
    }

    /// Single-channel estimator input for the frame grabbed this cycle.
    ///
    /// Fails unless the last grab succeeded and the frame has not been
    /// processed yet.
    pub(crate) fn estimator_input(&mut self) -> Result<Frame> {
        if self.state != WorkerState::Grabbed {
            bail!(
                "{}: process_frame called in state {:?}; a successful grab is required",
                self.title,
                self.state
            );
        }
        let Some(frame) = self.source_frame.as_ref() else {
            bail!("{}: no source frame to process", self.title);
        };
        let input = match self.mode.apply(frame)? {
            Some(converted) => converted,
            None => frame.clone(),
        };
        if self.keep_intermediate {
            self.intermediate_frame = Some(input.clone());
        }
        self.state = WorkerState::Processed;
        Ok(input)
    }

    pub(crate) fn store_mask(&mut self, mask: Frame) {
        self.mask = Some(mask);
        self.stats.frames_processed += 1;
    }

    pub(crate) fn source_frame(&self) -> Option<&Frame> {
        self.source_frame.as_ref()
    }

    pub(crate) fn intermediate_frame(&self) -> Option<&Frame> {
        self.intermediate_frame.as_ref()
    }

    pub(crate) fn mask(&self) -> Option<&Frame> {
        self.mask.as_ref()
    }

    pub(crate) fn close(&mut self) {
        if self.state != WorkerState::Closed {
            self.source.deinit();
            self.state = WorkerState::Closed;
            log::debug!("{}: closed", self.title);
        }
    }
}
