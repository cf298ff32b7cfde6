//! Frame-grabber bus variant for `.ccf` camera configuration files.
//!
//! Acquisition through a frame-grabber board needs the vendor SDK, which this
//! build does not link. `init` validates the camera configuration file and
//! then reports the variant as unavailable, so the stream is excluded like any
//! other unreachable source.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::frame::{Frame, FrameDescriptor};

pub struct BusSource {
    config_path: PathBuf,
}

impl BusSource {
    pub fn new(identifier: &str) -> Self {
        Self {
            config_path: PathBuf::from(identifier),
        }
    }

    pub fn init(&mut self) -> Result<FrameDescriptor> {
        if !self.config_path.is_file() {
            bail!(
                "camera configuration file {} not found",
                self.config_path.display()
            );
        }
        bail!(
            "frame-grabber capture for {} is not supported on this platform",
            self.config_path.display()
        )
    }

    /// Nothing is held open, so there is nothing to release.
    pub fn deinit(&mut self) {}

    pub fn grab(&mut self) -> Result<Option<Frame>> {
        Ok(None)
    }
}
