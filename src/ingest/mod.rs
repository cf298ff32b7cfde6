//! Capture sources.
//!
//! A `CaptureSource` wraps one of two variants, chosen once from the source
//! identifier when the stream is built:
//! - identifiers ending in `.ccf` select the frame-grabber bus variant
//! - anything else selects the generic variant (synthetic `stub://` scenes,
//!   image sequences, V4L2 device indices, video files)
//!
//! Every source follows the same lifecycle: `init` opens the source and fixes
//! its `FrameDescriptor`, `grab` blocks for the next frame, `deinit` releases
//! everything and may be called any number of times.
//!
//! A failed grab is not an error for the caller: it means "no new frame this
//! cycle". Frames that do not match the descriptor reported at `init` are
//! dropped at this layer, so downstream stages can rely on stable geometry.

mod bus;
#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
mod generic;
mod sequence;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use anyhow::{Context, Result};

use crate::frame::{Frame, FrameDescriptor};

pub use bus::BusSource;
pub use generic::{GenericKind, GenericSource};

/// Identifier suffix that selects the frame-grabber bus variant.
pub const BUS_CONFIG_SUFFIX: &str = ".ccf";

/// Which capture variant serves an identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceVariant {
    Generic,
    Bus,
}

impl SourceVariant {
    pub fn for_identifier(identifier: &str) -> Self {
        if identifier
            .trim()
            .to_ascii_lowercase()
            .ends_with(BUS_CONFIG_SUFFIX)
        {
            SourceVariant::Bus
        } else {
            SourceVariant::Generic
        }
    }
}

/// Counters for one source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub grab_failures: u64,
    pub frames_rejected: u64,
}

/// A frame producer with a fixed format.
pub struct CaptureSource {
    identifier: String,
    backend: SourceBackend,
    descriptor: Option<FrameDescriptor>,
    stats: SourceStats,
}

enum SourceBackend {
    Generic(GenericSource),
    Bus(BusSource),
}

impl CaptureSource {
    /// Pick the variant for `identifier`. Nothing is opened until `init`.
    pub fn new(identifier: &str) -> Self {
        let identifier = identifier.trim().to_string();
        let backend = match SourceVariant::for_identifier(&identifier) {
            SourceVariant::Bus => SourceBackend::Bus(BusSource::new(&identifier)),
            SourceVariant::Generic => SourceBackend::Generic(GenericSource::new(&identifier)),
        };
        Self {
            identifier,
            backend,
            descriptor: None,
            stats: SourceStats::default(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn variant(&self) -> SourceVariant {
        match self.backend {
            SourceBackend::Generic(_) => SourceVariant::Generic,
            SourceBackend::Bus(_) => SourceVariant::Bus,
        }
    }

    /// Open the source and fix its descriptor.
    ///
    /// On failure the source is left deinitialized; only `deinit` may follow.
    pub fn init(&mut self) -> Result<()> {
        let opened = match &mut self.backend {
            SourceBackend::Generic(source) => source.init(),
            SourceBackend::Bus(source) => source.init(),
        }
        .and_then(|descriptor| {
            descriptor.validate()?;
            Ok(descriptor)
        })
        .with_context(|| format!("failed to open capture source '{}'", self.identifier));

        match opened {
            Ok(descriptor) => {
                log::info!(
                    "CaptureSource: opened {} ({}x{}, {} channel(s), {} bit{})",
                    self.identifier,
                    descriptor.width,
                    descriptor.height,
                    descriptor.channels,
                    descriptor.pixel_depth,
                    if descriptor.needs_bayer { ", bayer" } else { "" }
                );
                self.descriptor = Some(descriptor);
                Ok(())
            }
            Err(err) => {
                self.deinit();
                Err(err)
            }
        }
    }

    /// Release all resources. Safe before `init`, after a failed `init`, and
    /// when called repeatedly.
    pub fn deinit(&mut self) {
        match &mut self.backend {
            SourceBackend::Generic(source) => source.deinit(),
            SourceBackend::Bus(source) => source.deinit(),
        }
        self.descriptor = None;
    }

    /// Block for the next frame. `None` means no new data this cycle.
    pub fn grab(&mut self) -> Option<Frame> {
        let descriptor = self.descriptor?;
        let grabbed = match &mut self.backend {
            SourceBackend::Generic(source) => source.grab(),
            SourceBackend::Bus(source) => source.grab(),
        };
        match grabbed {
            Ok(Some(frame)) if descriptor.matches(&frame) => {
                self.stats.frames_captured += 1;
                Some(frame)
            }
            Ok(Some(frame)) => {
                self.stats.frames_rejected += 1;
                log::warn!(
                    "CaptureSource: {} delivered {}x{}x{} frame, expected {}x{}x{}; dropped",
                    self.identifier,
                    frame.width(),
                    frame.height(),
                    frame.channels(),
                    descriptor.width,
                    descriptor.height,
                    descriptor.channels
                );
                None
            }
            Ok(None) => {
                self.stats.grab_failures += 1;
                log::debug!("CaptureSource: {} has no frame this cycle", self.identifier);
                None
            }
            Err(err) => {
                self.stats.grab_failures += 1;
                log::debug!("CaptureSource: {} grab failed: {:#}", self.identifier, err);
                None
            }
        }
    }

    /// Format of the frames this source delivers; `None` until `init` succeeds.
    pub fn describe(&self) -> Option<FrameDescriptor> {
        self.descriptor
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.deinit();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
