//! Generic capture variant.
//!
//! The identifier decides the backend once, at `init`:
//! - `stub://...`: synthetic scene
//! - all digits: V4L2 device index (feature: ingest-v4l2)
//! - a directory or an image file: image sequence
//! - any other path: video file (feature: ingest-file-ffmpeg)

#[cfg(not(all(feature = "ingest-v4l2", feature = "ingest-file-ffmpeg")))]
use anyhow::anyhow;
use anyhow::Result;
use std::path::{Path, PathBuf};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::sequence::{is_image_path, SequenceSource};
use super::synthetic::{SyntheticSource, STUB_SCHEME};
#[cfg(feature = "ingest-v4l2")]
use super::v4l2::V4l2Source;
use crate::frame::{Frame, FrameDescriptor};

/// What kind of producer a generic identifier names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenericKind {
    Synthetic,
    Device(u32),
    ImageSequence(PathBuf),
    VideoFile(PathBuf),
}

impl GenericKind {
    pub fn classify(identifier: &str) -> Self {
        if identifier.starts_with(STUB_SCHEME) {
            return GenericKind::Synthetic;
        }
        if !identifier.is_empty() && identifier.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = identifier.parse() {
                return GenericKind::Device(index);
            }
        }
        let path = Path::new(identifier);
        if path.is_dir() || is_image_path(path) {
            GenericKind::ImageSequence(path.to_path_buf())
        } else {
            GenericKind::VideoFile(path.to_path_buf())
        }
    }
}

/// Camera, file and synthetic sources.
pub struct GenericSource {
    identifier: String,
    backend: Option<GenericBackend>,
}

enum GenericBackend {
    Synthetic(SyntheticSource),
    Sequence(SequenceSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(V4l2Source),
    #[cfg(feature = "ingest-file-ffmpeg")]
    File(FfmpegFileSource),
}

impl GenericSource {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            backend: None,
        }
    }

    pub fn init(&mut self) -> Result<FrameDescriptor> {
        self.deinit();
        let backend = match GenericKind::classify(&self.identifier) {
            GenericKind::Synthetic => {
                GenericBackend::Synthetic(SyntheticSource::open(&self.identifier)?)
            }
            GenericKind::ImageSequence(path) => {
                GenericBackend::Sequence(SequenceSource::open(&path)?)
            }
            #[cfg(feature = "ingest-v4l2")]
            GenericKind::Device(index) => GenericBackend::Device(V4l2Source::open(index)?),
            #[cfg(not(feature = "ingest-v4l2"))]
            GenericKind::Device(index) => {
                return Err(anyhow!(
                    "camera index {} requires the ingest-v4l2 feature",
                    index
                ))
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            GenericKind::VideoFile(path) => GenericBackend::File(FfmpegFileSource::open(&path)?),
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            GenericKind::VideoFile(path) => {
                return Err(anyhow!(
                    "video file {} requires the ingest-file-ffmpeg feature",
                    path.display()
                ))
            }
        };
        let descriptor = match &backend {
            GenericBackend::Synthetic(source) => source.descriptor(),
            GenericBackend::Sequence(source) => source.descriptor(),
            #[cfg(feature = "ingest-v4l2")]
            GenericBackend::Device(source) => source.descriptor(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            GenericBackend::File(source) => source.descriptor(),
        };
        self.backend = Some(backend);
        Ok(descriptor)
    }

    pub fn deinit(&mut self) {
        if self.backend.take().is_some() {
            log::debug!("GenericSource: closed {}", self.identifier);
        }
    }

    pub fn grab(&mut self) -> Result<Option<Frame>> {
        match self.backend.as_mut() {
            None => Ok(None),
            Some(GenericBackend::Synthetic(source)) => source.grab(),
            Some(GenericBackend::Sequence(source)) => source.grab(),
            #[cfg(feature = "ingest-v4l2")]
            Some(GenericBackend::Device(source)) => source.grab(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Some(GenericBackend::File(source)) => source.grab(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_identifiers() {
        assert_eq!(
            GenericKind::classify("stub://yard?channels=3"),
            GenericKind::Synthetic
        );
        assert_eq!(GenericKind::classify("0"), GenericKind::Device(0));
        assert_eq!(GenericKind::classify("12"), GenericKind::Device(12));
        assert_eq!(
            GenericKind::classify("clips/entrance.webm"),
            GenericKind::VideoFile(PathBuf::from("clips/entrance.webm"))
        );
        assert_eq!(
            GenericKind::classify("still.PNG"),
            GenericKind::ImageSequence(PathBuf::from("still.PNG"))
        );
    }

    #[test]
    fn reinit_replaces_backend() -> Result<()> {
        let mut source = GenericSource::new("stub://cam?width=4&height=4&frames=1");
        source.init()?;
        assert!(source.grab()?.is_some());
        assert!(source.grab()?.is_none());
        source.init()?;
        assert!(source.grab()?.is_some());
        Ok(())
    }
}
