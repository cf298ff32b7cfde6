//! Image-sequence source.
//!
//! A directory is played back in file-name order; a single image file is a
//! one-frame stream. The channel count is fixed by the first image: grayscale
//! images give a mono stream, everything else is converted to RGB.

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::frame::{Frame, FrameDescriptor, PIXEL_DEPTH_8U};
use crate::preprocess::color_to_mono;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub(crate) fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

pub(crate) struct SequenceSource {
    root: PathBuf,
    pending: VecDeque<PathBuf>,
    first: Option<Frame>,
    descriptor: FrameDescriptor,
}

impl SequenceSource {
    pub(crate) fn open(root: &Path) -> Result<Self> {
        let mut pending: VecDeque<PathBuf> = if root.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(root)
                .with_context(|| format!("failed to list image directory {}", root.display()))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.is_file() && is_image_path(path))
                .collect();
            entries.sort();
            entries.into()
        } else {
            VecDeque::from(vec![root.to_path_buf()])
        };

        let first_path = pending
            .pop_front()
            .ok_or_else(|| anyhow!("no images found in {}", root.display()))?;
        let first_image = decode(&first_path)?;
        let channels = if first_image.color().has_color() { 3 } else { 1 };
        let first = to_frame(first_image, channels)?;
        let descriptor = FrameDescriptor {
            width: first.width(),
            height: first.height(),
            channels,
            pixel_depth: PIXEL_DEPTH_8U,
            needs_bayer: false,
        };

        log::info!(
            "SequenceSource: connected to {} ({} image(s))",
            root.display(),
            pending.len() + 1
        );
        Ok(Self {
            root: root.to_path_buf(),
            pending,
            first: Some(first),
            descriptor,
        })
    }

    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    pub(crate) fn grab(&mut self) -> Result<Option<Frame>> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }
        let Some(path) = self.pending.pop_front() else {
            log::debug!("SequenceSource: {} exhausted", self.root.display());
            return Ok(None);
        };
        let image = decode(&path)?;
        to_frame(image, self.descriptor.channels).map(Some)
    }
}

fn decode(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed to decode image {}", path.display()))
}

/// Color images in a mono stream go through the same luma conversion as
/// live color sources.
fn to_frame(image: DynamicImage, channels: u8) -> Result<Frame> {
    if channels == 1 && !image.color().has_color() {
        let gray = image.into_luma8();
        return Frame::mono(gray.width(), gray.height(), gray.into_raw());
    }
    let rgb = image.into_rgb8();
    let frame = Frame::new(rgb.width(), rgb.height(), 3, rgb.into_raw())?;
    if channels == 1 {
        color_to_mono(&frame)
    } else {
        Ok(frame)
    }
}
