//! Presentation of per-stream results.
//!
//! Each cycle the scheduler hands every displayable frame to a `Presenter`
//! under a channel name: `<title>` for the mask, `<title> source` for the
//! captured frame and `<title> intermediate frame` for the estimator input.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::frame::Frame;

pub trait Presenter {
    fn present(&mut self, channel: &str, frame: &Frame) -> Result<()>;
}

/// Logs a one-line summary per frame at debug level.
#[derive(Default)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn present(&mut self, channel: &str, frame: &Frame) -> Result<()> {
        log::debug!(
            "[{}] {}x{}x{}, nonzero {:.1}%",
            channel,
            frame.width(),
            frame.height(),
            frame.channels(),
            frame.nonzero_ratio() * 100.0
        );
        Ok(())
    }
}

/// Writes the latest frame of every channel as a PNG, overwriting the
/// previous one.
pub struct SnapshotPresenter {
    dir: PathBuf,
    paths: HashMap<String, PathBuf>,
}

impl SnapshotPresenter {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            paths: HashMap::new(),
        })
    }

    /// File used for `channel`.
    pub fn path_for(&mut self, channel: &str) -> &Path {
        let dir = &self.dir;
        self.paths.entry(channel.to_string()).or_insert_with(|| {
            let stem: String = channel
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect();
            dir.join(format!("{}.png", stem))
        })
    }
}

impl Presenter for SnapshotPresenter {
    fn present(&mut self, channel: &str, frame: &Frame) -> Result<()> {
        let (width, height) = (frame.width(), frame.height());
        let pixels = frame.data().to_vec();
        let image = match frame.channels() {
            1 => image::GrayImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageLuma8),
            3 => image::RgbImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageRgb8),
            other => return Err(anyhow!("cannot snapshot a {}-channel frame", other)),
        }
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;

        let path = self.path_for(channel).to_path_buf();
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("write snapshot {}", path.display()))
    }
}
