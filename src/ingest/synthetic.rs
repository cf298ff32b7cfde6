//! Synthetic scene source for `stub://` identifiers.
//!
//! The identifier's query string shapes the stream:
//!
//! `stub://name?width=64&height=48&channels=3&bayer=1&frames=100&drop=5,9&offline=1&seed=7`
//!
//! - `channels` is 1 (default) or 3; `bayer=1` delivers an RG mosaic on one channel
//! - `frames` ends the stream after that many frames
//! - `drop` lists 1-based grab attempts that come back empty
//! - `offline=1` makes `init` fail as if the source were unreachable
//!
//! The scene is a static gradient with a bright block sweeping across it and a
//! little sensor noise, enough for the estimator to find foreground.

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::frame::{Frame, FrameDescriptor, PIXEL_DEPTH_8U};

pub const STUB_SCHEME: &str = "stub://";

const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;
const BLOCK_STEP: u64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub bayer: bool,
    pub frames: Option<u64>,
    pub drop: Vec<u64>,
    pub offline: bool,
    pub seed: u64,
}

impl SyntheticConfig {
    pub(crate) fn parse(identifier: &str) -> Result<Self> {
        let rest = identifier
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| anyhow!("synthetic identifiers start with {}", STUB_SCHEME))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut config = Self {
            name: name.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            channels: 1,
            bayer: false,
            frames: None,
            drop: Vec::new(),
            offline: false,
            seed: 0,
        };

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub option '{}' has no value", pair))?;
            match key {
                "width" => config.width = parse_number(key, value)?,
                "height" => config.height = parse_number(key, value)?,
                "channels" => config.channels = parse_number(key, value)?,
                "bayer" => config.bayer = parse_flag(value),
                "frames" => config.frames = Some(parse_number(key, value)?),
                "drop" => {
                    config.drop = value
                        .split(',')
                        .map(|entry| entry.trim())
                        .filter(|entry| !entry.is_empty())
                        .map(|entry| parse_number(key, entry))
                        .collect::<Result<_>>()?
                }
                "offline" => config.offline = parse_flag(value),
                "seed" => config.seed = parse_number(key, value)?,
                other => bail!("unknown stub option '{}'", other),
            }
        }
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("stub option {}={} is not a number", key, value))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

pub(crate) struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    grab_attempts: u64,
    frame_count: u64,
}

impl SyntheticSource {
    pub(crate) fn open(identifier: &str) -> Result<Self> {
        let config = SyntheticConfig::parse(identifier)
            .with_context(|| format!("invalid synthetic source '{}'", identifier))?;
        if config.offline {
            bail!("synthetic source {} is offline", config.name);
        }
        log::info!("SyntheticSource: connected to {} (synthetic)", config.name);
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            grab_attempts: 0,
            frame_count: 0,
        })
    }

    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            width: self.config.width,
            height: self.config.height,
            channels: if self.config.bayer {
                1
            } else {
                self.config.channels
            },
            pixel_depth: PIXEL_DEPTH_8U,
            needs_bayer: self.config.bayer,
        }
    }

    pub(crate) fn grab(&mut self) -> Result<Option<Frame>> {
        self.grab_attempts += 1;
        if self.config.drop.contains(&self.grab_attempts) {
            return Ok(None);
        }
        if self
            .config
            .frames
            .is_some_and(|limit| self.frame_count >= limit)
        {
            return Ok(None);
        }
        self.frame_count += 1;

        let desc = self.descriptor();
        let pixels = self.render(&desc);
        Frame::new(desc.width, desc.height, desc.channels, pixels).map(Some)
    }

    /// Render the current scene in the descriptor's layout.
    fn render(&mut self, desc: &FrameDescriptor) -> Vec<u8> {
        let w = desc.width as usize;
        let h = desc.height as usize;
        let block_w = (w / 4).max(1);
        let block_h = (h / 3).max(1);
        let block_x = ((self.frame_count * BLOCK_STEP) % w as u64) as usize;
        let block_y = h.saturating_sub(block_h) / 2;

        let mut pixels = Vec::with_capacity(w * h * desc.channels as usize);
        for y in 0..h {
            for x in 0..w {
                let in_block = x >= block_x
                    && x < block_x + block_w
                    && y >= block_y
                    && y < block_y + block_h;
                let noise: i16 = self.rng.gen_range(-2..=2);
                let base: i16 = if in_block {
                    230
                } else {
                    40 + ((x + y) % 64) as i16
                };
                let rgb = [
                    clamp(base + noise),
                    clamp(base - 10 + noise),
                    clamp(base - 20 + noise),
                ];
                if desc.needs_bayer {
                    // RG mosaic: R G / G B
                    let channel = match (y % 2, x % 2) {
                        (0, 0) => 0,
                        (1, 1) => 2,
                        _ => 1,
                    };
                    pixels.push(rgb[channel]);
                } else if desc.channels == 3 {
                    pixels.extend_from_slice(&rgb);
                } else {
                    pixels.push(rgb[1]);
                }
            }
        }
        pixels
    }
}

fn clamp(value: i16) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_options() -> Result<()> {
        let config =
            SyntheticConfig::parse("stub://front?width=32&height=16&channels=3&frames=9&drop=2,5")?;
        assert_eq!(config.name, "front");
        assert_eq!((config.width, config.height, config.channels), (32, 16, 3));
        assert_eq!(config.frames, Some(9));
        assert_eq!(config.drop, vec![2, 5]);
        assert!(!config.bayer);
        Ok(())
    }

    #[test]
    fn rejects_unknown_options() {
        assert!(SyntheticConfig::parse("stub://front?zoom=2").is_err());
        assert!(SyntheticConfig::parse("stub://front?width=wide").is_err());
        assert!(SyntheticConfig::parse("file.avi").is_err());
    }

    #[test]
    fn bayer_streams_are_single_channel_mosaics() -> Result<()> {
        let mut source = SyntheticSource::open("stub://raw?bayer=1&channels=3&width=8&height=4")?;
        let desc = source.descriptor();
        assert_eq!(desc.channels, 1);
        assert!(desc.needs_bayer);
        let frame = source.grab()?.expect("frame");
        assert_eq!(frame.data().len(), 32);
        Ok(())
    }

    #[test]
    fn stream_ends_after_frame_limit() -> Result<()> {
        let mut source = SyntheticSource::open("stub://short?frames=2&width=4&height=4")?;
        assert!(source.grab()?.is_some());
        assert!(source.grab()?.is_some());
        assert!(source.grab()?.is_none());
        assert_eq!(source.frame_count, 2);
        Ok(())
    }

    #[test]
    fn offline_sources_fail_to_open() {
        assert!(SyntheticSource::open("stub://dead?offline=1").is_err());
    }
}
