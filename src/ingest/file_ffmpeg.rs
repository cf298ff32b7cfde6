//! Video file source using FFmpeg.
//!
//! Frames are decoded in file order and converted to packed RGB. Reaching the
//! end of the file ends the stream; it is reported as "no frame", not as an
//! error.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::Path;

use crate::frame::{Frame, FrameDescriptor, PIXEL_DEPTH_8U};

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    descriptor: FrameDescriptor,
    draining: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let display = path.display().to_string();
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", display))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let descriptor = FrameDescriptor {
            width: decoder.width(),
            height: decoder.height(),
            channels: 3,
            pixel_depth: PIXEL_DEPTH_8U,
            needs_bayer: false,
        };

        log::info!(
            "FfmpegFileSource: connected to {} ({}x{})",
            display,
            descriptor.width,
            descriptor.height
        );
        Ok(Self {
            path: display,
            input,
            stream_index,
            decoder,
            scaler,
            descriptor,
            draining: false,
        })
    }

    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    pub(crate) fn grab(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();

        if !self.draining {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return convert(&mut self.scaler, &decoded).map(Some);
            }
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                if self.decoder.receive_frame(&mut decoded).is_ok() {
                    return convert(&mut self.scaler, &decoded).map(Some);
                }
            }
            self.decoder.send_eof().context("flush ffmpeg decoder")?;
            self.draining = true;
        }

        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return convert(&mut self.scaler, &decoded).map(Some);
        }
        log::debug!("FfmpegFileSource: {} reached end of file", self.path);
        Ok(None)
    }
}

fn convert(
    scaler: &mut ffmpeg::software::scaling::Context,
    decoded: &ffmpeg::frame::Video,
) -> Result<Frame> {
    let mut rgb_frame = ffmpeg::frame::Video::empty();
    scaler
        .run(decoded, &mut rgb_frame)
        .context("scale frame to RGB")?;
    let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
    Frame::new(width, height, 3, pixels)
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
