//! V4L2 camera source for numeric device identifiers.
//!
//! Identifier `N` opens `/dev/videoN` and requests packed RGB (`RGB3`) at the
//! device's current resolution. The negotiated size becomes the descriptor.

use anyhow::{bail, Context, Result};
use ouroboros::self_referencing;

use crate::frame::{Frame, FrameDescriptor, PIXEL_DEPTH_8U};

const CAPTURE_BUFFERS: u32 = 4;

pub(crate) struct V4l2Source {
    device_path: String,
    state: V4l2State,
    descriptor: FrameDescriptor,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub(crate) fn open(index: u32) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device_path = format!("/dev/video{}", index);
        let device = v4l::Device::new(index as usize)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            bail!(
                "{} does not deliver packed RGB (negotiated {})",
                device_path,
                format.fourcc
            );
        }

        let descriptor = FrameDescriptor {
            width: format.width,
            height: format.height,
            channels: 3,
            pixel_depth: PIXEL_DEPTH_8U,
            needs_bayer: false,
        };

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, CAPTURE_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: connected to {} ({}x{})",
            device_path,
            descriptor.width,
            descriptor.height
        );
        Ok(Self {
            device_path,
            state,
            descriptor,
        })
    }

    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    pub(crate) fn grab(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (buf, _meta) = self
            .state
            .with_mut(|fields| fields.stream.next())
            .with_context(|| format!("capture v4l2 frame from {}", self.device_path))?;
        let expected = self.descriptor.byte_len()?;
        let pixels = buf
            .get(..expected)
            .context("v4l2 buffer shorter than the negotiated frame")?
            .to_vec();
        Frame::new(self.descriptor.width, self.descriptor.height, 3, pixels).map(Some)
    }
}
