//! Device-side memory objects.
//!
//! A `DeviceImage` is a single-plane 8-bit image owned by one stream. Handles
//! are cheap clones of the same storage so queued commands can capture them.

use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug)]
pub struct DeviceImage {
    width: u32,
    height: u32,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl DeviceImage {
    pub(crate) fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("device image must be non-empty (got {}x{})", width, height);
        }
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("device image {}x{} is too large", width, height))?;
        Ok(Self {
            width,
            height,
            bytes: Arc::new(Mutex::new(vec![0u8; len])),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host to device copy. `data` must cover the whole image.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut bytes = self.lock()?;
        if data.len() != bytes.len() {
            bail!(
                "device image write of {} bytes does not fit {}x{}",
                data.len(),
                self.width,
                self.height
            );
        }
        bytes.copy_from_slice(data);
        Ok(())
    }

    /// Device to host copy.
    pub fn read_into(&self, dst: &mut [u8]) -> Result<()> {
        let bytes = self.lock()?;
        if dst.len() != bytes.len() {
            bail!(
                "device image read into {} bytes does not fit {}x{}",
                dst.len(),
                self.width,
                self.height
            );
        }
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Vec<u8>>> {
        self.bytes
            .lock()
            .map_err(|_| anyhow!("device image lock poisoned"))
    }
}
