//! Accelerator plumbing for the offloaded pipeline.
//!
//! The pipeline talks to an accelerator only through an `AccelContext`: the
//! selected device, a shared `CommandQueue`, the work-group size used to tile
//! compute dispatches, and image allocation. The context is created once at
//! start-up and handed to every offloaded stream.

mod memory;
mod queue;

pub use memory::DeviceImage;
pub use queue::{Command, CommandKind, CommandQueue, Event, HostQueue};

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::io::{BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_WORK_GROUP: u32 = 16;

// ----------------------------------------------------------------------------
// Device selection
// ----------------------------------------------------------------------------

/// `General.DeviceSelection`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    Gpu,
    Cpu,
    /// Ask on the terminal.
    Pick,
    #[default]
    Default,
}

impl FromStr for DeviceSelection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceSelection::Gpu),
            "cpu" => Ok(DeviceSelection::Cpu),
            "pick" => Ok(DeviceSelection::Pick),
            "default" => Ok(DeviceSelection::Default),
            other => Err(anyhow!(
                "General.DeviceSelection must be one of gpu, cpu, pick, default (got '{}')",
                other
            )),
        }
    }
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceSelection::Gpu => "gpu",
            DeviceSelection::Cpu => "cpu",
            DeviceSelection::Pick => "pick",
            DeviceSelection::Default => "default",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub device_type: DeviceType,
    pub compute_units: usize,
    pub platform: String,
}

#[derive(Clone, Debug)]
pub struct Platform {
    pub name: String,
    pub version: String,
    pub devices: Vec<DeviceInfo>,
}

/// Platforms available to this build.
///
/// Only the host platform exists: one CPU device backed by a worker thread.
pub fn available_platforms() -> Vec<Platform> {
    let compute_units = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let platform = "host".to_string();
    vec![Platform {
        name: platform.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        devices: vec![DeviceInfo {
            name: format!("{} host cpu", std::env::consts::ARCH),
            device_type: DeviceType::Cpu,
            compute_units,
            platform,
        }],
    }]
}

/// Human-readable platform and device listing.
pub fn describe_platforms(platforms: &[Platform]) -> String {
    let mut out = String::new();
    let mut index = 0;
    for platform in platforms {
        out.push_str(&format!("platform {} (version {})\n", platform.name, platform.version));
        for device in &platform.devices {
            out.push_str(&format!(
                "  [{}] {} ({:?}, {} compute units)\n",
                index, device.name, device.device_type, device.compute_units
            ));
            index += 1;
        }
    }
    out
}

/// Resolve a selection against the enumerated platforms.
///
/// `pick` is called with every device in enumeration order and must return an
/// index into that list.
pub fn select_device(
    platforms: &[Platform],
    selection: DeviceSelection,
    pick: impl FnOnce(&[DeviceInfo]) -> Result<usize>,
) -> Result<DeviceInfo> {
    if platforms.is_empty() {
        bail!("no accelerator platform available");
    }
    let devices: Vec<DeviceInfo> = platforms
        .iter()
        .flat_map(|p| p.devices.iter().cloned())
        .collect();
    if devices.is_empty() {
        bail!("no accelerator device available");
    }

    let wanted = match selection {
        DeviceSelection::Gpu => Some(DeviceType::Gpu),
        DeviceSelection::Cpu => Some(DeviceType::Cpu),
        DeviceSelection::Default => None,
        DeviceSelection::Pick => {
            let index = pick(&devices)?;
            return devices
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow!("device index {} out of range", index));
        }
    };

    match wanted {
        None => Ok(devices[0].clone()),
        Some(kind) => devices
            .into_iter()
            .find(|d| d.device_type == kind)
            .ok_or_else(|| anyhow!("no {} device", selection)),
    }
}

/// Interactive picker used for `DeviceSelection::Pick`.
pub fn pick_from_terminal(devices: &[DeviceInfo]) -> Result<usize> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (index, device) in devices.iter().enumerate() {
        writeln!(out, "[{}] {} ({})", index, device.name, device.platform)?;
    }
    write!(out, "select device: ")?;
    out.flush()?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read device selection")?;
    line.trim()
        .parse()
        .with_context(|| format!("invalid device index '{}'", line.trim()))
}

// ----------------------------------------------------------------------------
// Work groups
// ----------------------------------------------------------------------------

/// `WorkGroupSize.X` x `WorkGroupSize.Y`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkGroupSize {
    x: u32,
    y: u32,
}

impl WorkGroupSize {
    pub fn new(x: i64, y: i64) -> Result<Self> {
        if x <= 0 || y <= 0 {
            bail!(
                "WorkGroupSize.X and WorkGroupSize.Y must be greater than zero (got {}x{})",
                x,
                y
            );
        }
        let x = u32::try_from(x).context("WorkGroupSize.X is too large")?;
        let y = u32::try_from(y).context("WorkGroupSize.Y is too large")?;
        Ok(Self { x, y })
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    /// Visit every tile covering a `width` x `height` grid in row-major order.
    ///
    /// The callback gets the tile's column and row ranges; edge tiles are
    /// clipped to the grid.
    pub fn for_each_tile(
        &self,
        width: u32,
        height: u32,
        mut f: impl FnMut(std::ops::Range<u32>, std::ops::Range<u32>),
    ) {
        let mut y0 = 0;
        while y0 < height {
            let y1 = y0.saturating_add(self.y).min(height);
            let mut x0 = 0;
            while x0 < width {
                let x1 = x0.saturating_add(self.x).min(width);
                f(x0..x1, y0..y1);
                x0 = x1;
            }
            y0 = y1;
        }
    }
}

impl Default for WorkGroupSize {
    fn default() -> Self {
        Self {
            x: DEFAULT_WORK_GROUP,
            y: DEFAULT_WORK_GROUP,
        }
    }
}

// ----------------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------------

/// Device, queue and dispatch geometry shared by all offloaded streams.
#[derive(Clone)]
pub struct AccelContext {
    device: DeviceInfo,
    queue: Arc<dyn CommandQueue>,
    work_group: WorkGroupSize,
}

impl AccelContext {
    /// Enumerate, select and open a queue on the chosen device.
    pub fn create(selection: DeviceSelection, work_group: WorkGroupSize) -> Result<Self> {
        let platforms = available_platforms();
        let device = select_device(&platforms, selection, pick_from_terminal)?;
        let queue = HostQueue::new(&device.name).context("failed to create command queue")?;
        log::info!(
            "accelerator: {} on platform {} ({} compute units), work group {}x{}",
            device.name,
            device.platform,
            device.compute_units,
            work_group.x(),
            work_group.y()
        );
        Ok(Self::with_queue(device, Arc::new(queue), work_group))
    }

    /// Build a context around an existing queue.
    pub fn with_queue(
        device: DeviceInfo,
        queue: Arc<dyn CommandQueue>,
        work_group: WorkGroupSize,
    ) -> Self {
        Self {
            device,
            queue,
            work_group,
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn queue(&self) -> &Arc<dyn CommandQueue> {
        &self.queue
    }

    pub fn work_group(&self) -> WorkGroupSize {
        self.work_group
    }

    pub fn create_image(&self, width: u32, height: u32) -> Result<DeviceImage> {
        DeviceImage::new(width, height)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn no_pick(_: &[DeviceInfo]) -> Result<usize> {
        Err(anyhow!("picker should not run"))
    }

    #[test]
    fn parses_selection_names() -> Result<()> {
        assert_eq!("GPU".parse::<DeviceSelection>()?, DeviceSelection::Gpu);
        assert_eq!("pick".parse::<DeviceSelection>()?, DeviceSelection::Pick);
        assert_eq!("default".parse::<DeviceSelection>()?, DeviceSelection::Default);
        assert!("".parse::<DeviceSelection>().is_err());
        assert!("  ".parse::<DeviceSelection>().is_err());
        let err = "tpu".parse::<DeviceSelection>().unwrap_err();
        assert!(err.to_string().contains("General.DeviceSelection"));
        Ok(())
    }

    #[test]
    fn host_platform_has_a_cpu() -> Result<()> {
        let platforms = available_platforms();
        let device = select_device(&platforms, DeviceSelection::Cpu, no_pick)?;
        assert_eq!(device.device_type, DeviceType::Cpu);
        assert!(device.compute_units >= 1);
        assert_eq!(
            select_device(&platforms, DeviceSelection::Default, no_pick)?,
            device
        );
        assert!(describe_platforms(&platforms).contains("[0]"));
        Ok(())
    }

    #[test]
    fn gpu_selection_fails_without_gpu() {
        let err = select_device(&available_platforms(), DeviceSelection::Gpu, no_pick).unwrap_err();
        assert!(err.to_string().contains("no gpu device"));
        assert!(select_device(&[], DeviceSelection::Default, no_pick).is_err());
    }

    #[test]
    fn pick_uses_the_returned_index() -> Result<()> {
        let platforms = available_platforms();
        let device = select_device(&platforms, DeviceSelection::Pick, |devices| {
            assert_eq!(devices.len(), 1);
            Ok(0)
        })?;
        assert_eq!(device.platform, "host");
        assert!(select_device(&platforms, DeviceSelection::Pick, |_| Ok(3)).is_err());
        Ok(())
    }

    #[test]
    fn tiles_cover_the_grid_once() -> Result<()> {
        let group = WorkGroupSize::new(4, 3)?;
        let mut covered = vec![0u8; 10 * 7];
        let mut tiles = 0;
        group.for_each_tile(10, 7, |xs, ys| {
            tiles += 1;
            for y in ys {
                for x in xs.clone() {
                    covered[(y * 10 + x) as usize] += 1;
                }
            }
        });
        assert_eq!(tiles, 3 * 3);
        assert!(covered.iter().all(|&c| c == 1));
        Ok(())
    }

    #[test]
    fn work_group_rejects_non_positive() {
        assert!(WorkGroupSize::new(0, 16).is_err());
        assert!(WorkGroupSize::new(16, -1).is_err());
    }
}
