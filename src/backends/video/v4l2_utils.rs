// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 device discovery
//!
//! Lists `/dev/video*` nodes and reports which of them offer multi-planar
//! capture, so a device path can be picked for the engine.

use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

/// VIDIOC_QUERYCAP ioctl number
const VIDIOC_QUERYCAP: libc::c_ulong = 0x80685600;

/// V4L2_CAP_VIDEO_CAPTURE_MPLANE
const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
/// V4L2_CAP_DEVICE_CAPS: `device_caps` is valid
const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

/// V4L2 capability structure for VIDIOC_QUERYCAP ioctl
#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

impl V4l2Capability {
    /// Capabilities of this node rather than the whole physical device
    fn node_caps(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

fn query_v4l2_cap(fd: RawFd) -> Option<V4l2Capability> {
    let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::ioctl(fd, VIDIOC_QUERYCAP as _, &mut cap as *mut V4l2Capability) };
    if result < 0 { None } else { Some(cap) }
}

/// A discovered video node
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    pub path: String,
    /// Card name reported by the driver
    pub card: String,
    pub driver: String,
    pub bus_info: String,
    /// Node supports multi-planar capture
    pub multiplanar: bool,
}

/// Whether the node at `path` advertises multi-planar capture
pub fn supports_mplane_capture(path: &str) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    query_v4l2_cap(file.as_raw_fd())
        .map(|cap| cap.node_caps() & V4L2_CAP_VIDEO_CAPTURE_MPLANE != 0)
        .unwrap_or(false)
}

/// Enumerate video nodes, multi-planar capture nodes first
pub fn list_capture_devices() -> Vec<DeviceInfo> {
    let mut devices: Vec<DeviceInfo> = v4l::context::enum_devices()
        .into_iter()
        .filter_map(|node| {
            let path = node.path().to_string_lossy().to_string();
            let device = match v4l::Device::with_path(&path) {
                Ok(device) => device,
                Err(e) => {
                    debug!(path = %path, error = %e, "Skipping unopenable video node");
                    return None;
                }
            };
            let caps = device.query_caps().ok()?;
            let info = DeviceInfo {
                multiplanar: supports_mplane_capture(&path),
                card: caps.card,
                driver: caps.driver,
                bus_info: caps.bus,
                path,
            };
            debug!(path = %info.path, card = %info.card, mplane = info.multiplanar, "Found video node");
            Some(info)
        })
        .collect();

    devices.sort_by(|a, b| b.multiplanar.cmp(&a.multiplanar).then_with(|| a.path.cmp(&b.path)));
    devices
}
