// SPDX-License-Identifier: GPL-3.0-only

//! Video capture device abstraction
//!
//! The capture core talks to hardware only through [`VideoDevice`], a thin
//! mirror of the V4L2 ioctl surface it needs: set format, request / query /
//! queue / dequeue buffers, stream on/off and memory mapping.
//!
//! ```text
//! ┌──────────────────┐
//! │  DeviceSession   │  ← state machine, capture_one()
//! └────────┬─────────┘
//!          │
//! ┌────────┴─────────┐
//! │    BufferPool    │  ← negotiate / allocate / enqueue / dequeue / release
//! └────────┬─────────┘
//!          │
//! ┌────────┴─────────┐
//! │ VideoDevice trait│
//! └───┬──────────┬───┘
//!     │          │
//! ┌───┴────┐ ┌───┴───────┐
//! │  V4L2  │ │ Synthetic │
//! └────────┘ └───────────┘
//! ```

pub mod buffer_pool;
pub mod session;
pub mod synthetic;
pub mod v4l2_mplane;
pub mod v4l2_utils;

pub use buffer_pool::{BufferOwner, BufferPool, CaptureLayout, MappedBuffer};
pub use session::{CaptureOutcome, DeviceSession, FrameInfo, SessionState, SkipReason};
pub use synthetic::{SyntheticBackend, SyntheticConfig, SyntheticStats};
pub use v4l2_mplane::V4l2Backend;

use std::io;

/// Build a V4L2 fourcc code
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// NV12 with luma and chroma in one buffer plane
pub const PIX_FMT_NV12: u32 = fourcc(b"NV12");
/// NV12 with luma and chroma in separate buffer planes
pub const PIX_FMT_NV12M: u32 = fourcc(b"NM12");

/// Render a fourcc code for logging
pub fn fourcc_name(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}

/// Per-plane format details reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneFormat {
    /// Row stride in bytes (0 when the driver leaves it unspecified)
    pub bytes_per_line: u32,
    /// Bytes the driver needs for this plane
    pub size_image: u32,
}

/// Format the driver actually granted, read back after set-format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub planes: Vec<PlaneFormat>,
}

/// Location of one buffer plane inside the device's mappable memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub length: u32,
    pub mem_offset: u32,
}

/// A plane mapped into process memory; unmapped on drop
pub trait PlaneMapping: Send {
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Control surface of an open multi-planar capture device
///
/// Dropping the device closes its handle.
pub trait VideoDevice: Send {
    /// Request an NV12 format and return what the driver granted
    fn set_format(&mut self, width: u32, height: u32) -> io::Result<GrantedFormat>;

    /// Request `count` mmap buffers; returns the count the driver granted
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Plane lengths and mmap offsets of buffer `index`
    fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneInfo>>;

    /// Map one plane into process memory
    fn map_plane(&mut self, plane: &PlaneInfo) -> io::Result<Box<dyn PlaneMapping>>;

    /// Hand buffer `index` to the kernel
    fn queue_buffer(&mut self, index: u32, num_planes: usize) -> io::Result<()>;

    /// Reclaim a filled buffer; `Ok(None)` when nothing is ready yet
    fn dequeue_buffer(&mut self, num_planes: usize) -> io::Result<Option<u32>>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Return all buffers to the driver (request count 0)
    fn release_buffers(&mut self) -> io::Result<()>;
}

/// Opens video devices by path
pub trait VideoBackend: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Box<dyn VideoDevice>>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_codes() {
        assert_eq!(PIX_FMT_NV12, 0x3231_564e);
        assert_eq!(fourcc_name(PIX_FMT_NV12), "NV12");
        assert_eq!(fourcc_name(PIX_FMT_NV12M), "NM12");
    }
}
