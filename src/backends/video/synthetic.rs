// SPDX-License-Identifier: GPL-3.0-only

//! In-memory capture device
//!
//! Behaves like a multi-planar NV12 driver: grants formats, hands out
//! mappable buffers, cycles them through a queue while streaming. Driver
//! quirks (stride padding, fewer buffers, packed single-plane buffers) and
//! failures are configurable, and every open device reports into shared
//! [`SyntheticStats`] so teardown can be checked from the outside.

use super::{
    GrantedFormat, PIX_FMT_NV12, PIX_FMT_NV12M, PlaneFormat, PlaneInfo, PlaneMapping, VideoBackend,
    VideoDevice,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Driver behaviour of the synthetic device
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Planes reported per buffer (1 = NV12, 2 = NM12)
    pub plane_count: usize,
    /// Extra bytes appended to every row
    pub stride_padding: u32,
    /// Most buffers the driver grants
    pub max_buffers: u32,
    /// Clamp every requested format to this size
    pub clamp_resolution: Option<(u32, u32)>,
    /// Fourcc granted instead of NV12/NM12
    pub pixel_format_override: Option<u32>,
    pub fail_open: bool,
    pub reject_format: bool,
    /// Report a single-plane size image too small to hold the chroma plane
    pub short_size_image: bool,
    /// Single-plane buffers are too short to hold the chroma plane
    pub short_mapping: bool,
    /// Zero-based map call that fails
    pub fail_map_at: Option<usize>,
    pub fail_stream_on: bool,
    /// Dequeues that report "not ready" after each stream-on
    pub stall_dequeues: u32,
    /// First dequeue returns an index outside the pool
    pub invalid_index_once: bool,
    /// Luma value of every pixel
    pub luma: u8,
    /// Chroma (U, V) of every pixel pair
    pub chroma: (u8, u8),
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            plane_count: 1,
            stride_padding: 0,
            max_buffers: 8,
            clamp_resolution: None,
            pixel_format_override: None,
            fail_open: false,
            reject_format: false,
            short_size_image: false,
            short_mapping: false,
            fail_map_at: None,
            fail_stream_on: false,
            stall_dequeues: 0,
            invalid_index_once: false,
            luma: 128,
            chroma: (128, 128),
        }
    }
}

/// Counters shared by every device a backend opened
#[derive(Debug, Default)]
pub struct SyntheticStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    live_mappings: AtomicUsize,
    queued: AtomicUsize,
    dequeued: AtomicUsize,
    stream_on: AtomicUsize,
    stream_off: AtomicUsize,
}

impl SyntheticStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Plane mappings not yet unmapped
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn dequeued(&self) -> usize {
        self.dequeued.load(Ordering::SeqCst)
    }

    pub fn stream_on_calls(&self) -> usize {
        self.stream_on.load(Ordering::SeqCst)
    }

    pub fn stream_off_calls(&self) -> usize {
        self.stream_off.load(Ordering::SeqCst)
    }
}

/// Opens synthetic devices at any path
pub struct SyntheticBackend {
    config: Mutex<SyntheticConfig>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config: Mutex::new(config),
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    /// Replace the behaviour of devices opened from now on
    pub fn set_config(&self, config: SyntheticConfig) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Adjust the behaviour of devices opened from now on
    pub fn update_config(&self, f: impl FnOnce(&mut SyntheticConfig)) {
        f(&mut self.config.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

impl VideoBackend for SyntheticBackend {
    fn open(&self, path: &str) -> io::Result<Box<dyn VideoDevice>> {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if config.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: no such device", path),
            ));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        debug!(path, "Opened synthetic device");
        Ok(Box::new(SyntheticDevice {
            config,
            stats: Arc::clone(&self.stats),
            format: None,
            buffers: Vec::new(),
            queue: VecDeque::new(),
            streaming: false,
            map_calls: 0,
            stalls_left: 0,
            invalid_pending: false,
        }))
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

fn einval(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

/// Encode buffer and plane into a mmap offset
fn plane_offset(index: u32, plane: usize) -> u32 {
    (index << 8) | plane as u32
}

struct SyntheticDevice {
    config: SyntheticConfig,
    stats: Arc<SyntheticStats>,
    format: Option<GrantedFormat>,
    /// Backing memory per buffer, per plane
    buffers: Vec<Vec<Arc<Vec<u8>>>>,
    queue: VecDeque<u32>,
    streaming: bool,
    map_calls: usize,
    stalls_left: u32,
    invalid_pending: bool,
}

impl SyntheticDevice {
    fn fill_planes(&self, format: &GrantedFormat) -> Vec<Arc<Vec<u8>>> {
        let height = format.height as usize;
        let chroma_rows = height.div_ceil(2);
        let stride_y = format.planes[0].bytes_per_line as usize;
        let (u, v) = self.config.chroma;

        let luma = vec![self.config.luma; stride_y * height];
        let chroma_stride = format
            .planes
            .get(1)
            .map(|p| p.bytes_per_line as usize)
            .unwrap_or(stride_y);
        let chroma: Vec<u8> = (0..chroma_stride * chroma_rows)
            .map(|i| if i % 2 == 0 { u } else { v })
            .collect();

        if format.planes.len() == 1 {
            let mut combined = luma;
            if self.config.short_mapping {
                combined.extend_from_slice(&chroma[..chroma.len() / 2]);
            } else {
                combined.extend_from_slice(&chroma);
            }
            vec![Arc::new(combined)]
        } else {
            vec![Arc::new(luma), Arc::new(chroma)]
        }
    }
}

impl VideoDevice for SyntheticDevice {
    fn set_format(&mut self, width: u32, height: u32) -> io::Result<GrantedFormat> {
        if self.config.reject_format {
            return Err(einval("format not supported"));
        }
        let (width, height) = self.config.clamp_resolution.unwrap_or((width, height));
        let stride = width + self.config.stride_padding;
        let chroma_size = stride * height.div_ceil(2);

        let (pixel_format, planes) = if self.config.plane_count == 1 {
            let mut size_image = stride * height + chroma_size;
            if self.config.short_size_image {
                size_image = stride * height + chroma_size / 2;
            }
            (
                PIX_FMT_NV12,
                vec![PlaneFormat {
                    bytes_per_line: stride,
                    size_image,
                }],
            )
        } else {
            (
                PIX_FMT_NV12M,
                vec![
                    PlaneFormat {
                        bytes_per_line: stride,
                        size_image: stride * height,
                    },
                    PlaneFormat {
                        bytes_per_line: stride,
                        size_image: chroma_size,
                    },
                ],
            )
        };

        let format = GrantedFormat {
            width,
            height,
            pixel_format: self.config.pixel_format_override.unwrap_or(pixel_format),
            planes,
        };
        self.format = Some(format.clone());
        Ok(format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if self.streaming {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "device is streaming"));
        }
        if count == 0 {
            // Like the kernel, refuse to free buffers that are still mapped
            let still_mapped = self
                .buffers
                .iter()
                .flatten()
                .any(|plane| Arc::strong_count(plane) > 1);
            if still_mapped {
                return Err(io::Error::new(io::ErrorKind::ResourceBusy, "buffers still mapped"));
            }
            self.buffers.clear();
            self.queue.clear();
            return Ok(0);
        }

        let format = self
            .format
            .clone()
            .ok_or_else(|| einval("format not set"))?;
        let granted = count.min(self.config.max_buffers);
        self.buffers = (0..granted).map(|_| self.fill_planes(&format)).collect();
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneInfo>> {
        let planes = self
            .buffers
            .get(index as usize)
            .ok_or_else(|| einval("buffer index out of range"))?;
        Ok(planes
            .iter()
            .enumerate()
            .map(|(plane, data)| PlaneInfo {
                length: data.len() as u32,
                mem_offset: plane_offset(index, plane),
            })
            .collect())
    }

    fn map_plane(&mut self, plane: &PlaneInfo) -> io::Result<Box<dyn PlaneMapping>> {
        let call = self.map_calls;
        self.map_calls += 1;
        if self.config.fail_map_at == Some(call) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "mmap failed"));
        }

        let index = (plane.mem_offset >> 8) as usize;
        let plane_index = (plane.mem_offset & 0xff) as usize;
        let data = self
            .buffers
            .get(index)
            .and_then(|planes| planes.get(plane_index))
            .ok_or_else(|| einval("bad mmap offset"))?;

        self.stats.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticMapping {
            data: Arc::clone(data),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn queue_buffer(&mut self, index: u32, _num_planes: usize) -> io::Result<()> {
        if index as usize >= self.buffers.len() {
            return Err(einval("buffer index out of range"));
        }
        if self.queue.contains(&index) {
            return Err(einval("buffer already queued"));
        }
        self.queue.push_back(index);
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dequeue_buffer(&mut self, _num_planes: usize) -> io::Result<Option<u32>> {
        if !self.streaming {
            return Err(einval("not streaming"));
        }
        if self.invalid_pending {
            self.invalid_pending = false;
            return Ok(Some(self.buffers.len() as u32 + 16));
        }
        if self.stalls_left > 0 {
            self.stalls_left -= 1;
            return Ok(None);
        }
        let index = self.queue.pop_front();
        if index.is_some() {
            self.stats.dequeued.fetch_add(1, Ordering::SeqCst);
        }
        Ok(index)
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.config.fail_stream_on {
            return Err(io::Error::other("stream on refused"));
        }
        self.streaming = true;
        self.stalls_left = self.config.stall_dequeues;
        self.invalid_pending = self.config.invalid_index_once;
        self.stats.stream_on.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.streaming = false;
        self.queue.clear();
        self.stats.stream_off.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        self.request_buffers(0).map(|_| ())
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct SyntheticMapping {
    data: Arc<Vec<u8>>,
    stats: Arc<SyntheticStats>,
}

impl PlaneMapping for SyntheticMapping {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for SyntheticMapping {
    fn drop(&mut self) {
        self.stats.live_mappings.fetch_sub(1, Ordering::SeqCst);
    }
}
