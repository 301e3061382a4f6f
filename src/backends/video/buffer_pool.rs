// SPDX-License-Identifier: GPL-3.0-only

//! Memory-mapped capture buffers and their ownership protocol
//!
//! Every buffer index is owned either by the kernel (queued) or by the
//! application (dequeued, or not yet queued). The pool tracks that
//! partition and refuses transitions that would break it, and only lends out
//! plane views of application-owned buffers.

use super::{GrantedFormat, PIX_FMT_NV12, PIX_FMT_NV12M, PlaneMapping, VideoDevice, fourcc_name};
use crate::constants::OUTPUT_BYTES_PER_PIXEL;
use crate::errors::{CaptureError, CaptureResult};
use tracing::{debug, info, warn};

/// Plane geometry derived from what the driver granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLayout {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    /// Planes the driver reports per buffer (1 or 2)
    pub plane_count: usize,
    /// Luma row stride in bytes
    pub stride_y: usize,
    /// Chroma row stride in bytes
    pub stride_uv: usize,
    /// Byte offset of the chroma plane inside the luma mapping, single-plane only
    pub chroma_offset: Option<usize>,
}

impl CaptureLayout {
    /// Build the authoritative layout from a granted format
    pub fn from_granted(granted: &GrantedFormat) -> CaptureResult<Self> {
        let fail = |msg: String| Err(CaptureError::FormatNegotiation(msg));

        if granted.pixel_format != PIX_FMT_NV12 && granted.pixel_format != PIX_FMT_NV12M {
            return fail(format!(
                "driver granted {} instead of NV12",
                fourcc_name(granted.pixel_format)
            ));
        }
        if granted.width == 0 || granted.height == 0 {
            return fail(format!("driver granted empty frame {}x{}", granted.width, granted.height));
        }

        let plane_count = granted.planes.len();
        if plane_count != 1 && plane_count != 2 {
            return fail(format!("driver reported {} planes, expected 1 or 2", plane_count));
        }

        let width = granted.width as usize;
        let height = granted.height as usize;
        let luma = granted.planes[0];

        let stride_y = match luma.bytes_per_line {
            0 => width,
            bpl => bpl as usize,
        };
        if stride_y < width {
            return fail(format!("luma stride {} is narrower than width {}", stride_y, width));
        }

        let stride_uv = match granted.planes.get(1) {
            Some(chroma) if chroma.bytes_per_line > 0 => chroma.bytes_per_line as usize,
            _ => stride_y,
        };
        // One interleaved UV pair per two luma columns
        let chroma_row_bytes = width.div_ceil(2) * 2;
        if stride_uv < chroma_row_bytes {
            return fail(format!(
                "chroma stride {} is narrower than a chroma row ({} bytes)",
                stride_uv, chroma_row_bytes
            ));
        }

        let mut layout = Self {
            width: granted.width,
            height: granted.height,
            pixel_format: granted.pixel_format,
            plane_count,
            stride_y,
            stride_uv,
            chroma_offset: None,
        };

        if plane_count == 1 {
            let offset = layout.luma_len();
            let needed = offset + layout.chroma_len();
            let available = luma.size_image as usize;
            if available > 0 && needed > available {
                return fail(format!(
                    "chroma plane ends at byte {} but the buffer holds {}",
                    needed, available
                ));
            }
            layout.chroma_offset = Some(offset);
        } else {
            let luma_size = luma.size_image as usize;
            let chroma_size = granted.planes[1].size_image as usize;
            if luma_size > 0 && luma_size < layout.luma_len() {
                return fail(format!(
                    "luma plane holds {} bytes, {} needed",
                    luma_size,
                    layout.luma_len()
                ));
            }
            if chroma_size > 0 && chroma_size < layout.chroma_len() {
                return fail(format!(
                    "chroma plane holds {} bytes, {} needed",
                    chroma_size,
                    layout.chroma_len()
                ));
            }
        }

        Ok(layout)
    }

    /// Bytes of luma data (stride × height)
    pub fn luma_len(&self) -> usize {
        self.stride_y * self.height as usize
    }

    /// Bytes of chroma data (stride × half height, rounded up)
    pub fn chroma_len(&self) -> usize {
        self.stride_uv * (self.height as usize).div_ceil(2)
    }

    /// Output row pitch in bytes, derived from the luma stride
    pub fn output_pitch(&self) -> usize {
        self.stride_y * OUTPUT_BYTES_PER_PIXEL
    }

    /// Size of one converted output frame
    pub fn output_len(&self) -> usize {
        self.output_pitch() * self.height as usize
    }
}

/// Who currently owns a buffer index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// Queued; the kernel may be writing it
    Kernel,
    /// Dequeued or never queued; safe to read
    Application,
}

/// One capture buffer: one mapping per reported plane
pub struct MappedBuffer {
    index: u32,
    planes: Vec<Box<dyn PlaneMapping>>,
}

impl MappedBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Luma plane (the whole first mapping)
    pub fn luma(&self) -> Option<&[u8]> {
        self.planes.first().map(|p| p.as_slice())
    }

    /// Chroma plane: the second mapping, or a view into the first one when
    /// the driver packs both planes into a single buffer
    pub fn chroma(&self, layout: &CaptureLayout) -> Option<&[u8]> {
        match layout.chroma_offset {
            Some(offset) => self.luma()?.get(offset..offset + layout.chroma_len()),
            None => self.planes.get(1).map(|p| p.as_slice()),
        }
    }
}

/// Fixed set of mapped buffers sharing one layout
pub struct BufferPool {
    layout: CaptureLayout,
    buffers: Vec<MappedBuffer>,
    owners: Vec<BufferOwner>,
}

impl BufferPool {
    /// Request NV12 at the given size and derive the layout from the reply
    pub fn negotiate(
        device: &mut dyn VideoDevice,
        width: u32,
        height: u32,
    ) -> CaptureResult<CaptureLayout> {
        let granted = device
            .set_format(width, height)
            .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?;

        let layout = CaptureLayout::from_granted(&granted)?;
        if layout.width != width || layout.height != height {
            warn!(
                requested = %format!("{}x{}", width, height),
                granted = %format!("{}x{}", layout.width, layout.height),
                "Driver altered the requested resolution"
            );
        }
        info!(
            width = layout.width,
            height = layout.height,
            format = %fourcc_name(layout.pixel_format),
            planes = layout.plane_count,
            stride_y = layout.stride_y,
            stride_uv = layout.stride_uv,
            "Negotiated capture layout"
        );
        Ok(layout)
    }

    /// Request and map up to `count` buffers
    ///
    /// Accepts fewer buffers than requested. Buffers mapped before a failure
    /// are unmapped before the error is returned.
    pub fn allocate(
        device: &mut dyn VideoDevice,
        layout: CaptureLayout,
        count: u32,
    ) -> CaptureResult<Self> {
        if count == 0 {
            return Err(CaptureError::Allocation("zero buffers requested".into()));
        }

        let granted = device
            .request_buffers(count)
            .map_err(|e| CaptureError::Allocation(format!("buffer request failed: {}", e)))?;
        if granted == 0 {
            return Err(CaptureError::Allocation("driver granted no buffers".into()));
        }
        if granted < count {
            info!(requested = count, granted, "Driver granted fewer buffers");
        }
        let usable = granted.min(count);

        let mut buffers = Vec::with_capacity(usable as usize);
        for index in 0..usable {
            buffers.push(Self::map_buffer(device, &layout, index)?);
        }

        debug!(count = buffers.len(), "Mapped capture buffers");
        Ok(Self {
            layout,
            owners: vec![BufferOwner::Application; buffers.len()],
            buffers,
        })
    }

    fn map_buffer(
        device: &mut dyn VideoDevice,
        layout: &CaptureLayout,
        index: u32,
    ) -> CaptureResult<MappedBuffer> {
        let infos = device
            .query_buffer(index)
            .map_err(|e| CaptureError::Allocation(format!("query of buffer {} failed: {}", index, e)))?;
        if infos.len() != layout.plane_count {
            return Err(CaptureError::Allocation(format!(
                "buffer {} has {} planes, layout expects {}",
                index,
                infos.len(),
                layout.plane_count
            )));
        }

        let mut planes = Vec::with_capacity(infos.len());
        for (plane, info) in infos.iter().enumerate() {
            let mapping = device.map_plane(info).map_err(|e| {
                CaptureError::Allocation(format!("mmap of buffer {} plane {} failed: {}", index, plane, e))
            })?;
            debug!(index, plane, length = info.length, offset = info.mem_offset, "Mapped plane");
            planes.push(mapping);
        }

        let (luma_needed, chroma_needed) = match layout.chroma_offset {
            Some(offset) => (offset + layout.chroma_len(), 0),
            None => (layout.luma_len(), layout.chroma_len()),
        };
        if planes[0].len() < luma_needed {
            return Err(CaptureError::Allocation(format!(
                "buffer {} is {} bytes, planes need {}",
                index,
                planes[0].len(),
                luma_needed
            )));
        }
        if let Some(chroma) = planes.get(1)
            && chroma.len() < chroma_needed
        {
            return Err(CaptureError::Allocation(format!(
                "buffer {} chroma plane is {} bytes, {} needed",
                index,
                chroma.len(),
                chroma_needed
            )));
        }

        Ok(MappedBuffer { index, planes })
    }

    pub fn layout(&self) -> &CaptureLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn owner(&self, index: u32) -> Option<BufferOwner> {
        self.owners.get(index as usize).copied()
    }

    /// Number of buffers currently queued to the kernel
    pub fn kernel_owned(&self) -> usize {
        self.owners.iter().filter(|o| **o == BufferOwner::Kernel).count()
    }

    /// Hand an application-owned buffer to the kernel
    pub fn enqueue(&mut self, device: &mut dyn VideoDevice, index: u32) -> CaptureResult<()> {
        match self.owner(index) {
            Some(BufferOwner::Application) => {}
            Some(BufferOwner::Kernel) => {
                return Err(CaptureError::InvalidState(format!("buffer {} is already queued", index)));
            }
            None => {
                return Err(CaptureError::InvalidState(format!("buffer {} is not in the pool", index)));
            }
        }

        device
            .queue_buffer(index, self.layout.plane_count)
            .map_err(|e| CaptureError::StreamOn(format!("queue of buffer {} failed: {}", index, e)))?;
        self.owners[index as usize] = BufferOwner::Kernel;
        Ok(())
    }

    /// Reclaim a filled buffer; `Ok(None)` when none is ready
    ///
    /// An index outside the pool is handed straight back to the driver and
    /// reported as not ready.
    pub fn dequeue(&mut self, device: &mut dyn VideoDevice) -> CaptureResult<Option<u32>> {
        let index = match device.dequeue_buffer(self.layout.plane_count) {
            Ok(Some(index)) => index,
            Ok(None) => return Ok(None),
            Err(e) => return Err(CaptureError::Dequeue(e.to_string())),
        };

        match self.owner(index) {
            Some(BufferOwner::Kernel) => {
                self.owners[index as usize] = BufferOwner::Application;
                Ok(Some(index))
            }
            Some(BufferOwner::Application) => {
                warn!(index, "Driver returned a buffer that was not queued");
                Ok(Some(index))
            }
            None => {
                warn!(index, pool = self.buffers.len(), "Driver returned an invalid buffer index");
                if let Err(e) = device.queue_buffer(index, self.layout.plane_count) {
                    warn!(index, error = %e, "Failed to requeue invalid buffer index");
                }
                Ok(None)
            }
        }
    }

    /// A buffer the application currently owns
    pub fn buffer(&self, index: u32) -> Option<&MappedBuffer> {
        match self.owner(index)? {
            BufferOwner::Application => self.buffers.get(index as usize),
            BufferOwner::Kernel => None,
        }
    }

    /// Mark every buffer application-owned after the stream was stopped
    pub fn reclaim_all(&mut self) {
        self.owners.fill(BufferOwner::Application);
    }

    /// Unmap every buffer. Idempotent.
    pub fn release(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        debug!(count = self.buffers.len(), "Unmapping capture buffers");
        self.buffers.clear();
        self.owners.clear();
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::video::{PlaneFormat, SyntheticBackend, SyntheticConfig, VideoBackend};

    fn granted(format: u32, planes: Vec<PlaneFormat>) -> GrantedFormat {
        GrantedFormat {
            width: 64,
            height: 48,
            pixel_format: format,
            planes,
        }
    }

    #[test]
    fn test_single_plane_layout_uses_stride() {
        let layout = CaptureLayout::from_granted(&granted(
            PIX_FMT_NV12,
            vec![PlaneFormat {
                bytes_per_line: 80,
                size_image: 80 * 48 * 3 / 2,
            }],
        ))
        .unwrap();
        assert_eq!(layout.stride_y, 80);
        assert_eq!(layout.stride_uv, 80);
        assert_eq!(layout.chroma_offset, Some(80 * 48));
        assert_eq!(layout.output_pitch(), 320);
        assert_eq!(layout.output_len(), 320 * 48);
    }

    #[test]
    fn test_zero_stride_falls_back_to_width() {
        let layout = CaptureLayout::from_granted(&granted(
            PIX_FMT_NV12,
            vec![PlaneFormat {
                bytes_per_line: 0,
                size_image: 0,
            }],
        ))
        .unwrap();
        assert_eq!(layout.stride_y, 64);
        assert_eq!(layout.chroma_offset, Some(64 * 48));
    }

    #[test]
    fn test_chroma_past_end_of_buffer_fails() {
        let result = CaptureLayout::from_granted(&granted(
            PIX_FMT_NV12,
            vec![PlaneFormat {
                bytes_per_line: 64,
                size_image: 64 * 48 + 10,
            }],
        ));
        assert!(matches!(result, Err(CaptureError::FormatNegotiation(_))));
    }

    #[test]
    fn test_two_plane_layout() {
        let layout = CaptureLayout::from_granted(&granted(
            PIX_FMT_NV12M,
            vec![
                PlaneFormat {
                    bytes_per_line: 64,
                    size_image: 64 * 48,
                },
                PlaneFormat {
                    bytes_per_line: 96,
                    size_image: 96 * 24,
                },
            ],
        ))
        .unwrap();
        assert_eq!(layout.plane_count, 2);
        assert_eq!(layout.stride_uv, 96);
        assert_eq!(layout.chroma_offset, None);
        assert_eq!(layout.chroma_len(), 96 * 24);
    }

    #[test]
    fn test_foreign_pixel_format_fails() {
        let result = CaptureLayout::from_granted(&granted(
            super::super::fourcc(b"YUYV"),
            vec![PlaneFormat::default()],
        ));
        assert!(matches!(result, Err(CaptureError::FormatNegotiation(_))));
    }

    #[test]
    fn test_narrow_stride_fails() {
        let result = CaptureLayout::from_granted(&granted(
            PIX_FMT_NV12,
            vec![PlaneFormat {
                bytes_per_line: 32,
                size_image: 0,
            }],
        ));
        assert!(result.is_err());
    }

    fn open(config: SyntheticConfig) -> (SyntheticBackend, Box<dyn VideoDevice>) {
        let backend = SyntheticBackend::new(config);
        let device = backend.open("/dev/synthetic0").unwrap();
        (backend, device)
    }

    #[test]
    fn test_allocate_accepts_fewer_buffers() {
        let (backend, mut device) = open(SyntheticConfig {
            max_buffers: 2,
            ..SyntheticConfig::default()
        });
        let layout = BufferPool::negotiate(device.as_mut(), 64, 48).unwrap();
        let pool = BufferPool::allocate(device.as_mut(), layout, 4).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(backend.stats().live_mappings(), 2);
    }

    #[test]
    fn test_failed_mapping_unmaps_earlier_buffers() {
        let (backend, mut device) = open(SyntheticConfig {
            plane_count: 2,
            fail_map_at: Some(3),
            ..SyntheticConfig::default()
        });
        let layout = BufferPool::negotiate(device.as_mut(), 64, 48).unwrap();
        let result = BufferPool::allocate(device.as_mut(), layout, 4);
        assert!(matches!(result, Err(CaptureError::Allocation(_))));
        assert_eq!(backend.stats().live_mappings(), 0);
    }

    #[test]
    fn test_short_mapping_fails_allocation() {
        let (backend, mut device) = open(SyntheticConfig {
            short_mapping: true,
            ..SyntheticConfig::default()
        });
        let layout = BufferPool::negotiate(device.as_mut(), 64, 48).unwrap();
        let result = BufferPool::allocate(device.as_mut(), layout, 4);
        assert!(matches!(result, Err(CaptureError::Allocation(_))));
        assert_eq!(backend.stats().live_mappings(), 0);
    }

    #[test]
    fn test_ownership_partition() {
        for plane_count in [1, 2] {
            let (_backend, mut device) = open(SyntheticConfig {
                plane_count,
                ..SyntheticConfig::default()
            });
            let layout = BufferPool::negotiate(device.as_mut(), 64, 48).unwrap();
            let mut pool = BufferPool::allocate(device.as_mut(), layout, 4).unwrap();

            for index in 0..pool.len() as u32 {
                pool.enqueue(device.as_mut(), index).unwrap();
            }
            assert_eq!(pool.kernel_owned(), 4);
            assert!(pool.enqueue(device.as_mut(), 0).is_err());
            assert!(pool.buffer(0).is_none());

            device.stream_on().unwrap();
            let index = pool.dequeue(device.as_mut()).unwrap().unwrap();
            assert_eq!(pool.owner(index), Some(BufferOwner::Application));
            assert_eq!(pool.kernel_owned(), 3);

            let buffer = pool.buffer(index).unwrap();
            assert!(buffer.luma().unwrap().len() >= layout.luma_len());
            assert_eq!(buffer.chroma(&layout).unwrap().len(), layout.chroma_len());

            pool.enqueue(device.as_mut(), index).unwrap();
            assert_eq!(pool.kernel_owned(), 4);
        }
    }

    #[test]
    fn test_release_twice() {
        let (backend, mut device) = open(SyntheticConfig::default());
        let layout = BufferPool::negotiate(device.as_mut(), 64, 48).unwrap();
        let mut pool = BufferPool::allocate(device.as_mut(), layout, 4).unwrap();
        pool.release();
        pool.release();
        assert!(pool.is_empty());
        assert_eq!(backend.stats().live_mappings(), 0);
    }
}
