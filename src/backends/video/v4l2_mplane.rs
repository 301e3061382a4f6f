// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 multi-planar capture device
//!
//! Talks to the kernel directly through `ioctl(2)` and `mmap(2)`. The ioctl
//! structures below mirror `linux/videodev2.h`; request numbers are derived
//! from the structure sizes so they stay correct on 32-bit targets.

use super::{GrantedFormat, PIX_FMT_NV12, PlaneFormat, PlaneInfo, PlaneMapping, VideoBackend, VideoDevice};
use crate::constants::buffers::MAX_PLANES;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_FIELD_NONE: u32 = 1;

// ===== V4L2 ioctl Structures =====

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct V4l2PlanePixFormat {
    sizeimage: u32,
    bytesperline: u32,
    reserved: [u16; 6],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct V4l2PixFormatMplane {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    colorspace: u32,
    plane_fmt: [V4l2PlanePixFormat; MAX_PLANES],
    num_planes: u8,
    flags: u8,
    ycbcr_enc: u8,
    quantization: u8,
    xfer_func: u8,
    reserved: [u8; 7],
}

/// `v4l2_format.fmt`: 200 bytes, pointer aligned (it also holds `v4l2_window`)
#[repr(C)]
#[derive(Clone, Copy)]
union V4l2FormatUnion {
    pix_mp: V4l2PixFormatMplane,
    raw_data: [u8; 200],
    _align: [libc::c_ulong; 200 / size_of::<libc::c_ulong>()],
}

#[repr(C)]
struct V4l2Format {
    buf_type: u32,
    fmt: V4l2FormatUnion,
}

#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    buf_type: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2PlaneM {
    mem_offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Plane {
    bytesused: u32,
    length: u32,
    m: V4l2PlaneM,
    data_offset: u32,
    reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    tc_type: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    planes: *mut V4l2Plane,
    fd: i32,
}

#[repr(C)]
struct V4l2Buffer {
    index: u32,
    buf_type: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(size_of::<V4l2PixFormatMplane>() == 192);
    assert!(size_of::<V4l2Format>() == 208);
    assert!(size_of::<V4l2RequestBuffers>() == 20);
    assert!(size_of::<V4l2Plane>() == 64);
    assert!(size_of::<V4l2Buffer>() == 88);
};

// ===== V4L2 ioctl Numbers =====
// (dir << 30) | (size << 16) | ('V' << 8) | nr, dir: 1=WRITE, 2=READ

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn vidioc(dir: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((dir << 30) | ((size as u32) << 16) | ((b'V' as u32) << 8) | nr) as libc::c_ulong
}

const VIDIOC_S_FMT: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 5, size_of::<V4l2Format>());
const VIDIOC_REQBUFS: libc::c_ulong =
    vidioc(IOC_READ | IOC_WRITE, 8, size_of::<V4l2RequestBuffers>());
const VIDIOC_QUERYBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 9, size_of::<V4l2Buffer>());
const VIDIOC_QBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 15, size_of::<V4l2Buffer>());
const VIDIOC_DQBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 17, size_of::<V4l2Buffer>());
const VIDIOC_STREAMON: libc::c_ulong = vidioc(IOC_WRITE, 18, size_of::<libc::c_int>());
const VIDIOC_STREAMOFF: libc::c_ulong = vidioc(IOC_WRITE, 19, size_of::<libc::c_int>());

/// Issue an ioctl, retrying on EINTR
fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        let result = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if result >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Opens V4L2 device nodes in non-blocking mode
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

impl VideoBackend for V4l2Backend {
    fn open(&self, path: &str) -> io::Result<Box<dyn VideoDevice>> {
        Ok(Box::new(V4l2Device::open(path)?))
    }

    fn name(&self) -> &'static str {
        "v4l2-mplane"
    }
}

/// An open V4L2 multi-planar capture node; closed on drop
pub struct V4l2Device {
    file: File,
    path: String,
}

impl V4l2Device {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        debug!(path, "Opened V4L2 device");
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn new_buffer(index: u32, planes: &mut [V4l2Plane; MAX_PLANES], num_planes: usize) -> V4l2Buffer {
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf.length = num_planes.min(MAX_PLANES) as u32;
        buf.m.planes = planes.as_mut_ptr();
        buf
    }
}

impl VideoDevice for V4l2Device {
    fn set_format(&mut self, width: u32, height: u32) -> io::Result<GrantedFormat> {
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        let mut pix: V4l2PixFormatMplane = unsafe { std::mem::zeroed() };
        pix.width = width;
        pix.height = height;
        pix.pixelformat = PIX_FMT_NV12;
        pix.field = V4L2_FIELD_NONE;
        fmt.fmt.pix_mp = pix;

        xioctl(self.fd(), VIDIOC_S_FMT, &mut fmt)?;

        // The driver writes back what it actually granted
        let granted = unsafe { fmt.fmt.pix_mp };
        let plane_fmt = granted.plane_fmt;
        let num_planes = (granted.num_planes as usize).min(MAX_PLANES);
        let planes = plane_fmt[..num_planes]
            .iter()
            .map(|p| PlaneFormat {
                bytes_per_line: p.bytesperline,
                size_image: p.sizeimage,
            })
            .collect();

        Ok(GrantedFormat {
            width: granted.width,
            height: granted.height,
            pixel_format: granted.pixelformat,
            planes,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req: V4l2RequestBuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        req.memory = V4L2_MEMORY_MMAP;
        xioctl(self.fd(), VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneInfo>> {
        let mut planes: [V4l2Plane; MAX_PLANES] = unsafe { std::mem::zeroed() };
        let mut buf = Self::new_buffer(index, &mut planes, MAX_PLANES);
        xioctl(self.fd(), VIDIOC_QUERYBUF, &mut buf)?;

        let count = (buf.length as usize).min(MAX_PLANES);
        Ok(planes[..count]
            .iter()
            .map(|p| PlaneInfo {
                length: p.length,
                mem_offset: unsafe { p.m.mem_offset },
            })
            .collect())
    }

    fn map_plane(&mut self, plane: &PlaneInfo) -> io::Result<Box<dyn PlaneMapping>> {
        Ok(Box::new(MmapRegion::map(self.fd(), plane)?))
    }

    fn queue_buffer(&mut self, index: u32, num_planes: usize) -> io::Result<()> {
        let mut planes: [V4l2Plane; MAX_PLANES] = unsafe { std::mem::zeroed() };
        let mut buf = Self::new_buffer(index, &mut planes, num_planes);
        xioctl(self.fd(), VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self, num_planes: usize) -> io::Result<Option<u32>> {
        let mut planes: [V4l2Plane; MAX_PLANES] = unsafe { std::mem::zeroed() };
        let mut buf = Self::new_buffer(0, &mut planes, num_planes.max(1));
        match xioctl(self.fd(), VIDIOC_DQBUF, &mut buf) {
            Ok(()) => Ok(Some(buf.index)),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        xioctl(self.fd(), VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        xioctl(self.fd(), VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        self.request_buffers(0).map(|_| ())
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        debug!(path = %self.path, "Closing V4L2 device");
    }
}

/// A `MAP_SHARED` mapping of one buffer plane
struct MmapRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

// The region is plain shared memory; ownership moves with the pool.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    fn map(fd: RawFd, plane: &PlaneInfo) -> io::Result<Self> {
        let len = plane.length as usize;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "plane length is zero"));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                plane.mem_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }
}

impl PlaneMapping for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // The pool only hands out views of buffers the application owns
        // (between DQBUF and the following QBUF), so the kernel is not
        // writing this memory while the slice is alive.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_ioctl_numbers_match_kernel_headers() {
        assert_eq!(VIDIOC_S_FMT, 0xC0D0_5605);
        assert_eq!(VIDIOC_REQBUFS, 0xC014_5608);
        assert_eq!(VIDIOC_QUERYBUF, 0xC058_5609);
        assert_eq!(VIDIOC_QBUF, 0xC058_560F);
        assert_eq!(VIDIOC_DQBUF, 0xC058_5611);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(VIDIOC_STREAMOFF, 0x4004_5613);
    }

    #[test]
    fn test_open_missing_device_fails() {
        let err = V4l2Backend::new()
            .open("/dev/this-video-node-does-not-exist")
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
