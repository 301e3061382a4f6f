// SPDX-License-Identifier: GPL-3.0-only

//! Capture device session
//!
//! ```text
//! Closed ──open──▶ Opened ──configure──▶ Configured ──start_streaming──▶ Streaming
//!    ▲                │                      │                              │
//!    └────────────────┴──── failure / stop ──┴──────────────────────────────┘
//! ```
//!
//! Any failure while configuring or starting releases everything acquired so
//! far and leaves the session `Closed`. A closed session is not reopened;
//! build a new one.

use super::buffer_pool::{BufferPool, CaptureLayout};
use super::{VideoBackend, VideoDevice};
use crate::errors::{CaptureError, CaptureResult};
use crate::media::convert::{ConvertError, nv12_to_bgra};
use std::fmt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    Configured,
    Streaming,
}

/// Why a dequeued buffer produced no frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The buffer has no luma or chroma view
    MissingPlane,
    /// No output buffer was free to convert into
    NoOutputBuffer,
    Conversion(ConvertError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingPlane => write!(f, "buffer plane missing"),
            SkipReason::NoOutputBuffer => write!(f, "no free output buffer"),
            SkipReason::Conversion(e) => write!(f, "conversion failed: {}", e),
        }
    }
}

/// A frame converted into the caller's output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Capture buffer the frame came from
    pub index: u32,
    pub width: u32,
    pub height: u32,
    /// Output row pitch in bytes
    pub pitch: usize,
}

/// Result of one capture attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Frame(FrameInfo),
    /// No buffer was ready yet
    Retry,
    /// A buffer was dequeued but not converted; it was still requeued
    Skipped(SkipReason),
}

/// An open capture device with its negotiated layout and buffers
pub struct DeviceSession {
    path: String,
    state: SessionState,
    device: Option<Box<dyn VideoDevice>>,
    pool: Option<BufferPool>,
    buffers_requested: bool,
}

impl DeviceSession {
    /// Open the device at `path`
    pub fn open(backend: &dyn VideoBackend, path: &str) -> CaptureResult<Self> {
        let device = backend.open(path).map_err(|e| CaptureError::DeviceOpen {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        info!(path, backend = backend.name(), "Opened capture device");
        Ok(Self {
            path: path.to_string(),
            state: SessionState::Opened,
            device: Some(device),
            pool: None,
            buffers_requested: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated layout, once configured
    pub fn layout(&self) -> Option<CaptureLayout> {
        self.pool.as_ref().map(|pool| *pool.layout())
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Negotiate the format and map `buffer_count` buffers
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> CaptureResult<CaptureLayout> {
        if self.state != SessionState::Opened {
            return Err(CaptureError::InvalidState(format!(
                "configure requires an opened session, state is {:?}",
                self.state
            )));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::InvalidState("device handle missing".into()));
        };

        let result = BufferPool::negotiate(device.as_mut(), width, height).and_then(|layout| {
            self.buffers_requested = true;
            BufferPool::allocate(device.as_mut(), layout, buffer_count)
        });

        match result {
            Ok(pool) => {
                let layout = *pool.layout();
                info!(path = %self.path, buffers = pool.len(), "Capture session configured");
                self.pool = Some(pool);
                self.state = SessionState::Configured;
                Ok(layout)
            }
            Err(e) => {
                error!(path = %self.path, error = %e, "Failed to configure capture device");
                self.teardown();
                Err(e)
            }
        }
    }

    /// Queue every buffer and start the stream
    pub fn start_streaming(&mut self) -> CaptureResult<()> {
        if self.state != SessionState::Configured {
            return Err(CaptureError::InvalidState(format!(
                "start_streaming requires a configured session, state is {:?}",
                self.state
            )));
        }
        let (Some(device), Some(pool)) = (self.device.as_mut(), self.pool.as_mut()) else {
            return Err(CaptureError::InvalidState("device or buffers missing".into()));
        };

        let result = (0..pool.len() as u32)
            .try_for_each(|index| pool.enqueue(device.as_mut(), index))
            .and_then(|()| {
                device
                    .stream_on()
                    .map_err(|e| CaptureError::StreamOn(e.to_string()))
            });

        match result {
            Ok(()) => {
                info!(path = %self.path, "Streaming started");
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(e) => {
                error!(path = %self.path, error = %e, "Failed to start streaming");
                self.teardown();
                Err(e)
            }
        }
    }

    /// Dequeue one buffer, convert it into `out` and hand it back
    ///
    /// The buffer is requeued whatever the conversion outcome. `out` is
    /// `None` when the caller has no free output buffer; the frame is then
    /// dropped but the buffer still cycles.
    pub fn capture_one(&mut self, out: Option<&mut [u8]>) -> CaptureResult<CaptureOutcome> {
        if self.state != SessionState::Streaming {
            return Err(CaptureError::InvalidState(format!(
                "capture requires a streaming session, state is {:?}",
                self.state
            )));
        }
        let (Some(device), Some(pool)) = (self.device.as_mut(), self.pool.as_mut()) else {
            return Err(CaptureError::InvalidState("device or buffers missing".into()));
        };

        let Some(index) = pool.dequeue(device.as_mut())? else {
            return Ok(CaptureOutcome::Retry);
        };

        let layout = *pool.layout();
        let outcome = match (pool.buffer(index), out) {
            (None, _) => CaptureOutcome::Skipped(SkipReason::MissingPlane),
            (Some(_), None) => CaptureOutcome::Skipped(SkipReason::NoOutputBuffer),
            (Some(buffer), Some(out)) => match (buffer.luma(), buffer.chroma(&layout)) {
                (Some(luma), Some(chroma)) => match nv12_to_bgra(luma, chroma, &layout, out) {
                    Ok(()) => CaptureOutcome::Frame(FrameInfo {
                        index,
                        width: layout.width,
                        height: layout.height,
                        pitch: layout.output_pitch(),
                    }),
                    Err(e) => CaptureOutcome::Skipped(SkipReason::Conversion(e)),
                },
                _ => CaptureOutcome::Skipped(SkipReason::MissingPlane),
            },
        };

        match &outcome {
            CaptureOutcome::Skipped(SkipReason::NoOutputBuffer) => {
                debug!(index, "Dropping frame, no free output buffer");
            }
            CaptureOutcome::Skipped(reason) => {
                warn!(index, reason = %reason, "Conversion skipped");
            }
            _ => {}
        }

        if let Err(e) = pool.enqueue(device.as_mut(), index) {
            error!(index, error = %e, "Failed to requeue capture buffer");
        }

        Ok(outcome)
    }

    /// Stop streaming, unmap buffers and close the device. Idempotent.
    ///
    /// Teardown always completes; a failed STREAMOFF is reported afterwards.
    pub fn stop(&mut self) -> CaptureResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        info!(path = %self.path, "Stopping capture session");

        let mut result = Ok(());
        if self.state == SessionState::Streaming
            && let Some(device) = self.device.as_mut()
            && let Err(e) = device.stream_off()
        {
            warn!(path = %self.path, error = %e, "STREAMOFF failed");
            result = Err(CaptureError::StreamOff(e.to_string()));
        }

        self.teardown();
        result
    }

    /// Unmap, free driver buffers, close; leaves the session `Closed`
    fn teardown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.reclaim_all();
            pool.release();
        }
        if let Some(mut device) = self.device.take() {
            if self.buffers_requested
                && let Err(e) = device.release_buffers()
            {
                warn!(path = %self.path, error = %e, "Failed to free driver buffers");
            }
            drop(device);
            debug!(path = %self.path, "Closed capture device");
        }
        self.buffers_requested = false;
        self.state = SessionState::Closed;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::video::{BufferOwner, SyntheticBackend, SyntheticConfig};

    fn streaming(config: SyntheticConfig) -> (SyntheticBackend, DeviceSession) {
        let backend = SyntheticBackend::new(config);
        let mut session = DeviceSession::open(&backend, "/dev/synthetic0").unwrap();
        session.configure(64, 48, 4).unwrap();
        session.start_streaming().unwrap();
        (backend, session)
    }

    fn output(session: &DeviceSession) -> Vec<u8> {
        vec![0u8; session.layout().unwrap().output_len()]
    }

    #[test]
    fn test_open_failure() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            fail_open: true,
            ..SyntheticConfig::default()
        });
        let err = DeviceSession::open(&backend, "/dev/video99").err().unwrap();
        assert!(matches!(err, CaptureError::DeviceOpen { ref path, .. } if path == "/dev/video99"));
    }

    #[test]
    fn test_capture_cycle_keeps_buffers_owned() {
        for plane_count in [1, 2] {
            let (_backend, mut session) = streaming(SyntheticConfig {
                plane_count,
                stride_padding: 16,
                luma: 235,
                ..SyntheticConfig::default()
            });
            let mut out = output(&session);

            let outcome = session.capture_one(Some(&mut out)).unwrap();
            let CaptureOutcome::Frame(info) = outcome else {
                panic!("expected a frame, got {:?}", outcome);
            };
            assert_eq!(info.pitch, 80 * 4);
            assert_eq!(&out[..4], &[255, 255, 255, 255]);

            let pool = session.pool().unwrap();
            assert_eq!(pool.kernel_owned(), pool.len());
            assert_eq!(pool.owner(info.index), Some(BufferOwner::Kernel));
        }
    }

    #[test]
    fn test_not_ready_is_retry() {
        let (_backend, mut session) = streaming(SyntheticConfig {
            stall_dequeues: 2,
            ..SyntheticConfig::default()
        });
        let mut out = output(&session);
        assert_eq!(session.capture_one(Some(&mut out)).unwrap(), CaptureOutcome::Retry);
        assert_eq!(session.capture_one(Some(&mut out)).unwrap(), CaptureOutcome::Retry);
        assert!(matches!(
            session.capture_one(Some(&mut out)).unwrap(),
            CaptureOutcome::Frame(_)
        ));
    }

    #[test]
    fn test_skipped_frame_still_requeues() {
        let (backend, mut session) = streaming(SyntheticConfig::default());
        let queued_before = backend.stats().queued();
        assert_eq!(
            session.capture_one(None).unwrap(),
            CaptureOutcome::Skipped(SkipReason::NoOutputBuffer)
        );
        assert_eq!(backend.stats().queued(), queued_before + 1);

        let pool = session.pool().unwrap();
        assert_eq!(pool.kernel_owned(), pool.len());
    }

    #[test]
    fn test_short_output_is_skipped_and_requeued() {
        let (_backend, mut session) = streaming(SyntheticConfig::default());
        let mut out = vec![0u8; 16];
        assert!(matches!(
            session.capture_one(Some(&mut out)).unwrap(),
            CaptureOutcome::Skipped(SkipReason::Conversion(_))
        ));
        let pool = session.pool().unwrap();
        assert_eq!(pool.kernel_owned(), pool.len());
    }

    #[test]
    fn test_invalid_index_is_retry() {
        let (_backend, mut session) = streaming(SyntheticConfig {
            invalid_index_once: true,
            ..SyntheticConfig::default()
        });
        let mut out = output(&session);
        assert_eq!(session.capture_one(Some(&mut out)).unwrap(), CaptureOutcome::Retry);
        assert!(matches!(
            session.capture_one(Some(&mut out)).unwrap(),
            CaptureOutcome::Frame(_)
        ));
    }

    #[test]
    fn test_configure_failure_rolls_back() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            fail_map_at: Some(2),
            ..SyntheticConfig::default()
        });
        let mut session = DeviceSession::open(&backend, "/dev/synthetic0").unwrap();
        let err = session.configure(64, 48, 4).unwrap_err();
        assert!(matches!(err, CaptureError::Allocation(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.stats().live_mappings(), 0);
        assert_eq!(backend.stats().closed(), 1);
    }

    #[test]
    fn test_rejected_format() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            reject_format: true,
            ..SyntheticConfig::default()
        });
        let mut session = DeviceSession::open(&backend, "/dev/synthetic0").unwrap();
        assert!(matches!(
            session.configure(64, 48, 4),
            Err(CaptureError::FormatNegotiation(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_short_size_image_fails_negotiation() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            short_size_image: true,
            ..SyntheticConfig::default()
        });
        let mut session = DeviceSession::open(&backend, "/dev/synthetic0").unwrap();
        assert!(matches!(
            session.configure(64, 48, 4),
            Err(CaptureError::FormatNegotiation(_))
        ));
    }

    #[test]
    fn test_stream_on_failure_rolls_back() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            fail_stream_on: true,
            ..SyntheticConfig::default()
        });
        let mut session = DeviceSession::open(&backend, "/dev/synthetic0").unwrap();
        session.configure(64, 48, 4).unwrap();
        assert!(matches!(session.start_streaming(), Err(CaptureError::StreamOn(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.stats().live_mappings(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (backend, mut session) = streaming(SyntheticConfig::default());
        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.stats().stream_off_calls(), 1);
        assert_eq!(backend.stats().live_mappings(), 0);
        assert_eq!(backend.stats().closed(), 1);
        assert!(session.capture_one(None).is_err());
    }

    #[test]
    fn test_layout_follows_driver_not_request() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            clamp_resolution: Some((320, 240)),
            ..SyntheticConfig::default()
        });
        let mut session = DeviceSession::open(&backend, "/dev/synthetic0").unwrap();
        let layout = session.configure(1920, 1080, 4).unwrap();
        assert_eq!((layout.width, layout.height), (320, 240));
    }
}
