// SPDX-License-Identifier: GPL-3.0-only

//! Capture engine: the entry points a host drives
//!
//! ```text
//!  host frame clock ──advance()──▶ DeviceSession::capture_one ──▶ FrameHandoff (back)
//!                                                                     │ publish
//!  host render ──────render()───▶ FrameHandoff::consume ──▶ GraphicsContext upload/draw
//!
//!  audio worker ──────────────▶ AudioSink
//!
//!  update() ─▶ Reconfiguration: device lock ▶ handoff lock ▶ stop ▶ settle ▶ rebuild
//! ```
//!
//! Lock ordering: the device lock is always taken before the handoff lock.
//! `advance()` only ever tries the device lock and skips the tick when it is
//! held; `render()` only takes the handoff lock (plus its own texture lock,
//! which nothing else takes).

mod reconfigure;
pub mod render;

pub use render::{GraphicsContext, ImageSurface, TextureId};

use crate::backends::audio::{AudioBackend, AudioSession, AudioSink, AudioStats, GstAudioBackend};
use crate::backends::video::{
    CaptureOutcome, DeviceSession, FrameInfo, SessionState, SkipReason, V4l2Backend, VideoBackend,
};
use crate::config::CaptureSettings;
use crate::errors::{CaptureError, CaptureResult};
use crate::media::{FrameGeometry, FrameHandoff};
use render::TextureState;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{info, warn};

/// Identifier the engine registers under
pub const SOURCE_ID: &str = "v4l2_mplane_source";
/// Human readable source name
pub const SOURCE_NAME: &str = "V4L2 mplane Camera";

/// Result of one `advance()` tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// A frame was converted and published
    Published(FrameInfo),
    /// No capture buffer was ready
    Retry,
    /// A buffer was dequeued but produced no frame
    Skipped(SkipReason),
    /// A reconfiguration holds the device
    Busy,
    /// No device session (failed reconfiguration or destroyed)
    Inactive,
    /// Dequeue failed outright
    Failed(CaptureError),
}

/// What an `update()` call changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Unchanged,
    /// Only the audio session was restarted
    AudioRestarted,
    /// Video and audio sessions were rebuilt
    Reconfigured,
}

/// Everything guarded by the device lock
struct DeviceState {
    settings: CaptureSettings,
    session: Option<DeviceSession>,
    audio: Option<AudioSession>,
}

/// One capture source: a video device, an optional audio device and the
/// frame handoff between them and the renderer
pub struct CaptureEngine {
    video_backend: Arc<dyn VideoBackend>,
    audio_backend: Option<Arc<dyn AudioBackend>>,
    audio_sink: Arc<dyn AudioSink>,
    device: Mutex<DeviceState>,
    handoff: FrameHandoff,
    reconfiguring: AtomicBool,
    width: AtomicU32,
    height: AtomicU32,
    texture: Mutex<TextureState>,
}

impl CaptureEngine {
    /// Open the device, negotiate, start streaming and start audio
    ///
    /// Fails if the video device cannot be brought up. An audio device that
    /// fails to open is logged and skipped.
    pub fn create(
        settings: CaptureSettings,
        video_backend: Arc<dyn VideoBackend>,
        audio_backend: Option<Arc<dyn AudioBackend>>,
        audio_sink: Arc<dyn AudioSink>,
    ) -> CaptureResult<Self> {
        settings.validate()?;
        info!(
            source = SOURCE_ID,
            device = %settings.device_path,
            resolution = %settings.resolution,
            "Creating capture engine"
        );

        let engine = Self {
            video_backend,
            audio_backend,
            audio_sink,
            device: Mutex::new(DeviceState {
                settings: settings.clone(),
                session: None,
                audio: None,
            }),
            handoff: FrameHandoff::new(),
            reconfiguring: AtomicBool::new(false),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            texture: Mutex::new(TextureState::default()),
        };

        {
            let mut device = engine.lock_device();
            let mut handoff = engine.handoff.exclusive();
            engine.bring_up(&mut device, &mut handoff, &settings)?;
        }
        Ok(engine)
    }

    /// Engine on the V4L2 device with ALSA audio through GStreamer
    pub fn with_hardware(
        settings: CaptureSettings,
        audio_sink: Arc<dyn AudioSink>,
    ) -> CaptureResult<Self> {
        let audio: Arc<dyn AudioBackend> = Arc::new(GstAudioBackend::new());
        Self::create(
            settings,
            Arc::new(V4l2Backend::new()),
            Some(audio),
            audio_sink,
        )
    }

    fn lock_device(&self) -> MutexGuard<'_, DeviceState> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Negotiated frame width
    pub fn width(&self) -> u32 {
        self.width.load(Ordering::Acquire)
    }

    /// Negotiated frame height
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// Whether a device session is streaming
    pub fn is_active(&self) -> bool {
        self.lock_device()
            .session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Streaming)
    }

    /// Whether an audio session is running
    pub fn is_audio_active(&self) -> bool {
        self.lock_device().audio.as_ref().is_some_and(|a| a.is_running())
    }

    /// Counters of the current audio session
    pub fn audio_stats(&self) -> Option<Arc<AudioStats>> {
        self.lock_device().audio.as_ref().map(|a| a.stats())
    }

    pub fn is_reconfiguring(&self) -> bool {
        self.reconfiguring.load(Ordering::Acquire)
    }

    /// Settings most recently applied
    pub fn settings(&self) -> CaptureSettings {
        self.lock_device().settings.clone()
    }

    /// Geometry of the frames currently flowing to the renderer
    pub fn frame_geometry(&self) -> FrameGeometry {
        self.handoff.geometry()
    }

    /// One capture tick: dequeue, convert into the back buffer, publish,
    /// requeue
    ///
    /// Never blocks: a reconfiguration in progress makes the tick a no-op.
    pub fn advance(&self) -> AdvanceOutcome {
        if self.reconfiguring.load(Ordering::Acquire) {
            return AdvanceOutcome::Busy;
        }
        let mut device = match self.device.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return AdvanceOutcome::Busy,
        };
        let Some(session) = device.session.as_mut() else {
            return AdvanceOutcome::Inactive;
        };

        let mut slot = self.handoff.begin_write();
        let result = session.capture_one(slot.as_mut().map(|s| s.pixels_mut()));

        match result {
            Ok(CaptureOutcome::Frame(info)) => {
                if let Some(slot) = slot {
                    slot.publish();
                }
                AdvanceOutcome::Published(info)
            }
            Ok(CaptureOutcome::Retry) => AdvanceOutcome::Retry,
            Ok(CaptureOutcome::Skipped(reason)) => AdvanceOutcome::Skipped(reason),
            Err(e) => {
                warn!(error = %e, "Capture tick failed");
                AdvanceOutcome::Failed(e)
            }
        }
    }

    /// Stop audio and video and release the frame buffers. Idempotent.
    ///
    /// Textures live in the host's graphics context and are released with
    /// [`CaptureEngine::release_graphics`].
    pub fn destroy(&self) {
        let _flag = reconfigure::ReconfiguringFlag::raise(&self.reconfiguring);
        let mut device = self.lock_device();
        let mut handoff = self.handoff.exclusive();
        if device.session.is_none() && device.audio.is_none() {
            return;
        }
        info!(source = SOURCE_ID, "Destroying capture engine");
        Self::shut_down(&mut device);
        handoff.clear();
    }

    /// Stop audio then video; failures are logged
    fn shut_down(device: &mut DeviceState) {
        if let Some(mut audio) = device.audio.take() {
            audio.stop();
        }
        if let Some(mut session) = device.session.take()
            && let Err(e) = session.stop()
        {
            warn!(error = %e, "Capture session did not stop cleanly");
        }
    }

    /// Start the audio session if enabled; failures leave video running
    fn start_audio(&self, settings: &CaptureSettings) -> Option<AudioSession> {
        if !settings.audio.enabled {
            return None;
        }
        let backend = self.audio_backend.as_ref()?;
        match AudioSession::start(backend.as_ref(), &settings.audio, Arc::clone(&self.audio_sink)) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Audio unavailable, continuing with video only");
                None
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}
