// SPDX-License-Identifier: GPL-3.0-only

//! Reconfiguration: tear down and rebuild the sessions for new settings
//!
//! Runs with the device lock and the handoff lock held together (in that
//! order), so neither a capture tick nor the renderer can touch a buffer
//! while it is being replaced. The "reconfiguring" flag is raised first and
//! lowered only after both locks are released.

use super::{CaptureEngine, DeviceState, UpdateOutcome};
use crate::backends::video::{CaptureLayout, DeviceSession};
use crate::config::CaptureSettings;
use crate::constants::timing::RECONFIGURE_SETTLE;
use crate::errors::{CaptureError, CaptureResult};
use crate::media::{FrameGeometry, HandoffGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Raises the reconfiguring flag; lowers it on drop
///
/// Declare before any lock guard so it is dropped after them.
pub(super) struct ReconfiguringFlag<'a>(&'a AtomicBool);

impl<'a> ReconfiguringFlag<'a> {
    pub(super) fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ReconfiguringFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Open, configure and start streaming on the device named in `settings`
fn start_video(
    engine: &CaptureEngine,
    settings: &CaptureSettings,
) -> CaptureResult<(DeviceSession, CaptureLayout)> {
    let (width, height) = settings.resolution.dimensions();
    let mut session = DeviceSession::open(engine.video_backend.as_ref(), &settings.device_path)?;
    let layout = session.configure(width, height, settings.effective_buffer_count())?;
    session.start_streaming()?;
    Ok((session, layout))
}

impl CaptureEngine {
    /// Apply new settings
    ///
    /// A changed device path, resolution or buffer count rebuilds both
    /// sessions; a change to audio settings alone restarts only audio.
    /// Invalid settings are rejected before anything is touched. If the
    /// rebuild fails the engine is left inert (no device open, reported
    /// width and height unchanged) until a later update succeeds; the
    /// failure is not retried.
    pub fn update(&self, settings: CaptureSettings) -> CaptureResult<UpdateOutcome> {
        settings.validate()?;

        let mut device = self.lock_device();
        let inert = device.session.is_none();

        if !inert && !device.settings.video_differs(&settings) {
            if device.settings.audio == settings.audio {
                device.settings = settings;
                return Ok(UpdateOutcome::Unchanged);
            }
            info!("Audio settings changed, restarting audio");
            if let Some(mut audio) = device.audio.take() {
                audio.stop();
            }
            device.audio = self.start_audio(&settings);
            device.settings = settings;
            return Ok(UpdateOutcome::AudioRestarted);
        }
        drop(device);

        self.reconfigure(settings)?;
        Ok(UpdateOutcome::Reconfigured)
    }

    /// Stop everything and rebuild from `settings`
    fn reconfigure(&self, settings: CaptureSettings) -> CaptureResult<()> {
        let _flag = ReconfiguringFlag::raise(&self.reconfiguring);
        let mut device = self.lock_device();
        let mut handoff = self.handoff.exclusive();

        info!(
            from_device = %device.settings.device_path,
            from_resolution = %device.settings.resolution,
            to_device = %settings.device_path,
            to_resolution = %settings.resolution,
            "Reconfiguring capture"
        );

        Self::shut_down(&mut device);
        // Let in-flight kernel work on the old buffers drain
        std::thread::sleep(RECONFIGURE_SETTLE);
        handoff.clear();

        match self.bring_up(&mut device, &mut handoff, &settings) {
            Ok(()) => {
                info!("Reconfiguration complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Reconfiguration failed, capture is inactive");
                Err(CaptureError::Reconfiguration(Box::new(e)))
            }
        }
    }

    /// Build the sessions and frame buffers for `settings`
    ///
    /// Requires both locks. On failure nothing is left running and the
    /// handoff is empty.
    pub(super) fn bring_up(
        &self,
        device: &mut DeviceState,
        handoff: &mut HandoffGuard<'_>,
        settings: &CaptureSettings,
    ) -> CaptureResult<()> {
        device.settings = settings.clone();

        let (session, layout) = match start_video(self, settings) {
            Ok(started) => started,
            Err(e) => {
                handoff.clear();
                return Err(e);
            }
        };

        // Output buffers follow the negotiated stride, not the requested width
        handoff.reallocate(FrameGeometry::new(
            layout.width,
            layout.height,
            layout.output_pitch(),
        ));
        self.width.store(layout.width, Ordering::Release);
        self.height.store(layout.height, Ordering::Release);

        device.session = Some(session);
        device.audio = self.start_audio(settings);

        info!(
            device = %settings.device_path,
            width = layout.width,
            height = layout.height,
            audio = device.audio.is_some(),
            "Capture running"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::audio::NullSink;
    use crate::backends::video::SyntheticBackend;
    use crate::config::Resolution;
    use std::sync::Arc;

    fn settings(resolution: Resolution) -> CaptureSettings {
        let mut settings = CaptureSettings::new("/dev/synthetic0", resolution);
        settings.audio.enabled = false;
        settings
    }

    #[test]
    fn test_flag_lowered_after_guards() {
        let flag = AtomicBool::new(false);
        {
            let _flag = ReconfiguringFlag::raise(&flag);
            assert!(flag.load(Ordering::Acquire));
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_unchanged_settings_are_noop() {
        let backend = Arc::new(SyntheticBackend::default());
        let engine = CaptureEngine::create(
            settings(Resolution::Vga),
            backend.clone(),
            None,
            Arc::new(NullSink),
        )
        .unwrap();
        assert_eq!(engine.update(settings(Resolution::Vga)).unwrap(), UpdateOutcome::Unchanged);
        assert_eq!(backend.stats().opened(), 1);
    }

    #[test]
    fn test_invalid_settings_touch_nothing() {
        let backend = Arc::new(SyntheticBackend::default());
        let engine = CaptureEngine::create(
            settings(Resolution::Vga),
            backend.clone(),
            None,
            Arc::new(NullSink),
        )
        .unwrap();
        let mut invalid = settings(Resolution::Hd);
        invalid.device_path = String::new();
        let result = engine.update(invalid);
        assert!(matches!(result, Err(CaptureError::InvalidSetting(_))));
        assert!(engine.is_active());
        assert_eq!(backend.stats().opened(), 1);
    }
}
