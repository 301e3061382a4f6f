// SPDX-License-Identifier: GPL-3.0-only

//! ALSA capture through GStreamer
//!
//! ```text
//! alsasrc → audioconvert → audioresample → S16LE interleaved caps → appsink
//! ```
//!
//! Each read pulls samples from the appsink with a timeout, so a stalled
//! device surfaces as a transient failure instead of blocking the worker
//! forever.

use super::{AudioBackend, AudioCapture, AudioReadError};
use crate::config::AudioSettings;
use crate::constants::timing::AUDIO_READ_TIMEOUT;
use crate::errors::{CaptureError, CaptureResult};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Opens ALSA devices through a GStreamer pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct GstAudioBackend;

impl GstAudioBackend {
    pub fn new() -> Self {
        Self
    }

    fn pipeline_description(settings: &AudioSettings) -> String {
        format!(
            "alsasrc device=\"{}\" ! audioconvert ! audioresample ! \
             audio/x-raw,format=S16LE,layout=interleaved,channels={},rate={} ! \
             appsink name=sink sync=false max-buffers=8",
            settings.device, settings.channels, settings.sample_rate
        )
    }
}

impl AudioBackend for GstAudioBackend {
    fn open(&self, settings: &AudioSettings) -> CaptureResult<Box<dyn AudioCapture>> {
        use gstreamer::prelude::*;

        gstreamer::init()
            .map_err(|e| CaptureError::AudioOpen(format!("GStreamer init failed: {}", e)))?;

        let description = Self::pipeline_description(settings);
        debug!(pipeline = %description, "Creating audio pipeline");

        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| CaptureError::AudioOpen(format!("Failed to create pipeline: {}", e)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::AudioOpen("Failed to downcast to Pipeline".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::AudioOpen("Failed to find appsink".into()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| CaptureError::AudioOpen("Failed to downcast to AppSink".into()))?;

        if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(CaptureError::AudioOpen(format!(
                "Failed to start audio device {}: {:?}",
                settings.device, e
            )));
        }

        info!(
            device = %settings.device,
            rate = settings.sample_rate,
            channels = settings.channels,
            "Audio capture started"
        );
        Ok(Box::new(GstAudioCapture {
            pipeline,
            appsink,
            pending: VecDeque::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "gstreamer-alsa"
    }
}

struct GstAudioCapture {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    /// Samples pulled from the appsink but not yet handed out
    pending: VecDeque<i16>,
}

impl GstAudioCapture {
    fn pull(&mut self) -> Result<(), AudioReadError> {
        let timeout = gstreamer::ClockTime::from_mseconds(AUDIO_READ_TIMEOUT.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            let reason = if self.appsink.is_eos() {
                "end of stream"
            } else {
                "timed out waiting for samples"
            };
            return Err(AudioReadError::Transient(reason.into()));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| AudioReadError::Transient("No buffer in sample".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| AudioReadError::Transient("Failed to map buffer".into()))?;

        self.pending.extend(
            map.as_slice()
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );
        Ok(())
    }
}

impl AudioCapture for GstAudioCapture {
    fn read_block(&mut self, block: &mut [i16]) -> Result<(), AudioReadError> {
        let mut filled = 0;
        while filled < block.len() {
            if self.pending.is_empty() {
                self.pull()?;
            }
            let n = (block.len() - filled).min(self.pending.len());
            for (dst, src) in block[filled..filled + n].iter_mut().zip(self.pending.drain(..n)) {
                *dst = src;
            }
            filled += n;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), String> {
        use gstreamer::prelude::*;

        self.pending.clear();
        self.pipeline
            .set_state(gstreamer::State::Null)
            .map_err(|e| format!("Failed to stop audio pipeline: {:?}", e))?;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| format!("Failed to restart audio pipeline: {:?}", e))?;
        debug!("Audio pipeline restarted");
        Ok(())
    }
}

impl Drop for GstAudioCapture {
    fn drop(&mut self) {
        use gstreamer::prelude::*;
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        debug!("Audio pipeline closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_description() {
        let settings = AudioSettings {
            device: "hw:1,0".into(),
            sample_rate: 44_100,
            channels: 1,
            ..AudioSettings::default()
        };
        let description = GstAudioBackend::pipeline_description(&settings);
        assert!(description.starts_with("alsasrc device=\"hw:1,0\""));
        assert!(description.contains("format=S16LE,layout=interleaved,channels=1,rate=44100"));
        assert!(description.contains("appsink name=sink"));
    }
}
