// SPDX-License-Identifier: GPL-3.0-only

//! Audio capture session
//!
//! Opening happens on the caller's thread so an unusable device is reported
//! immediately. The read loop then runs on a [`WorkerLoop`]; stopping joins
//! it, so shutdown takes at most one read.

use super::{AudioBackend, AudioBlock, AudioCapture, AudioReadError, AudioSink};
use super::{apply_gain, block_timestamp, monotonic_ns};
use crate::backends::frame_loop::{LoopAction, WorkerLoop};
use crate::config::AudioSettings;
use crate::constants::timing::AUDIO_RESET_BACKOFF;
use crate::errors::{CaptureError, CaptureResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Counters of one audio session
#[derive(Debug, Default)]
pub struct AudioStats {
    blocks: AtomicU64,
    transient_failures: AtomicU64,
}

impl AudioStats {
    /// Blocks handed to the sink
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Reads that failed and triggered a reset
    pub fn transient_failures(&self) -> u64 {
        self.transient_failures.load(Ordering::Relaxed)
    }
}

/// State owned by the worker thread
struct AudioWorker {
    capture: Box<dyn AudioCapture>,
    sink: Arc<dyn AudioSink>,
    block: Vec<i16>,
    frames_per_block: u32,
    channels: u16,
    sample_rate: u32,
    gain: f32,
    start_ns: u64,
    /// Frames emitted since the session started
    frames_emitted: u64,
    stats: Arc<AudioStats>,
}

impl AudioWorker {
    fn step(&mut self) -> LoopAction {
        if let Err(AudioReadError::Transient(reason)) = self.capture.read_block(&mut self.block) {
            self.stats.transient_failures.fetch_add(1, Ordering::Relaxed);
            warn!(reason = %reason, "Audio read failed, resetting stream");
            if let Err(e) = self.capture.reset() {
                warn!(error = %e, "Audio stream reset failed");
                std::thread::sleep(AUDIO_RESET_BACKOFF);
            }
            return LoopAction::Continue;
        }

        apply_gain(&mut self.block, self.gain);
        let block = AudioBlock {
            samples: self.block.clone(),
            frames: self.frames_per_block,
            channels: self.channels,
            sample_rate: self.sample_rate,
            timestamp_ns: block_timestamp(self.start_ns, self.frames_emitted, self.sample_rate),
        };
        self.sink.output_audio(&block);
        self.frames_emitted += self.frames_per_block as u64;
        self.stats.blocks.fetch_add(1, Ordering::Relaxed);
        LoopAction::Continue
    }
}

/// A running audio capture
pub struct AudioSession {
    worker: Option<WorkerLoop>,
    stats: Arc<AudioStats>,
}

impl AudioSession {
    /// Open the audio device and start the worker
    pub fn start(
        backend: &dyn AudioBackend,
        settings: &AudioSettings,
        sink: Arc<dyn AudioSink>,
    ) -> CaptureResult<Self> {
        let capture = backend.open(settings)?;
        let stats = Arc::new(AudioStats::default());

        let samples = settings.frames_per_block as usize * settings.channels as usize;
        let worker = AudioWorker {
            capture,
            sink,
            block: vec![0; samples],
            frames_per_block: settings.frames_per_block,
            channels: settings.channels,
            sample_rate: settings.sample_rate,
            gain: settings.gain,
            start_ns: monotonic_ns(),
            frames_emitted: 0,
            stats: Arc::clone(&stats),
        };

        let worker = WorkerLoop::spawn("audio-capture", worker, AudioWorker::step)
            .map_err(|e| CaptureError::AudioOpen(format!("Failed to spawn audio thread: {}", e)))?;

        info!(
            backend = backend.name(),
            device = %settings.device,
            rate = settings.sample_rate,
            channels = settings.channels,
            gain = settings.gain,
            "Audio session started"
        );
        Ok(Self {
            worker: Some(worker),
            stats,
        })
    }

    pub fn stats(&self) -> Arc<AudioStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_running())
    }

    /// Stop the worker and close the device. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!(blocks = self.stats.blocks(), "Audio session stopped");
        }
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.stop();
    }
}
