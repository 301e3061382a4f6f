// SPDX-License-Identifier: GPL-3.0-only

//! Generated audio for running without a sound card
//!
//! Produces a sine tone (or a constant level) at the configured format.
//! Reads can be paced to real time, and chosen reads can be made to fail so
//! the reset path of the audio worker can be exercised.

use super::{AudioBackend, AudioCapture, AudioReadError};
use crate::config::AudioSettings;
use crate::errors::{CaptureError, CaptureResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SyntheticAudioConfig {
    pub frequency_hz: f64,
    /// Peak level as a fraction of full scale
    pub amplitude: f64,
    /// Emit this sample everywhere instead of a tone
    pub constant: Option<i16>,
    /// Sleep so blocks arrive at the real sample rate
    pub pace: bool,
    /// Zero-based read numbers that fail with a transient error
    pub fail_reads: Vec<usize>,
    pub fail_open: bool,
    /// Resets that fail before one succeeds
    pub failing_resets: usize,
}

impl Default for SyntheticAudioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 0.25,
            constant: None,
            pace: true,
            fail_reads: Vec::new(),
            fail_open: false,
            failing_resets: 0,
        }
    }
}

/// Counters shared by every handle a backend opened
#[derive(Debug, Default)]
pub struct SyntheticAudioStats {
    opened: AtomicUsize,
    reads: AtomicUsize,
    resets: AtomicUsize,
}

impl SyntheticAudioStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Read attempts, failed ones included
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

pub struct SyntheticAudioBackend {
    config: Mutex<SyntheticAudioConfig>,
    stats: Arc<SyntheticAudioStats>,
}

impl SyntheticAudioBackend {
    pub fn new(config: SyntheticAudioConfig) -> Self {
        Self {
            config: Mutex::new(config),
            stats: Arc::new(SyntheticAudioStats::default()),
        }
    }

    pub fn set_config(&self, config: SyntheticAudioConfig) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn stats(&self) -> Arc<SyntheticAudioStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for SyntheticAudioBackend {
    fn default() -> Self {
        Self::new(SyntheticAudioConfig::default())
    }
}

impl AudioBackend for SyntheticAudioBackend {
    fn open(&self, settings: &AudioSettings) -> CaptureResult<Box<dyn AudioCapture>> {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if config.fail_open {
            return Err(CaptureError::AudioOpen(format!(
                "no such audio device: {}",
                settings.device
            )));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticAudioCapture {
            failing_resets: config.failing_resets,
            config,
            stats: Arc::clone(&self.stats),
            sample_rate: settings.sample_rate.max(1),
            channels: settings.channels.max(1) as usize,
            phase: 0.0,
            reads: 0,
            next_deadline: None,
        }))
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

struct SyntheticAudioCapture {
    config: SyntheticAudioConfig,
    stats: Arc<SyntheticAudioStats>,
    sample_rate: u32,
    channels: usize,
    phase: f64,
    reads: usize,
    failing_resets: usize,
    next_deadline: Option<Instant>,
}

impl SyntheticAudioCapture {
    fn pace(&mut self, frames: usize) {
        let block = Duration::from_secs_f64(frames as f64 / self.sample_rate as f64);
        let deadline = self.next_deadline.unwrap_or_else(Instant::now) + block;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline);
    }
}

impl AudioCapture for SyntheticAudioCapture {
    fn read_block(&mut self, block: &mut [i16]) -> Result<(), AudioReadError> {
        let read = self.reads;
        self.reads += 1;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_reads.contains(&read) {
            return Err(AudioReadError::Transient(format!("injected failure on read {}", read)));
        }

        let frames = block.len() / self.channels;
        let step = 2.0 * std::f64::consts::PI * self.config.frequency_hz / self.sample_rate as f64;
        for frame in block.chunks_mut(self.channels) {
            let sample = match self.config.constant {
                Some(value) => value,
                None => (self.phase.sin() * self.config.amplitude * i16::MAX as f64) as i16,
            };
            frame.fill(sample);
            self.phase = (self.phase + step) % (2.0 * std::f64::consts::PI);
        }

        if self.config.pace {
            self.pace(frames);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), String> {
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
        self.next_deadline = None;
        if self.failing_resets > 0 {
            self.failing_resets -= 1;
            return Err("injected reset failure".into());
        }
        Ok(())
    }
}
