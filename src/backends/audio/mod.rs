// SPDX-License-Identifier: GPL-3.0-only

//! Audio capture
//!
//! An [`AudioSession`] owns one capture handle and a worker thread that
//! reads fixed-size blocks of interleaved signed 16-bit samples, applies a
//! linear gain, stamps each block and hands it to an [`AudioSink`]. Audio
//! runs independently of video; a failing audio device never stops capture.
//!
//! # Modules
//!
//! - [`gst`]: ALSA capture through a GStreamer appsink pipeline
//! - [`synthetic`]: generated tone for tests and hardware-less runs
//! - [`session`]: the worker and its start/stop contract

pub mod gst;
pub mod session;
pub mod synthetic;

pub use gst::GstAudioBackend;
pub use session::{AudioSession, AudioStats};
pub use synthetic::{SyntheticAudioBackend, SyntheticAudioConfig};

use crate::config::AudioSettings;
use crate::constants::audio::NANOS_PER_SECOND;
use crate::errors::CaptureResult;
use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use tracing::debug;

/// One block of captured audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    /// Interleaved samples, `frames × channels` long
    pub samples: Vec<i16>,
    pub frames: u32,
    pub channels: u16,
    pub sample_rate: u32,
    /// Monotonic capture time of the first frame in nanoseconds
    pub timestamp_ns: u64,
}

/// A read that failed but may succeed after a stream reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioReadError {
    Transient(String),
}

impl fmt::Display for AudioReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioReadError::Transient(reason) => write!(f, "transient read failure: {}", reason),
        }
    }
}

impl std::error::Error for AudioReadError {}

/// An open, running audio capture handle; closed on drop
pub trait AudioCapture: Send {
    /// Fill `block` with interleaved samples, blocking until it is full
    fn read_block(&mut self, block: &mut [i16]) -> Result<(), AudioReadError>;

    /// Restart the stream after a failed read
    fn reset(&mut self) -> Result<(), String>;
}

/// Opens audio capture handles
pub trait AudioBackend: Send + Sync {
    fn open(&self, settings: &AudioSettings) -> CaptureResult<Box<dyn AudioCapture>>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Receives finished audio blocks
pub trait AudioSink: Send + Sync {
    fn output_audio(&self, block: &AudioBlock);
}

/// Sink that forwards blocks over a bounded channel, dropping when full
pub struct ChannelSink {
    sender: SyncSender<AudioBlock>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<AudioBlock>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (Self { sender }, receiver)
    }
}

impl AudioSink for ChannelSink {
    fn output_audio(&self, block: &AudioBlock) {
        match self.sender.try_send(block.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(timestamp_ns = block.timestamp_ns, "Audio consumer behind, dropping block");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn output_audio(&self, _block: &AudioBlock) {}
}

/// Multiply every sample by `gain`, saturating at the i16 range
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (*sample as f32 * gain).round();
        *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Timestamp of a block that starts after `frames_emitted` frames
///
/// Computed from the running frame count rather than by accumulating
/// per-block durations, so rounding never drifts.
pub fn block_timestamp(start_ns: u64, frames_emitted: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return start_ns;
    }
    let offset = frames_emitted as u128 * NANOS_PER_SECOND as u128 / sample_rate as u128;
    start_ns.saturating_add(offset as u64)
}

/// Current CLOCK_MONOTONIC time in nanoseconds
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * NANOS_PER_SECOND + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_saturates() {
        let mut samples = [1000, -1000, 20_000, -20_000, i16::MAX, i16::MIN];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, [2000, -2000, i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_unity_gain_is_identity() {
        let mut samples = [1, -1, 12345];
        apply_gain(&mut samples, 1.0);
        assert_eq!(samples, [1, -1, 12345]);
    }

    #[test]
    fn test_block_timestamps() {
        assert_eq!(block_timestamp(1_000, 0, 48_000), 1_000);
        assert_eq!(block_timestamp(1_000, 48_000, 48_000), 1_000 + NANOS_PER_SECOND);
        // 1024 frames at 44.1 kHz do not divide evenly; no drift over many blocks
        let after_many = block_timestamp(0, 1024 * 44_100, 44_100);
        assert_eq!(after_many, 1024 * NANOS_PER_SECOND);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, receiver) = ChannelSink::new(1);
        let block = AudioBlock {
            samples: vec![0; 4],
            frames: 2,
            channels: 2,
            sample_rate: 48_000,
            timestamp_ns: 0,
        };
        sink.output_audio(&block);
        sink.output_audio(&AudioBlock {
            timestamp_ns: 1,
            ..block.clone()
        });
        assert_eq!(receiver.try_recv().unwrap().timestamp_ns, 0);
        assert!(receiver.try_recv().is_err());
    }
}
