// SPDX-License-Identifier: GPL-3.0-only

//! Engine-wide constants

use std::time::Duration;

/// Capture buffer pool sizing
pub mod buffers {
    /// Buffers requested from the driver by default
    pub const DEFAULT_COUNT: u32 = 4;
    /// Upper bound on pool size; the driver may grant fewer, never more
    pub const MAX_COUNT: u32 = 8;
    /// Maximum planes per buffer the kernel may report (VIDEO_MAX_PLANES)
    pub const MAX_PLANES: usize = 8;
}

/// Timing used by the engine
pub mod timing {
    use super::Duration;

    /// Pause after tearing down a device so in-flight kernel work can drain
    pub const RECONFIGURE_SETTLE: Duration = Duration::from_millis(50);
    /// Upper bound on a single blocking audio read
    pub const AUDIO_READ_TIMEOUT: Duration = Duration::from_millis(500);
    /// Back-off after an audio stream reset that itself failed
    pub const AUDIO_RESET_BACKOFF: Duration = Duration::from_millis(20);
}

/// Default audio capture parameters (interleaved signed 16-bit)
pub mod audio {
    pub const SAMPLE_RATE: u32 = 48_000;
    pub const CHANNELS: u16 = 2;
    /// Frames per block handed to the sink
    pub const FRAMES_PER_BLOCK: u32 = 1024;
    /// Linear gain applied before the saturation clamp
    pub const DEFAULT_GAIN: f32 = 1.0;
    pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
}

/// Default device node of the capture hardware
pub const DEFAULT_DEVICE_PATH: &str = "/dev/video11";

/// Default audio capture device
pub const DEFAULT_AUDIO_DEVICE: &str = "default";

/// Bytes per output pixel (BGRA)
pub const OUTPUT_BYTES_PER_PIXEL: usize = 4;
