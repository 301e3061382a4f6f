// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for the capture engine
//!
//! This module provides command-line functionality for:
//! - Listing video nodes
//! - Printing the recognized options
//! - Running a headless capture session

use mplane_camera::backends::audio::{AudioBackend, AudioBlock, AudioSink, SyntheticAudioBackend};
use mplane_camera::backends::frame_loop::{LoopAction, WorkerLoop};
use mplane_camera::backends::video::SyntheticBackend;
use mplane_camera::backends::video::v4l2_utils::list_capture_devices;
use mplane_camera::config::{self, CaptureSettings, Resolution};
use mplane_camera::engine::{AdvanceOutcome, CaptureEngine, ImageSurface};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// List video nodes, multi-planar capture nodes first
pub fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    let devices = list_capture_devices();

    if devices.is_empty() {
        println!("No video devices found.");
        return Ok(());
    }

    println!("Video devices:");
    println!();
    for device in &devices {
        let kind = if device.multiplanar {
            "multi-planar capture"
        } else {
            "not multi-planar"
        };
        println!("  {}  {}", device.path, device.card);
        println!("      Driver: {} ({})", device.driver, device.bus_info);
        println!("      {}", kind);
        println!();
    }

    Ok(())
}

/// Print the recognized options and their defaults as JSON
pub fn print_properties() -> Result<(), Box<dyn std::error::Error>> {
    let listing = serde_json::json!({
        "properties": config::properties(),
        "defaults": CaptureSettings::default(),
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

/// Options of the `run` command
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub device: Option<String>,
    pub resolution: Option<Resolution>,
    /// Stop after this many capture ticks
    pub frames: Option<u64>,
    pub fps: u32,
    pub synthetic: bool,
    pub no_audio: bool,
    pub snapshot: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

impl RunOptions {
    /// Settings file contents with command-line overrides applied
    fn settings(&self) -> CaptureSettings {
        let mut settings = match self.config.clone().or_else(CaptureSettings::default_path) {
            Some(path) => CaptureSettings::load_or_default(&path),
            None => CaptureSettings::default(),
        };
        if let Some(device) = &self.device {
            settings.device_path = device.clone();
        }
        if let Some(resolution) = self.resolution {
            settings.resolution = resolution;
        }
        if self.no_audio {
            settings.audio.enabled = false;
        }
        settings
    }
}

/// Audio sink that only counts what it receives
#[derive(Debug, Default)]
struct CountingSink {
    blocks: AtomicU64,
    frames: AtomicU64,
}

impl AudioSink for CountingSink {
    fn output_audio(&self, block: &AudioBlock) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.frames.fetch_add(block.frames as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct TickCounters {
    ticks: AtomicU64,
    published: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Capture a session: advance on a worker thread, render on this one
pub fn run(options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let settings = options.settings();
    let sink = Arc::new(CountingSink::default());

    let engine = if options.synthetic {
        let audio: Arc<dyn AudioBackend> = Arc::new(SyntheticAudioBackend::default());
        CaptureEngine::create(
            settings,
            Arc::new(SyntheticBackend::default()),
            Some(audio),
            sink.clone(),
        )?
    } else {
        CaptureEngine::with_hardware(settings, sink.clone())?
    };
    let engine = Arc::new(engine);

    println!(
        "Capturing {}x{} from {}{}",
        engine.width(),
        engine.height(),
        engine.settings().device_path,
        if engine.is_audio_active() { " with audio" } else { "" }
    );
    println!("Press Ctrl+C to stop");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    let interval = Duration::from_secs_f64(1.0 / options.fps.max(1) as f64);
    let counters = Arc::new(TickCounters::default());
    let mut ticker = {
        let engine = Arc::clone(&engine);
        let counters = Arc::clone(&counters);
        let limit = options.frames;
        WorkerLoop::spawn("capture-tick", (), move |_| {
            if limit.is_some_and(|max| counters.ticks.load(Ordering::Relaxed) >= max) {
                return LoopAction::Stop;
            }
            match engine.advance() {
                AdvanceOutcome::Published(info) => {
                    debug!(index = info.index, "Frame published");
                    counters.published.fetch_add(1, Ordering::Relaxed);
                }
                AdvanceOutcome::Skipped(reason) => {
                    debug!(reason = %reason, "Frame skipped");
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
                AdvanceOutcome::Failed(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                AdvanceOutcome::Retry | AdvanceOutcome::Busy | AdvanceOutcome::Inactive => {}
            }
            counters.ticks.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(interval);
            LoopAction::Continue
        })?
    };

    let started = Instant::now();
    let mut surface = ImageSurface::new();
    while ticker.is_running() && !interrupted.load(Ordering::SeqCst) {
        engine.render(&mut surface);
        std::thread::sleep(interval);
    }
    ticker.stop();
    engine.render(&mut surface);

    if let Some(path) = &options.snapshot {
        match surface.save(path) {
            Ok(()) => println!("Saved last frame to {}", path.display()),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not save snapshot"),
        }
    }

    engine.release_graphics(&mut surface);
    engine.destroy();

    let elapsed = started.elapsed().as_secs_f64();
    let published = counters.published.load(Ordering::Relaxed);
    println!();
    println!("Ticks:          {}", counters.ticks.load(Ordering::Relaxed));
    println!(
        "Video frames:   {} ({:.1} fps)",
        published,
        if elapsed > 0.0 { published as f64 / elapsed } else { 0.0 }
    );
    println!("Frames drawn:   {}", surface.uploads());
    println!("Skipped:        {}", counters.skipped.load(Ordering::Relaxed));
    println!("Failed ticks:   {}", counters.failed.load(Ordering::Relaxed));
    println!(
        "Audio blocks:   {} ({} frames)",
        sink.blocks.load(Ordering::Relaxed),
        sink.frames.load(Ordering::Relaxed)
    );

    Ok(())
}
