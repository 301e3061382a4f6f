// SPDX-License-Identifier: GPL-3.0-only

//! Multi-planar V4L2 capture engine
//!
//! Captures NV12 frames from a V4L2 multi-planar device through
//! memory-mapped kernel buffers, converts them to BGRA and hands them to a
//! renderer through a double buffer. Audio is captured concurrently on its
//! own worker. Settings can be changed while running; the engine tears the
//! device down and rebuilds it without racing the capture tick or the
//! renderer.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`engine`]: the entry points a host drives (create, update, destroy,
//!   advance, render)
//! - [`backends`]: video and audio device access
//! - [`media`]: pixel conversion and the frame handoff
//! - [`config`]: capture settings and the recognized options
//! - [`errors`]: the error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use mplane_camera::backends::audio::NullSink;
//! use mplane_camera::config::{CaptureSettings, Resolution};
//! use mplane_camera::engine::{CaptureEngine, ImageSurface};
//! use std::sync::Arc;
//!
//! let settings = CaptureSettings::new("/dev/video11", Resolution::Hd);
//! let engine = CaptureEngine::with_hardware(settings, Arc::new(NullSink))?;
//! let mut surface = ImageSurface::new();
//! engine.advance();
//! engine.render(&mut surface);
//! engine.release_graphics(&mut surface);
//! engine.destroy();
//! # Ok::<(), mplane_camera::CaptureError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod media;

// Re-export commonly used types
pub use config::{CaptureSettings, Resolution};
pub use engine::{AdvanceOutcome, CaptureEngine, UpdateOutcome};
pub use errors::{CaptureError, CaptureResult};
