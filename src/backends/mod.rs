// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstraction layer for video and audio capture
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Capture Engine                │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                   │
//! │  ┌─────────────────┐  ┌──────────────────┐  │
//! │  │      Video      │  │      Audio       │  │
//! │  │ (V4L2 mplane /  │  │ (GStreamer ALSA /│  │
//! │  │   synthetic)    │  │    synthetic)    │  │
//! │  └─────────────────┘  └──────────────────┘  │
//! │          frame_loop: managed worker thread   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`video`]: device surface, buffer pool and device session
//! - [`audio`]: audio capture surface and the audio session worker
//! - [`frame_loop`]: start/stop/join of a named worker thread

pub mod audio;
pub mod frame_loop;
pub mod video;
