// SPDX-License-Identifier: GPL-3.0-only

//! Frame processing between the capture device and the renderer
//!
//! # Color Space Conversion
//!
//! Capture buffers arrive as NV12 (YUV 4:2:0). [`convert`] turns one buffer
//! into a packed BGRA frame with the integer BT.601 transform, writing into a
//! caller-provided buffer so the per-frame path never allocates.
//!
//! # Frame Handoff
//!
//! [`handoff`] moves finished frames from the capture tick to the renderer
//! through a double buffer guarded by one lock.

pub mod convert;
pub mod handoff;

pub use convert::{ConvertError, nv12_to_bgra};
pub use handoff::{FrameGeometry, FrameHandoff, FrameView, HandoffGuard, WriteSlot};
