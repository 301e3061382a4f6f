// SPDX-License-Identifier: GPL-3.0-only

//! Rendering delivered frames through the host's graphics context
//!
//! The texture is created lazily from the first delivered frame and
//! recreated whenever the frame geometry changes (after a reconfiguration).
//! Frames are BGRA with a row pitch that may exceed `width × 4`.

use super::CaptureEngine;
use crate::media::FrameGeometry;
use image::RgbaImage;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Handle of a texture owned by a [`GraphicsContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Texture operations the engine needs from the host
///
/// Calls happen only while the host is inside its graphics context, i.e.
/// from within [`CaptureEngine::render`] or
/// [`CaptureEngine::release_graphics`].
pub trait GraphicsContext {
    /// Create a BGRA texture with initial contents
    fn create_texture(&mut self, geometry: FrameGeometry, pixels: &[u8]) -> Option<TextureId>;

    /// Replace the contents of a texture of the same geometry
    fn upload_texture(&mut self, texture: TextureId, geometry: FrameGeometry, pixels: &[u8]);

    fn destroy_texture(&mut self, texture: TextureId);

    /// Draw the texture at its natural size
    fn draw(&mut self, texture: TextureId, width: u32, height: u32);
}

/// The engine's texture, guarded by its own lock
#[derive(Debug, Default)]
pub(super) struct TextureState {
    current: Option<(TextureId, FrameGeometry)>,
}

impl CaptureEngine {
    /// Upload a newly delivered frame, if any, and draw the texture
    ///
    /// Only takes the handoff lock, and only long enough to take the front
    /// buffer. Returns whether a new frame was uploaded.
    pub fn render(&self, gfx: &mut dyn GraphicsContext) -> bool {
        let mut texture = self.texture.lock().unwrap_or_else(|e| e.into_inner());

        let uploaded = self.handoff.consume(|frame| match texture.current.as_ref().copied() {
            Some((id, geometry)) if geometry == frame.geometry => {
                gfx.upload_texture(id, geometry, frame.pixels);
            }
            previous => {
                if let Some((id, _)) = previous {
                    debug!("Frame geometry changed, recreating texture");
                    gfx.destroy_texture(id);
                }
                texture.current = gfx
                    .create_texture(frame.geometry, frame.pixels)
                    .map(|id| (id, frame.geometry));
            }
        });

        if let Some((id, geometry)) = texture.current {
            gfx.draw(id, geometry.width, geometry.height);
        }
        uploaded
    }

    /// Destroy the texture; call from within the graphics context
    pub fn release_graphics(&self, gfx: &mut dyn GraphicsContext) {
        let mut texture = self.texture.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((id, _)) = texture.current.take() {
            gfx.destroy_texture(id);
        }
    }
}

/// CPU graphics context keeping textures as RGBA images
///
/// Used by the command-line host to snapshot frames, and by tests.
#[derive(Debug, Default)]
pub struct ImageSurface {
    textures: HashMap<TextureId, RgbaImage>,
    next_id: u64,
    last_drawn: Option<TextureId>,
    uploads: u64,
    draws: u64,
}

impl ImageSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a BGRA frame with row pitch into an RGBA image
    fn to_rgba(geometry: FrameGeometry, pixels: &[u8]) -> RgbaImage {
        let mut image = RgbaImage::new(geometry.width, geometry.height);
        let row_bytes = geometry.width as usize * 4;
        for (y, row) in image.rows_mut().enumerate() {
            let start = y * geometry.pitch;
            let Some(src) = pixels.get(start..start + row_bytes) else {
                break;
            };
            for (px, bgra) in row.zip(src.chunks_exact(4)) {
                px.0 = [bgra[2], bgra[1], bgra[0], bgra[3]];
            }
        }
        image
    }

    /// The most recently drawn frame
    pub fn frame(&self) -> Option<&RgbaImage> {
        self.textures.get(&self.last_drawn?)
    }

    /// Textures created and not yet destroyed
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Frames uploaded, creation included
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Save the most recently drawn frame as an image file
    pub fn save(&self, path: &Path) -> Result<(), image::ImageError> {
        match self.frame() {
            Some(frame) => frame.save(path),
            None => Err(image::ImageError::IoError(std::io::Error::other(
                "no frame has been drawn yet",
            ))),
        }
    }
}

impl GraphicsContext for ImageSurface {
    fn create_texture(&mut self, geometry: FrameGeometry, pixels: &[u8]) -> Option<TextureId> {
        if geometry.width == 0 || geometry.height == 0 {
            return None;
        }
        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.textures.insert(id, Self::to_rgba(geometry, pixels));
        self.uploads += 1;
        Some(id)
    }

    fn upload_texture(&mut self, texture: TextureId, geometry: FrameGeometry, pixels: &[u8]) {
        if let Some(image) = self.textures.get_mut(&texture) {
            *image = Self::to_rgba(geometry, pixels);
            self.uploads += 1;
        }
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        if self.last_drawn == Some(texture) {
            self.last_drawn = None;
        }
    }

    fn draw(&mut self, texture: TextureId, _width: u32, _height: u32) {
        if self.textures.contains_key(&texture) {
            self.last_drawn = Some(texture);
            self.draws += 1;
        }
    }
}
