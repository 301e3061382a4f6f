// SPDX-License-Identifier: GPL-3.0-only

//! NV12 to packed BGRA conversion
//!
//! Integer BT.601 (studio range) transform. Each 2×2 block of luma samples
//! shares one interleaved U/V pair. The output row pitch is the luma stride
//! times four, so driver row padding carries through instead of shrinking
//! the output buffer below what the stride implies.

use crate::backends::video::CaptureLayout;
use std::fmt;

/// Inputs that cannot hold the frame described by the layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    LumaTooShort { needed: usize, got: usize },
    ChromaTooShort { needed: usize, got: usize },
    OutputTooShort { needed: usize, got: usize },
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::LumaTooShort { needed, got } => {
                write!(f, "luma plane has {} bytes, {} needed", got, needed)
            }
            ConvertError::ChromaTooShort { needed, got } => {
                write!(f, "chroma plane has {} bytes, {} needed", got, needed)
            }
            ConvertError::OutputTooShort { needed, got } => {
                write!(f, "output buffer has {} bytes, {} needed", got, needed)
            }
        }
    }
}

impl std::error::Error for ConvertError {}

#[inline(always)]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert one YUV sample to (r, g, b)
#[inline(always)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

/// Convert one NV12 frame into `dst` as BGRA with opaque alpha
///
/// `dst` must hold at least [`CaptureLayout::output_len`] bytes. Pixels past
/// the frame width (row padding) are left untouched. Does not allocate.
pub fn nv12_to_bgra(
    luma: &[u8],
    chroma: &[u8],
    layout: &CaptureLayout,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    let width = layout.width as usize;
    let height = layout.height as usize;
    let stride_y = layout.stride_y;
    let stride_uv = layout.stride_uv;
    let pitch = layout.output_pitch();

    if height == 0 || width == 0 {
        return Ok(());
    }

    // Last row only needs `width` bytes, not a full stride
    let luma_needed = stride_y * (height - 1) + width;
    let chroma_needed = stride_uv * ((height - 1) / 2) + width.div_ceil(2) * 2;
    let out_needed = pitch * (height - 1) + width * 4;

    if luma.len() < luma_needed {
        return Err(ConvertError::LumaTooShort {
            needed: luma_needed,
            got: luma.len(),
        });
    }
    if chroma.len() < chroma_needed {
        return Err(ConvertError::ChromaTooShort {
            needed: chroma_needed,
            got: chroma.len(),
        });
    }
    if dst.len() < out_needed {
        return Err(ConvertError::OutputTooShort {
            needed: out_needed,
            got: dst.len(),
        });
    }

    for j in 0..height {
        let y_row = &luma[j * stride_y..j * stride_y + width];
        let uv_start = (j / 2) * stride_uv;
        let uv_row = &chroma[uv_start..uv_start + width.div_ceil(2) * 2];
        let out_row = &mut dst[j * pitch..j * pitch + width * 4];

        for (i, (&y, px)) in y_row.iter().zip(out_row.chunks_exact_mut(4)).enumerate() {
            let uv = (i / 2) * 2;
            let (r, g, b) = yuv_to_rgb(y, uv_row[uv], uv_row[uv + 1]);
            px[0] = b;
            px[1] = g;
            px[2] = r;
            px[3] = 255;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::video::PIX_FMT_NV12;

    fn layout(width: u32, height: u32, stride: usize) -> CaptureLayout {
        CaptureLayout {
            width,
            height,
            pixel_format: PIX_FMT_NV12,
            plane_count: 1,
            stride_y: stride,
            stride_uv: stride,
            chroma_offset: Some(stride * height as usize),
        }
    }

    fn convert_uniform(y: u8, u: u8, v: u8) -> Vec<u8> {
        let layout = layout(8, 6, 8);
        let luma = vec![y; layout.luma_len()];
        let chroma: Vec<u8> = (0..layout.chroma_len())
            .map(|i| if i % 2 == 0 { u } else { v })
            .collect();
        let mut out = vec![0u8; layout.output_len()];
        nv12_to_bgra(&luma, &chroma, &layout, &mut out).unwrap();
        out
    }

    #[test]
    fn test_white_converts_to_white() {
        let out = convert_uniform(235, 128, 128);
        assert!(out.chunks_exact(4).all(|px| px == [255, 255, 255, 255]));
    }

    #[test]
    fn test_black_converts_to_black() {
        let out = convert_uniform(16, 128, 128);
        assert!(out.chunks_exact(4).all(|px| px == [0, 0, 0, 255]));
    }

    #[test]
    fn test_channel_order_is_bgra() {
        // Strong V pushes red up and blue down
        let px = &convert_uniform(128, 128, 240)[..4];
        assert!(px[2] > px[0], "red {} should exceed blue {}", px[2], px[0]);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn test_chroma_shared_by_2x2_block() {
        let layout = layout(4, 4, 4);
        let luma = vec![128u8; layout.luma_len()];
        // Left pair neutral, right pair saturated blue
        let chroma = vec![128, 128, 240, 128, 128, 128, 240, 128];
        let mut out = vec![0u8; layout.output_len()];
        nv12_to_bgra(&luma, &chroma, &layout, &mut out).unwrap();

        let pixel = |x: usize, y: usize| &out[y * 16 + x * 4..y * 16 + x * 4 + 4];
        assert_eq!(pixel(0, 0), pixel(1, 1));
        assert_eq!(pixel(2, 0), pixel(3, 1));
        assert_ne!(pixel(1, 0), pixel(2, 0));
    }

    #[test]
    fn test_row_padding_is_skipped() {
        let layout = layout(4, 2, 8);
        let mut luma = vec![16u8; layout.luma_len()];
        // Padding bytes are white; they must not leak into the frame
        for row in 0..2 {
            luma[row * 8 + 4..row * 8 + 8].fill(235);
        }
        let chroma = vec![128u8; layout.chroma_len()];
        let mut out = vec![7u8; layout.output_len()];
        nv12_to_bgra(&luma, &chroma, &layout, &mut out).unwrap();

        assert_eq!(layout.output_pitch(), 32);
        for row in 0..2 {
            let visible = &out[row * 32..row * 32 + 16];
            assert!(visible.chunks_exact(4).all(|px| px == [0, 0, 0, 255]));
            assert!(out[row * 32 + 16..row * 32 + 32].iter().all(|&b| b == 7));
        }
    }

    #[test]
    fn test_short_planes_are_rejected() {
        let layout = layout(8, 6, 8);
        let luma = vec![0u8; layout.luma_len() - 1];
        let chroma = vec![128u8; layout.chroma_len()];
        let mut out = vec![0u8; layout.output_len()];
        assert!(matches!(
            nv12_to_bgra(&luma, &chroma, &layout, &mut out),
            Err(ConvertError::LumaTooShort { .. })
        ));

        let luma = vec![0u8; layout.luma_len()];
        let mut small = vec![0u8; 16];
        assert!(matches!(
            nv12_to_bgra(&luma, &chroma, &layout, &mut small),
            Err(ConvertError::OutputTooShort { .. })
        ));
    }

    #[test]
    fn test_odd_dimensions() {
        let layout = layout(5, 3, 6);
        let luma = vec![235u8; layout.luma_len()];
        let chroma = vec![128u8; layout.chroma_len()];
        let mut out = vec![0u8; layout.output_len()];
        nv12_to_bgra(&luma, &chroma, &layout, &mut out).unwrap();
        assert_eq!(&out[4 * 4..4 * 4 + 4], &[255, 255, 255, 255]);
    }
}
