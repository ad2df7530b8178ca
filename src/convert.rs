//! 16-bit to 32-bit pixel conversion
//!
//! Each 5- or 6-bit channel is widened to 8 bits by replicating its high bits
//! into the low bits, so full intensity maps to 0xFF and zero stays zero.

use crate::rect::Rect;
use crate::surface::{Surface, SurfaceFormat};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("surface format {0:?} has no 16-bit conversion")]
    UnsupportedFormat(SurfaceFormat),

    #[error("conversion rectangle {rect:?} lies outside the visible area {area:?}")]
    OutsideArea { rect: Rect, area: Rect },

    #[error("conversion buffer holds {got} pixels, area needs {need}")]
    BufferTooSmall { need: usize, got: usize },
}

#[inline]
fn widen5(v: u32) -> u32 {
    (v << 3) | (v >> 2)
}

#[inline]
fn widen6(v: u32) -> u32 {
    (v << 2) | (v >> 4)
}

/// x1r5g5b5 to 0xFFRRGGBB
#[inline]
pub fn convert_555(pixel: u16) -> u32 {
    let p = pixel as u32;
    let r = widen5((p >> 10) & 0x1f);
    let g = widen5((p >> 5) & 0x1f);
    let b = widen5(p & 0x1f);
    0xFF00_0000 | (r << 16) | (g << 8) | b
}

/// r5g6b5 to 0xFFRRGGBB
#[inline]
pub fn convert_565(pixel: u16) -> u32 {
    let p = pixel as u32;
    let r = widen5((p >> 11) & 0x1f);
    let g = widen6((p >> 5) & 0x3f);
    let b = widen5(p & 0x1f);
    0xFF00_0000 | (r << 16) | (g << 8) | b
}

/// Convert `rect` of a 16-bit surface into `dest`, a buffer laid out as
/// `area.width * area.height` pixels starting at the area origin.
pub fn convert_region(
    surface: &Surface,
    area: Rect,
    rect: Rect,
    dest: &mut [u32],
) -> Result<(), ConvertError> {
    let convert: fn(u16) -> u32 = match surface.format {
        SurfaceFormat::Rgb16_555 => convert_555,
        SurfaceFormat::Rgb16_565 => convert_565,
        other => return Err(ConvertError::UnsupportedFormat(other)),
    };
    if rect.is_empty() {
        return Ok(());
    }
    if area.intersect(&rect) != Some(rect) || surface.bounds().intersect(&area) != Some(area) {
        return Err(ConvertError::OutsideArea { rect, area });
    }
    if dest.len() < area.area() {
        return Err(ConvertError::BufferTooSmall {
            need: area.area(),
            got: dest.len(),
        });
    }

    let src = surface.pixels.as_bytes();
    let stride = surface.stride as usize;
    let dest_stride = area.width as usize;

    for row in rect.y..rect.y + rect.height {
        let src_row = &src[row as usize * stride..];
        let dest_row = &mut dest[(row - area.y) as usize * dest_stride..];
        for col in rect.x..rect.x + rect.width {
            let off = col as usize * 2;
            let pixel = u16::from_le_bytes([src_row[off], src_row[off + 1]]);
            dest_row[(col - area.x) as usize] = convert(pixel);
        }
    }
    Ok(())
}
