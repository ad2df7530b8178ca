//! Server-side cursor overlay
//!
//! In server mouse mode the guest cursor is not part of the framebuffer; the
//! server sends its shape and position separately and the viewer draws it on
//! top while the pointer is grabbed.

use crate::error::ProtocolError;
use crate::rect::Rect;
use crate::scaling::ScaleState;

/// Mouse mode wire values
pub const MOUSE_MODE_SERVER: u32 = 1;
pub const MOUSE_MODE_CLIENT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseMode {
    #[default]
    Server,
    Client,
}

impl MouseMode {
    pub fn from_wire(value: u32) -> Self {
        if value == MOUSE_MODE_CLIENT {
            MouseMode::Client
        } else {
            MouseMode::Server
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    /// Straight-alpha RGBA, row-major, no padding
    pub rgba: Vec<u8>,
}

impl CursorImage {
    pub fn new(
        width: u32,
        height: u32,
        hot_x: u32,
        hot_y: u32,
        rgba: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        if rgba.len() as u64 != width as u64 * height as u64 * 4 {
            return Err(ProtocolError::CursorShape {
                width,
                height,
                len: rgba.len(),
            });
        }
        if hot_x >= width.max(1) || hot_y >= height.max(1) {
            return Err(ProtocolError::CursorHotspot {
                hot_x,
                hot_y,
                width,
                height,
            });
        }
        Ok(Self {
            width,
            height,
            hot_x,
            hot_y,
            rgba,
        })
    }

    /// Top-left corner relative to `area` for a pointer at `(x, y)`
    fn origin(&self, (x, y): (i32, i32), area: Rect) -> (f64, f64) {
        (
            x as f64 - self.hot_x as f64 - area.x as f64,
            y as f64 - self.hot_y as f64 - area.y as f64,
        )
    }

    fn rgba_at(&self, x: u32, y: u32) -> [u8; 4] {
        let off = ((y * self.width + x) * 4) as usize;
        [
            self.rgba[off],
            self.rgba[off + 1],
            self.rgba[off + 2],
            self.rgba[off + 3],
        ]
    }
}

#[derive(Debug, Default)]
pub struct CursorOverlay {
    image: Option<CursorImage>,
    position: Option<(i32, i32)>,
    hidden: bool,
    mouse_mode: MouseMode,
    pointer_grabbed: bool,
}

impl CursorOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_image(&mut self, image: CursorImage) {
        self.image = Some(image);
        self.hidden = false;
    }

    pub fn move_to(&mut self, x: i32, y: i32) {
        self.position = Some((x, y));
        self.hidden = false;
    }

    pub fn hide(&mut self) {
        self.hidden = true;
    }

    pub fn set_mouse_mode(&mut self, mode: MouseMode) {
        self.mouse_mode = mode;
    }

    pub fn mouse_mode(&self) -> MouseMode {
        self.mouse_mode
    }

    pub fn set_pointer_grabbed(&mut self, grabbed: bool) {
        self.pointer_grabbed = grabbed;
    }

    pub fn reset(&mut self) {
        self.image = None;
        self.position = None;
        self.hidden = false;
    }

    /// Whether the overlay is drawn over the guest image
    pub fn is_visible(&self) -> bool {
        self.mouse_mode == MouseMode::Server
            && self.pointer_grabbed
            && !self.hidden
            && self.position.is_some()
            && self.image.is_some()
    }

    /// Window-space rectangle currently covered by the cursor
    pub fn window_rect(&self, scale: &ScaleState, area: Rect) -> Option<Rect> {
        let (image, position) = (self.image.as_ref()?, self.position?);
        let (rel_x, rel_y) = image.origin(position, area);
        let rect = scale.to_window(rel_x, rel_y, image.width as f64, image.height as f64);
        (!rect.is_empty()).then_some(rect)
    }

    /// Blend the cursor over a 0xAARRGGBB frame of `frame_w` x `frame_h` pixels
    pub fn composite(
        &self,
        frame: &mut [u32],
        frame_w: i32,
        frame_h: i32,
        scale: &ScaleState,
        area: Rect,
    ) {
        if !self.is_visible() {
            return;
        }
        let (Some(image), Some(position)) = (self.image.as_ref(), self.position) else {
            return;
        };
        let Some(rect) = self.window_rect(scale, area) else {
            return;
        };
        let Some(clip) = rect.intersect(&Rect::new(0, 0, frame_w, frame_h)) else {
            return;
        };

        let (rel_x, rel_y) = image.origin(position, area);
        let origin_x = scale.x as f64 + rel_x * scale.s;
        let origin_y = scale.y as f64 + rel_y * scale.s;

        for dy in clip.y..clip.y + clip.height {
            let cy = ((dy as f64 + 0.5 - origin_y) / scale.s).floor();
            if cy < 0.0 || cy >= image.height as f64 {
                continue;
            }
            for dx in clip.x..clip.x + clip.width {
                let cx = ((dx as f64 + 0.5 - origin_x) / scale.s).floor();
                if cx < 0.0 || cx >= image.width as f64 {
                    continue;
                }
                let src = image.rgba_at(cx as u32, cy as u32);
                let dst = &mut frame[(dy * frame_w + dx) as usize];
                *dst = blend_over(src, *dst);
            }
        }
    }
}

/// Straight-alpha "over" of an RGBA pixel onto an opaque 0xAARRGGBB pixel
fn blend_over([r, g, b, a]: [u8; 4], dst: u32) -> u32 {
    match a {
        0 => dst,
        0xff => 0xFF00_0000 | (r as u32) << 16 | (g as u32) << 8 | b as u32,
        _ => {
            let inv = 255 - a as u32;
            let mix = |src: u8, shift: u32| {
                let d = (dst >> shift) & 0xff;
                ((src as u32 * a as u32 + d * inv + 127) / 255) << shift
            };
            0xFF00_0000 | mix(r, 16) | mix(g, 8) | mix(b, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrow() -> CursorImage {
        CursorImage::new(2, 2, 1, 1, [255, 0, 0, 255].repeat(4)).unwrap()
    }

    fn one_to_one() -> ScaleState {
        ScaleState { s: 1.0, x: 0, y: 0, w: 8, h: 8 }
    }

    #[test]
    fn test_cursor_shape_length_checked() {
        assert!(matches!(
            CursorImage::new(2, 2, 0, 0, vec![0; 15]),
            Err(ProtocolError::CursorShape { .. })
        ));
    }

    #[test]
    fn test_hotspot_outside_image_rejected() {
        assert!(matches!(
            CursorImage::new(1, 1, 1, 1, vec![0; 4]),
            Err(ProtocolError::CursorHotspot { .. })
        ));
        assert!(CursorImage::new(1, 1, 0, 0, vec![0; 4]).is_ok());
    }

    #[test]
    fn test_extreme_position_does_not_overflow() {
        let mut overlay = CursorOverlay::new();
        overlay.set_image(arrow());
        overlay.set_pointer_grabbed(true);
        let area = Rect::new(100, 100, 8, 8);

        overlay.move_to(i32::MIN, i32::MIN);
        assert!(overlay.window_rect(&one_to_one(), area).is_some_and(|r| r.x < 0));
        let mut frame = vec![0xFF00_0000u32; 64];
        overlay.composite(&mut frame, 8, 8, &one_to_one(), area);
        assert!(frame.iter().all(|&p| p == 0xFF00_0000));

        overlay.move_to(i32::MAX, i32::MAX);
        overlay.composite(&mut frame, 8, 8, &one_to_one(), Rect::new(-100, -100, 8, 8));
        assert!(frame.iter().all(|&p| p == 0xFF00_0000));
    }

    #[test]
    fn test_overlay_requires_server_mode_and_grab() {
        let mut overlay = CursorOverlay::new();
        overlay.set_image(arrow());
        overlay.move_to(4, 4);
        assert!(!overlay.is_visible());

        overlay.set_pointer_grabbed(true);
        assert!(overlay.is_visible());

        overlay.set_mouse_mode(MouseMode::Client);
        assert!(!overlay.is_visible());

        overlay.set_mouse_mode(MouseMode::Server);
        overlay.hide();
        assert!(!overlay.is_visible());
    }

    #[test]
    fn test_window_rect_accounts_for_hotspot_and_area() {
        let mut overlay = CursorOverlay::new();
        overlay.set_image(arrow());
        overlay.move_to(14, 4);
        let scale = ScaleState { s: 2.0, x: 1, y: 1, w: 16, h: 16 };
        let rect = overlay.window_rect(&scale, Rect::new(10, 0, 8, 8)).unwrap();
        assert_eq!(rect, Rect::new(7, 7, 4, 4));
    }

    #[test]
    fn test_composite_draws_opaque_pixels() {
        let mut overlay = CursorOverlay::new();
        overlay.set_image(arrow());
        overlay.move_to(4, 4);
        overlay.set_pointer_grabbed(true);

        let mut frame = vec![0xFF00_0000u32; 64];
        overlay.composite(&mut frame, 8, 8, &one_to_one(), Rect::new(0, 0, 8, 8));
        assert_eq!(frame[3 * 8 + 3], 0xFFFF_0000);
        assert_eq!(frame[4 * 8 + 4], 0xFFFF_0000);
        assert_eq!(frame[5 * 8 + 5], 0xFF00_0000);
    }

    #[test]
    fn test_blend_half_alpha() {
        let out = blend_over([255, 255, 255, 128], 0xFF00_0000);
        assert_eq!(out, 0xFF80_8080);
    }
}
