//! Placement of the guest image inside the window and the inverse mapping for input

use crate::rect::Rect;
use serde::{Deserialize, Serialize};

/// User-controlled scaling options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// Fit the image to the window instead of showing it 1:1
    pub enabled: bool,
    /// Never scale up beyond 1:1
    pub only_downscale: bool,
    /// Zoom percentage applied to guest resize requests
    pub zoom_percent: u32,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            only_downscale: false,
            zoom_percent: 100,
        }
    }
}

impl ScaleConfig {
    /// Zoom factor (1.0 = 100%); only meaningful while scaling is enabled
    pub fn zoom(&self) -> f64 {
        if self.enabled && self.zoom_percent > 0 {
            self.zoom_percent as f64 / 100.0
        } else {
            1.0
        }
    }
}

/// Scale factor and placement rectangle of the image in window coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleState {
    pub s: f64,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Default for ScaleState {
    fn default() -> Self {
        Self {
            s: 1.0,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
        }
    }
}

/// Compute where a `fb_w` x `fb_h` image lands in a `window_w` x `window_h` window
pub fn compute_scale(
    window_w: i32,
    window_h: i32,
    fb_w: i32,
    fb_h: i32,
    config: &ScaleConfig,
) -> ScaleState {
    if fb_w <= 0 || fb_h <= 0 {
        return ScaleState::default();
    }

    if !config.enabled {
        return ScaleState {
            s: 1.0,
            x: ((window_w - fb_w) / 2).max(0),
            y: ((window_h - fb_h) / 2).max(0),
            w: fb_w,
            h: fb_h,
        };
    }

    let mut s = (window_w as f64 / fb_w as f64).min(window_h as f64 / fb_h as f64);
    if config.only_downscale && s >= 1.0 {
        s = 1.0;
    }
    if s <= 0.0 {
        // Window not yet mapped; keep s positive so inverse mapping stays defined.
        return ScaleState::default();
    }

    let w = (fb_w as f64 * s + 0.5).floor() as i32;
    let h = (fb_h as f64 * s + 0.5).floor() as i32;
    ScaleState {
        s,
        x: (window_w - w) / 2,
        y: (window_h - h) / 2,
        w,
        h,
    }
}

impl ScaleState {
    pub fn placement(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }

    /// Map a window-space point to framebuffer pixels.
    ///
    /// The factor is `(fb_w - 1) / (w - 1)` so the last displayed pixel maps to
    /// the last framebuffer pixel. Both axes use the horizontal factor; the
    /// placement preserves the aspect ratio.
    pub fn transform_input(&self, fb_w: i32, window_x: f64, window_y: f64) -> (i32, i32) {
        let (num, den) = if self.w > 1 && fb_w > 1 {
            ((fb_w - 1) as f64, (self.w - 1) as f64)
        } else {
            (1.0, 1.0)
        };
        // Multiply before dividing so exact edges land on exact integers.
        let fx = ((window_x - self.x as f64) * num / den).floor();
        let fy = ((window_y - self.y as f64) * num / den).floor();
        (fx as i32, fy as i32)
    }

    /// Window-space rectangle covering a region given relative to the visible
    /// area origin, rounded outwards.
    ///
    /// Computed in `f64`; results beyond the `i32` range saturate.
    pub fn to_window(&self, rel_x: f64, rel_y: f64, rel_w: f64, rel_h: f64) -> Rect {
        let x1 = self.x as f64 + (rel_x * self.s).floor();
        let y1 = self.y as f64 + (rel_y * self.s).floor();
        let x2 = self.x as f64 + ((rel_x + rel_w) * self.s).ceil();
        let y2 = self.y as f64 + ((rel_y + rel_h) * self.s).ceil();
        Rect::new(x1 as i32, y1 as i32, (x2 - x1) as i32, (y2 - y1) as i32)
    }
}

/// Guest display size to request for a window, honouring the zoom level
pub fn guest_resize_request(window_w: u32, window_h: u32, config: &ScaleConfig) -> (u32, u32) {
    let zoom = config.zoom();
    (
        (window_w as f64 / zoom).floor() as u32,
        (window_h as f64 / zoom).floor() as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaled() -> ScaleConfig {
        ScaleConfig::default()
    }

    fn unscaled() -> ScaleConfig {
        ScaleConfig {
            enabled: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_unscaled_centres_image() {
        let st = compute_scale(1000, 800, 800, 600, &unscaled());
        assert_eq!(st, ScaleState { s: 1.0, x: 100, y: 100, w: 800, h: 600 });
    }

    #[test]
    fn test_unscaled_never_negative_origin() {
        let st = compute_scale(640, 480, 800, 600, &unscaled());
        assert_eq!((st.x, st.y), (0, 0));
    }

    #[test]
    fn test_only_downscale_clamps_to_one() {
        let cfg = ScaleConfig {
            only_downscale: true,
            ..Default::default()
        };
        let st = compute_scale(2000, 2000, 800, 600, &cfg);
        assert_eq!(st.s, 1.0);
        assert_eq!((st.w, st.h), (800, 600));
        assert_eq!((st.x, st.y), (600, 700));
    }

    #[test]
    fn test_fit_preserves_aspect() {
        let st = compute_scale(1000, 1000, 800, 600, &scaled());
        assert_eq!(st.s, 1.25);
        assert_eq!((st.w, st.h), (1000, 750));
        assert_eq!((st.x, st.y), (0, 125));
    }

    #[test]
    fn test_degenerate_framebuffer() {
        let st = compute_scale(100, 100, 0, 600, &scaled());
        assert_eq!(st, ScaleState::default());
    }

    #[test]
    fn test_transform_input_reaches_last_pixel() {
        let st = compute_scale(700, 700, 1024, 768, &scaled());
        let (fx, _) = st.transform_input(1024, (st.x + st.w - 1) as f64, st.y as f64);
        assert_eq!(fx, 1023);
        let (fx, fy) = st.transform_input(1024, st.x as f64, st.y as f64);
        assert_eq!((fx, fy), (0, 0));
    }

    #[test]
    fn test_transform_input_one_to_one() {
        let st = compute_scale(800, 600, 800, 600, &unscaled());
        assert_eq!(st.transform_input(800, 123.0, 45.0), (123, 45));
    }

    #[test]
    fn test_to_window_rounds_outwards() {
        let st = ScaleState { s: 0.5, x: 10, y: 20, w: 50, h: 50 };
        assert_eq!(st.to_window(3.0, 3.0, 3.0, 3.0), Rect::new(11, 21, 2, 2));
    }

    #[test]
    fn test_guest_resize_applies_zoom() {
        let cfg = ScaleConfig {
            zoom_percent: 200,
            ..Default::default()
        };
        assert_eq!(guest_resize_request(1600, 1200, &cfg), (800, 600));
        assert_eq!(guest_resize_request(1600, 1200, &unscaled()), (1600, 1200));
    }
}
