//! CPU rendering of the primary surface into a window-sized frame

use super::Pixbuf;
use crate::cursor::CursorOverlay;
use crate::rect::Rect;
use crate::scaling::ScaleState;
use crate::surface::SurfaceStore;
use tracing::trace;

const BLACK: u32 = 0xFF00_0000;

/// A window-sized image of 0xAARRGGBB pixels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl Frame {
    fn reset(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width as usize * height as usize, BLACK);
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }
}

/// Sink for finished software frames
pub trait Presenter {
    fn present(&mut self, frame: &Frame) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct SoftwareBackend {
    frame: Frame,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the visible area into a window-sized frame
    pub fn render(
        &mut self,
        store: &SurfaceStore,
        window: (u32, u32),
        scale: &ScaleState,
        cursor: &CursorOverlay,
    ) -> &Frame {
        let (ww, wh) = window;
        self.frame.reset(ww, wh);

        let area = store.area();
        let placement = scale.placement();
        let bounds = Rect::new(0, 0, ww as i32, wh as i32);
        let Some(target) = placement.intersect(&bounds).filter(|_| store.has_visible_area()) else {
            return &self.frame;
        };

        // Nearest-neighbour source column for every target column.
        let src_x: Vec<i32> = (target.x..target.x + target.width)
            .map(|dx| sample(dx - scale.x, scale.s, area.width))
            .collect();

        for dy in target.y..target.y + target.height {
            let sy = sample(dy - scale.y, scale.s, area.height);
            let row = (dy as u32 * ww) as usize;
            for (i, &sx) in src_x.iter().enumerate() {
                if let Some(p) = store.pixel(sx, sy) {
                    self.frame.pixels[row + (target.x as usize + i)] = p;
                }
            }
        }

        cursor.composite(&mut self.frame.pixels, ww as i32, wh as i32, scale, area);
        trace!("Software frame {}x{} image at {:?}", ww, wh, target);
        &self.frame
    }

    /// RGB copy of the visible area at guest resolution
    pub fn screenshot(store: &SurfaceStore) -> Option<Pixbuf> {
        if !store.has_visible_area() {
            return None;
        }
        let area = store.area();
        let data = store
            .visible_pixels()
            .into_iter()
            .flat_map(|p| [(p >> 16) as u8, (p >> 8) as u8, p as u8])
            .collect();
        Some(Pixbuf::new(area.width as u32, area.height as u32, 3, data))
    }
}

fn sample(offset: i32, s: f64, extent: i32) -> i32 {
    let v = ((offset as f64 + 0.5) / s).floor() as i32;
    v.clamp(0, extent - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::{compute_scale, ScaleConfig};
    use crate::surface::tests::rgb32_surface;

    fn store() -> SurfaceStore {
        let mut store = SurfaceStore::new();
        store
            .replace(rgb32_surface(4, 2, |x, y| if y == 0 { 0x11_0000 * x } else { 0xFF }))
            .unwrap();
        store
    }

    #[test]
    fn test_unscaled_image_is_centred_with_black_border() {
        let store = store();
        let cfg = ScaleConfig {
            enabled: false,
            ..Default::default()
        };
        let scale = compute_scale(6, 4, 4, 2, &cfg);
        let mut sw = SoftwareBackend::new();
        let frame = sw.render(&store, (6, 4), &scale, &CursorOverlay::new());
        assert_eq!(frame.pixel(0, 0), Some(BLACK));
        assert_eq!(frame.pixel(1, 1), Some(0xFF00_0000));
        assert_eq!(frame.pixel(2, 1), Some(0xFF11_0000));
        assert_eq!(frame.pixel(1, 2), Some(0xFF00_00FF));
        assert_eq!(frame.pixel(5, 3), Some(BLACK));
    }

    #[test]
    fn test_upscale_doubles_pixels() {
        let store = store();
        let scale = compute_scale(8, 4, 4, 2, &ScaleConfig::default());
        assert_eq!(scale.s, 2.0);
        let mut sw = SoftwareBackend::new();
        let frame = sw.render(&store, (8, 4), &scale, &CursorOverlay::new());
        assert_eq!(frame.pixel(2, 0), frame.pixel(3, 0));
        assert_eq!(frame.pixel(2, 0), Some(0xFF11_0000));
        assert_eq!(frame.pixel(7, 3), Some(0xFF00_00FF));
    }

    #[test]
    fn test_no_surface_renders_black() {
        let mut sw = SoftwareBackend::new();
        let frame = sw.render(
            &SurfaceStore::new(),
            (3, 3),
            &ScaleState::default(),
            &CursorOverlay::new(),
        );
        assert!(frame.pixels.iter().all(|&p| p == BLACK));
    }

    #[test]
    fn test_screenshot_reorders_channels() {
        let mut store = SurfaceStore::new();
        store
            .replace(rgb32_surface(1, 1, |_, _| 0x00AA_BBCC))
            .unwrap();
        let shot = SoftwareBackend::screenshot(&store).unwrap();
        assert_eq!(shot.channels, 3);
        assert_eq!(shot.data, vec![0xAA, 0xBB, 0xCC]);
    }
}
