//! Damage handling for the software path

use crate::convert::ConvertError;
use crate::rect::Rect;
use crate::scaling::ScaleState;
use crate::surface::SurfaceStore;
use tracing::trace;

/// Turns guest damage into window-space redraw requests
#[derive(Debug, Default)]
pub struct DamageTracker {
    redraws: Vec<Rect>,
    full_redraw: bool,
}

impl DamageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a damaged guest rectangle. Returns the window-space rectangle that
    /// was queued for repaint, or `None` when the damage is not visible.
    pub fn invalidate(
        &mut self,
        rect: Rect,
        store: &mut SurfaceStore,
        scale: &ScaleState,
    ) -> Result<Option<Rect>, ConvertError> {
        let area = store.area();
        let Some(visible) = store.refresh(rect)? else {
            return Ok(None);
        };

        let damage = scale.to_window(
            (visible.x - area.x) as f64,
            (visible.y - area.y) as f64,
            visible.width as f64,
            visible.height as f64,
        );
        trace!("Damage {:?} -> window {:?}", visible, damage);
        self.queue(damage);
        Ok(Some(damage))
    }

    /// Queue a window-space repaint; a rect already pending is not queued again
    pub fn queue(&mut self, rect: Rect) {
        if !rect.is_empty() && !self.redraws.contains(&rect) {
            self.redraws.push(rect);
        }
    }

    pub fn queue_full(&mut self) {
        self.full_redraw = true;
    }

    pub fn has_pending(&self) -> bool {
        self.full_redraw || !self.redraws.is_empty()
    }

    /// Drain pending repaints. A full redraw is reported as `window`.
    pub fn take_redraws(&mut self, window: Rect) -> Vec<Rect> {
        if std::mem::take(&mut self.full_redraw) {
            self.redraws.clear();
            return vec![window];
        }
        std::mem::take(&mut self.redraws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::tests::{rgb16_surface, rgb32_surface};
    use crate::surface::SurfaceFormat;

    fn store_with_area(area: Rect) -> SurfaceStore {
        let mut store = SurfaceStore::new();
        store.replace(rgb32_surface(200, 200, |_, _| 0)).unwrap();
        store.set_area(area).unwrap();
        store
    }

    #[test]
    fn test_disjoint_damage_is_ignored() {
        let mut store = store_with_area(Rect::new(0, 0, 100, 100));
        let mut tracker = DamageTracker::new();
        let scale = ScaleState { s: 1.0, x: 0, y: 0, w: 100, h: 100 };
        let out = tracker
            .invalidate(Rect::new(150, 150, 10, 10), &mut store, &scale)
            .unwrap();
        assert_eq!(out, None);
        assert!(!tracker.has_pending());
    }

    #[test]
    fn test_inside_damage_yields_one_scaled_rect() {
        let mut store = store_with_area(Rect::new(0, 0, 100, 100));
        let mut tracker = DamageTracker::new();
        let scale = ScaleState { s: 0.5, x: 10, y: 20, w: 50, h: 50 };
        let out = tracker
            .invalidate(Rect::new(10, 10, 10, 10), &mut store, &scale)
            .unwrap();
        assert_eq!(out, Some(Rect::new(15, 25, 5, 5)));
        assert_eq!(tracker.take_redraws(Rect::new(0, 0, 60, 70)).len(), 1);
    }

    #[test]
    fn test_damage_is_relative_to_monitor_area() {
        let mut store = store_with_area(Rect::new(100, 0, 100, 100));
        let mut tracker = DamageTracker::new();
        let scale = ScaleState { s: 1.0, x: 0, y: 0, w: 100, h: 100 };
        let out = tracker
            .invalidate(Rect::new(90, 0, 20, 5), &mut store, &scale)
            .unwrap();
        assert_eq!(out, Some(Rect::new(0, 0, 10, 5)));
    }

    #[test]
    fn test_damage_reconverts_16bit_pixels() {
        let mut store = SurfaceStore::new();
        store
            .replace(rgb16_surface(4, 4, SurfaceFormat::Rgb16_555, 0x7FFF))
            .unwrap();
        let mut tracker = DamageTracker::new();
        let scale = ScaleState { s: 1.0, x: 0, y: 0, w: 4, h: 4 };
        tracker
            .invalidate(Rect::new(0, 0, 4, 4), &mut store, &scale)
            .unwrap();
        assert_eq!(store.pixel(2, 2), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_repeated_rect_is_queued_once() {
        let mut tracker = DamageTracker::new();
        tracker.queue(Rect::new(1, 1, 2, 2));
        tracker.queue(Rect::new(1, 1, 2, 2));
        tracker.queue(Rect::new(0, 0, 0, 5));
        assert_eq!(tracker.take_redraws(Rect::new(0, 0, 8, 8)), vec![Rect::new(1, 1, 2, 2)]);
    }

    #[test]
    fn test_full_redraw_supersedes_rects() {
        let mut tracker = DamageTracker::new();
        tracker.queue(Rect::new(0, 0, 1, 1));
        tracker.queue_full();
        let window = Rect::new(0, 0, 640, 480);
        assert_eq!(tracker.take_redraws(window), vec![window]);
        assert!(!tracker.has_pending());
    }
}
