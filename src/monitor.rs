//! Selecting the visible area of the primary surface from a monitors configuration

use crate::error::ProtocolError;
use crate::rect::Rect;
use tracing::debug;
use vmview_proto::wire::MonitorWire;

/// One guest monitor as announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub id: u32,
    pub surface_id: u32,
    pub area: Rect,
}

impl From<MonitorWire> for MonitorConfig {
    fn from(w: MonitorWire) -> Self {
        Self {
            id: w.id,
            surface_id: w.surface_id,
            area: Rect::from_u32(w.x, w.y, w.width, w.height),
        }
    }
}

/// Outcome of monitor selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSelection {
    /// Show this region of the primary surface
    Area(Rect),
    /// The requested monitor is not configured yet
    Wait,
}

/// Pick the region of the primary surface shown for `monitor_id`.
///
/// A negative id shows the whole surface. `waits_for_config` is set when the
/// server announces monitor configurations; without it a missing monitor
/// falls back to the whole surface.
pub fn select(
    monitor_id: i32,
    monitors: &[MonitorConfig],
    primary: Rect,
    waits_for_config: bool,
) -> Result<MonitorSelection, ProtocolError> {
    if monitor_id < 0 {
        return Ok(MonitorSelection::Area(primary));
    }

    let Some(monitor) = monitors.iter().find(|m| m.id == monitor_id as u32) else {
        if waits_for_config {
            debug!("Monitor {} not configured yet", monitor_id);
            return Ok(MonitorSelection::Wait);
        }
        return Ok(MonitorSelection::Area(primary));
    };

    if monitor.surface_id != 0 {
        return Err(ProtocolError::NonPrimarySurface {
            monitor_id: monitor.id,
            surface_id: monitor.surface_id,
        });
    }

    let area = if monitors.len() == 1 {
        Rect::new(0, 0, monitor.area.width, monitor.area.height)
    } else {
        monitor.area
    };
    Ok(MonitorSelection::Area(area))
}
