//! Per-window display state
//!
//! `DisplayContext` lives on the render side. It consumes [`DisplayEvent`]s
//! produced by the protocol reader, keeps the surface, scanout and cursor
//! state, decides which backend is active and answers the queries other
//! layers need (scanout, screenshot, scaling, input transform).

use crate::backend::{BackendKind, Backends, HardwareBackend, Pixbuf, Presenter, SoftwareBackend};
use crate::cursor::{CursorImage, CursorOverlay, MouseMode};
use crate::damage::DamageTracker;
use crate::error::{DisplayError, ProtocolError, Result};
use crate::monitor::{self, MonitorConfig, MonitorSelection};
use crate::rect::Rect;
use crate::scaling::{self, ScaleConfig, ScaleState};
use crate::scanout::{ScanoutDescriptor, ScanoutResource, ScanoutUpdate};
use crate::stats::FrameStats;
use crate::surface::{Surface, SurfaceStore};
use tracing::{debug, info, warn};
use vmview_proto::wire::GuestResizeWire;
use vmview_proto::ClientMessage;

/// Everything the protocol side hands over to the render side
#[derive(Debug)]
pub enum DisplayEvent {
    PrimaryCreate(Surface),
    PrimaryDestroy,
    Invalidate(Rect),
    Scanout(ScanoutDescriptor),
    GlDraw(Rect),
    MonitorsConfig(Vec<MonitorConfig>),
    Mark(u32),
    CursorSet(CursorImage),
    CursorMove { x: i32, y: i32 },
    CursorHide,
    MouseMode(MouseMode),
    /// Channel reset or hang-up
    Reset,
}

/// Display options that are not about scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
    /// Guest monitor to show, negative for the whole surface
    pub monitor_id: i32,
    /// Ask the guest to match the window size
    pub resize_guest: bool,
    /// The server announces monitor configurations; wait for them
    pub waits_for_monitors: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            monitor_id: -1,
            resize_guest: false,
            waits_for_monitors: true,
        }
    }
}

pub struct DisplayContext {
    scale_config: ScaleConfig,
    options: DisplayOptions,
    window: (u32, u32),

    store: SurfaceStore,
    scanout: ScanoutResource,
    damage: DamageTracker,
    backends: Backends,
    cursor: CursorOverlay,
    monitors: Vec<MonitorConfig>,

    mark: u32,
    monitor_ready: bool,
    ready: bool,

    outbound: Vec<ClientMessage>,
    stats: FrameStats,
}

impl DisplayContext {
    pub fn new(
        scale_config: ScaleConfig,
        options: DisplayOptions,
        window: (u32, u32),
        hardware: Option<HardwareBackend>,
    ) -> Self {
        Self {
            scale_config,
            options,
            window,
            store: SurfaceStore::new(),
            scanout: ScanoutResource::new(),
            damage: DamageTracker::new(),
            backends: Backends::new(hardware),
            cursor: CursorOverlay::new(),
            monitors: Vec::new(),
            mark: 0,
            monitor_ready: false,
            ready: false,
            outbound: Vec::new(),
            stats: FrameStats::new(),
        }
    }

    /// Dispatch one event from the protocol side
    pub fn handle_event(&mut self, event: DisplayEvent) -> Result<()> {
        match event {
            DisplayEvent::PrimaryCreate(surface) => self.primary_create(surface),
            DisplayEvent::PrimaryDestroy => {
                self.primary_destroy();
                Ok(())
            }
            DisplayEvent::Invalidate(rect) => self.invalidate(rect),
            DisplayEvent::Scanout(desc) => {
                self.update_scanout(desc);
                Ok(())
            }
            DisplayEvent::GlDraw(rect) => {
                self.gl_draw(rect);
                Ok(())
            }
            DisplayEvent::MonitorsConfig(monitors) => self.monitors_config(monitors),
            DisplayEvent::Mark(mark) => {
                self.set_mark(mark);
                Ok(())
            }
            DisplayEvent::CursorSet(image) => {
                self.invalidate_cursor();
                self.cursor.set_image(image);
                self.invalidate_cursor();
                Ok(())
            }
            DisplayEvent::CursorMove { x, y } => {
                self.invalidate_cursor();
                self.cursor.move_to(x, y);
                self.invalidate_cursor();
                Ok(())
            }
            DisplayEvent::CursorHide => {
                self.invalidate_cursor();
                self.cursor.hide();
                Ok(())
            }
            DisplayEvent::MouseMode(mode) => {
                debug!("Mouse mode {:?}", mode);
                self.cursor.set_mouse_mode(mode);
                self.damage.queue_full();
                Ok(())
            }
            DisplayEvent::Reset => {
                self.reset();
                Ok(())
            }
        }
    }

    pub fn primary_create(&mut self, surface: Surface) -> Result<()> {
        info!(
            "Primary surface {}x{} {:?}",
            surface.width, surface.height, surface.format
        );
        self.store
            .replace(surface)
            .map_err(ProtocolError::from)?;
        self.update_monitor_area()
    }

    pub fn primary_destroy(&mut self) {
        self.store.destroy();
        // The hardware image may be bound to the old geometry.
        if let Some(hw) = self.backends.hardware() {
            hw.release_image();
        }
        self.monitor_ready = false;
        self.update_ready();
    }

    /// Damage on the primary surface; switches to the software path
    pub fn invalidate(&mut self, rect: Rect) -> Result<()> {
        self.backends.use_software();
        let result = if self.ready {
            let scale = self.scaling();
            self.damage.invalidate(rect, &mut self.store, &scale)
        } else {
            // Conversion still runs; becoming ready repaints everything.
            self.store.refresh(rect)
        };
        result.map_err(|e| {
            warn!("Dropping damage {:?}: {}", rect, e);
            DisplayError::Protocol(e.into())
        })?;
        Ok(())
    }

    /// New scanout from the server; a real buffer switches to the hardware path
    pub fn update_scanout(&mut self, descriptor: ScanoutDescriptor) {
        let update = self.scanout.update(descriptor);
        if update == ScanoutUpdate::Replaced && self.backends.use_hardware() != BackendKind::Hardware {
            debug!("Scanout received but hardware rendering is unavailable");
        }
        if let Some(hw) = self.backends.hardware() {
            match hw.update_scanout(self.scanout.descriptor()) {
                Ok(()) => {}
                Err(e @ crate::error::GpuError::Import { .. }) => {
                    warn!("{}; showing a blank frame until the next scanout", e);
                }
                Err(e) => debug!("Scanout not imported: {}", e),
            }
        }
        self.damage.queue_full();
    }

    /// GL draw request: render now and acknowledge
    pub fn gl_draw(&mut self, rect: Rect) {
        if self.backends.use_hardware() == BackendKind::Hardware {
            let window = self.window_i32();
            let scale = self.scaling();
            if let Some(hw) = self.backends.hardware() {
                match hw.draw(window, &scale) {
                    Ok(()) => self.stats.tick(BackendKind::Hardware),
                    Err(e) => warn!("GL draw {:?} failed: {}", rect, e),
                }
            }
        }
        // The server stalls until acknowledged, even when nothing was drawn.
        self.outbound.push(ClientMessage::GlDrawDone);
    }

    pub fn monitors_config(&mut self, monitors: Vec<MonitorConfig>) -> Result<()> {
        debug!("Monitors config with {} entries", monitors.len());
        self.monitors = monitors;
        self.update_monitor_area()
    }

    pub fn set_mark(&mut self, mark: u32) {
        debug!("Mark {}", mark);
        self.mark = mark;
        self.update_ready();
    }

    /// Channel reset: drop the scanout and everything imported from it
    pub fn reset(&mut self) {
        info!("Display channel reset");
        self.scanout.close();
        if let Some(hw) = self.backends.hardware() {
            hw.release_image();
        }
        self.backends.use_software();
        self.cursor.reset();
        self.damage.queue_full();
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if self.window == (width, height) {
            return;
        }
        debug!("Window resized to {}x{}", width, height);
        self.window = (width, height);
        self.recalc_geometry();
    }

    pub fn set_scaling(&mut self, enabled: bool) {
        self.scale_config.enabled = enabled;
        self.recalc_geometry();
    }

    pub fn set_only_downscale(&mut self, only_downscale: bool) {
        self.scale_config.only_downscale = only_downscale;
        self.recalc_geometry();
    }

    pub fn set_zoom_level(&mut self, percent: u32) {
        self.scale_config.zoom_percent = percent.max(1);
        self.recalc_geometry();
    }

    pub fn set_pointer_grabbed(&mut self, grabbed: bool) {
        self.cursor.set_pointer_grabbed(grabbed);
        self.invalidate_cursor();
    }

    /// Repaint with the active backend
    pub fn draw(&mut self, presenter: &mut dyn Presenter) -> Result<()> {
        let scale = self.scaling();
        match self.backends.active() {
            BackendKind::Hardware => {
                let window = self.window_i32();
                if let Some(hw) = self.backends.hardware() {
                    hw.draw(window, &scale)?;
                    self.stats.tick(BackendKind::Hardware);
                }
                Ok(())
            }
            BackendKind::Software => {
                let empty = SurfaceStore::new();
                let store = if self.ready { &self.store } else { &empty };
                let frame = self
                    .backends
                    .software()
                    .render(store, self.window, &scale, &self.cursor);
                presenter
                    .present(frame)
                    .map_err(|e| DisplayError::Present(format!("{:#}", e)))?;
                self.stats.tick(BackendKind::Software);
                Ok(())
            }
        }
    }

    pub fn scanout(&self) -> Option<&ScanoutDescriptor> {
        self.scanout.descriptor()
    }

    /// Current placement of the guest image in the window
    pub fn scaling(&self) -> ScaleState {
        let (fb_w, fb_h) = self.framebuffer_size();
        let (ww, wh) = self.window_i32();
        scaling::compute_scale(ww, wh, fb_w, fb_h, &self.scale_config)
    }

    /// Window coordinates to guest framebuffer coordinates
    pub fn transform_input(&self, window_x: f64, window_y: f64) -> (i32, i32) {
        let (fb_w, _) = self.framebuffer_size();
        self.scaling().transform_input(fb_w, window_x, window_y)
    }

    /// Copy of what is currently displayed
    pub fn screenshot(&mut self) -> Result<Option<Pixbuf>> {
        match self.backends.active() {
            BackendKind::Hardware => {
                let window = self.window_i32();
                let scale = self.scaling();
                match self.backends.hardware() {
                    Some(hw) => Ok(Some(hw.screenshot(window, &scale)?)),
                    None => Ok(None),
                }
            }
            BackendKind::Software => Ok(SoftwareBackend::screenshot(&self.store)),
        }
    }

    pub fn active_backend(&self) -> BackendKind {
        self.backends.active()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn area(&self) -> Rect {
        self.store.area()
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut FrameStats {
        &mut self.stats
    }

    /// Queue a repaint of the whole window
    pub fn request_redraw(&mut self) {
        self.damage.queue_full();
    }

    pub fn has_pending_redraw(&self) -> bool {
        self.damage.has_pending()
    }

    /// Window-space rectangles that need repainting since the last call
    pub fn take_redraws(&mut self) -> Vec<Rect> {
        let (w, h) = self.window_i32();
        self.damage.take_redraws(Rect::new(0, 0, w, h))
    }

    /// Messages to send back to the server
    pub fn take_outbound(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbound)
    }

    fn window_i32(&self) -> (i32, i32) {
        let clamp = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        (clamp(self.window.0), clamp(self.window.1))
    }

    fn framebuffer_size(&self) -> (i32, i32) {
        let area = self.store.area();
        if !area.is_empty() {
            return (area.width, area.height);
        }
        match self.scanout.descriptor() {
            Some(desc) if self.backends.active() == BackendKind::Hardware => {
                (desc.crop.width, desc.crop.height)
            }
            _ => (0, 0),
        }
    }

    fn update_monitor_area(&mut self) -> Result<()> {
        let Some(primary) = self.store.surface().map(|s| s.bounds()) else {
            return Ok(());
        };
        let selection = monitor::select(
            self.options.monitor_id,
            &self.monitors,
            primary,
            self.options.waits_for_monitors,
        );
        match selection {
            Ok(MonitorSelection::Area(area)) => self.update_area(area),
            Ok(MonitorSelection::Wait) => {
                self.monitor_ready = false;
                self.update_ready();
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                self.monitor_ready = false;
                self.update_ready();
                Err(e.into())
            }
        }
    }

    fn update_area(&mut self, area: Rect) -> Result<()> {
        let primary = self.store.surface().map(|s| s.bounds()).unwrap_or_default();
        let visible = primary.intersect(&area);
        debug!("Monitor area {:?} visible {:?}", area, visible);
        match visible {
            Some(visible) => {
                self.store
                    .set_area(visible)
                    .map_err(ProtocolError::from)?;
                self.monitor_ready = true;
            }
            None => {
                warn!("Monitor area {:?} lies outside the primary surface", area);
                self.store.set_area(Rect::default()).map_err(ProtocolError::from)?;
                self.monitor_ready = false;
            }
        }
        self.update_ready();
        self.recalc_geometry();
        Ok(())
    }

    fn update_ready(&mut self) {
        let ready = self.mark != 0 && self.monitor_ready;
        if ready != self.ready {
            debug!("Display ready: {}", ready);
            self.ready = ready;
            self.damage.queue_full();
        }
    }

    fn recalc_geometry(&mut self) {
        let scale = self.scaling();
        debug!(
            "Geometry: window {:?} scale {:.3} at ({}, {}) {}x{}",
            self.window, scale.s, scale.x, scale.y, scale.w, scale.h
        );
        self.damage.queue_full();

        if self.options.resize_guest && self.store.surface().is_some() {
            let area = self.store.area();
            let (width, height) =
                scaling::guest_resize_request(self.window.0, self.window.1, &self.scale_config);
            let id = self.options.monitor_id.max(0) as u32;
            let request = GuestResizeWire {
                id,
                x: area.x.max(0) as u32,
                y: area.y.max(0) as u32,
                width,
                height,
            };
            // Only the latest request matters.
            self.outbound
                .retain(|m| !matches!(m, ClientMessage::GuestResize(r) if r.id == id));
            self.outbound.push(ClientMessage::GuestResize(request));
        }
    }

    fn invalidate_cursor(&mut self) {
        if !self.ready {
            return;
        }
        let scale = self.scaling();
        if let Some(rect) = self.cursor.window_rect(&scale, self.store.area()) {
            self.damage.queue(rect);
        }
    }
}
