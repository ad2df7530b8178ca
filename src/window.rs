//! X11 viewer window and software presentation

use crate::backend::{Frame, Presenter};
use crate::config::WindowConfig;
use anyhow::{Context, Result};
use tracing::{info, trace, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::xproto::{
    AtomEnum, ConnectionExt as _, CreateGCAux, CreateWindowAux, EventMask, ImageFormat, PropMode,
    WindowClass,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

/// Size of a PutImage request header
const PUT_IMAGE_HEADER: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    /// Some part of the window needs repainting
    Expose,
    Resized { width: u32, height: u32 },
    PointerEntered,
    PointerLeft,
    CloseRequested,
}

pub struct ViewerWindow {
    conn: RustConnection,
    window: u32,
    gc: u32,
    depth: u8,
    wm_delete_window: u32,
    width: u32,
    height: u32,
}

impl ViewerWindow {
    /// Create and map the viewer window
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(None).context("Failed to connect to X11 server")?;
        let screen = &conn.setup().roots[screen_num];
        let depth = screen.root_depth;
        if depth != 24 && depth != 32 {
            warn!("Root depth {} is not 24/32; software frames may look wrong", depth);
        }

        let window = conn.generate_id()?;
        let width = config.width.clamp(1, u16::MAX as u32);
        let height = config.height.clamp(1, u16::MAX as u32);
        let aux = CreateWindowAux::new()
            .background_pixel(screen.black_pixel)
            .event_mask(
                EventMask::EXPOSURE
                    | EventMask::STRUCTURE_NOTIFY
                    | EventMask::ENTER_WINDOW
                    | EventMask::LEAVE_WINDOW,
            );
        conn.create_window(
            depth,
            window,
            screen.root,
            0,
            0,
            width as u16,
            height as u16,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &aux,
        )?;

        let wm_protocols = conn.intern_atom(false, b"WM_PROTOCOLS")?.reply()?.atom;
        let wm_delete_window = conn.intern_atom(false, b"WM_DELETE_WINDOW")?.reply()?.atom;
        conn.change_property32(
            PropMode::REPLACE,
            window,
            wm_protocols,
            AtomEnum::ATOM,
            &[wm_delete_window],
        )?;
        conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            config.title.as_bytes(),
        )?;

        let gc = conn.generate_id()?;
        conn.create_gc(gc, window, &CreateGCAux::new())?;
        conn.map_window(window)?;
        conn.flush()?;

        info!("Viewer window 0x{:x} {}x{} depth {}", window, width, height, depth);

        Ok(Self {
            conn,
            window,
            gc,
            depth,
            wm_delete_window,
            width,
            height,
        })
    }

    pub fn id(&self) -> u32 {
        self.window
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Drain pending X11 events without blocking
    pub fn poll_events(&mut self) -> Result<Vec<WindowEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self
            .conn
            .poll_for_event()
            .context("Lost connection to X11 server")?
        {
            match event {
                Event::Expose(e) if e.count == 0 => events.push(WindowEvent::Expose),
                Event::ConfigureNotify(e) if e.window == self.window => {
                    let (w, h) = (e.width as u32, e.height as u32);
                    if (w, h) != (self.width, self.height) {
                        self.width = w;
                        self.height = h;
                        events.push(WindowEvent::Resized { width: w, height: h });
                    }
                }
                Event::EnterNotify(_) => events.push(WindowEvent::PointerEntered),
                Event::LeaveNotify(_) => events.push(WindowEvent::PointerLeft),
                Event::ClientMessage(e) if e.data.as_data32()[0] == self.wm_delete_window => {
                    events.push(WindowEvent::CloseRequested)
                }
                other => trace!("Ignoring X11 event {:?}", other),
            }
        }
        Ok(events)
    }
}

impl Presenter for ViewerWindow {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(());
        }
        let row_bytes = frame.width as usize * 4;
        let max_bytes = self.conn.maximum_request_bytes().saturating_sub(PUT_IMAGE_HEADER);
        let rows_per_request = (max_bytes / row_bytes).clamp(1, u16::MAX as usize);

        let mut y = 0usize;
        while y < frame.height as usize {
            let rows = rows_per_request.min(frame.height as usize - y);
            let start = y * frame.width as usize;
            let end = start + rows * frame.width as usize;
            let data: &[u8] = bytemuck::cast_slice(&frame.pixels[start..end]);
            self.conn.put_image(
                ImageFormat::Z_PIXMAP,
                self.window,
                self.gc,
                frame.width as u16,
                rows as u16,
                0,
                y as i16,
                0,
                self.depth,
                data,
            )?;
            y += rows;
        }
        self.conn.flush()?;
        trace!("Presented {}x{} software frame", frame.width, frame.height);
        Ok(())
    }
}

impl Drop for ViewerWindow {
    fn drop(&mut self) {
        let _ = self.conn.free_gc(self.gc);
        let _ = self.conn.destroy_window(self.window);
        let _ = self.conn.flush();
    }
}
