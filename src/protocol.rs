//! Protocol side of the display channel
//!
//! A dedicated thread blocks on the socket, turns wire messages into
//! [`DisplayEvent`]s (mapping shared memory, taking ownership of fds) and
//! hands them to the render side over a bounded channel. Outbound messages
//! go through a cloned socket from the render side.

use crate::cursor::{CursorImage, MouseMode};
use crate::display::DisplayEvent;
use crate::error::ProtocolError;
use crate::monitor::MonitorConfig;
use crate::rect::Rect;
use crate::scanout::ScanoutDescriptor;
use crate::surface::{PixelBuffer, Surface, SurfaceFormat};
use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};
use vmview_proto::{Channel, ClientMessage, ProtoError, ServerMessage};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Render-side handle of the display channel
pub struct ProtocolClient {
    receiver: mpsc::Receiver<DisplayEvent>,
    writer: Channel,
    disconnected: bool,
}

impl ProtocolClient {
    /// Start reading `channel` on a background thread
    pub fn spawn(channel: Channel) -> Result<Self> {
        let writer = channel
            .try_clone()
            .context("Failed to duplicate display channel socket")?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        std::thread::Builder::new()
            .name("vmview-protocol".into())
            .spawn(move || reader_loop(channel, event_tx))
            .context("Failed to spawn protocol thread")?;

        Ok(Self {
            receiver: event_rx,
            writer,
            disconnected: false,
        })
    }

    /// Try to receive a display event (non-blocking)
    pub fn try_recv_event(&mut self) -> Option<DisplayEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.disconnected = true;
                None
            }
        }
    }

    /// The reader thread has stopped and every queued event was consumed
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Wait for the next display event; `None` once the reader has stopped
    pub async fn recv_event(&mut self) -> Option<DisplayEvent> {
        self.receiver.recv().await
    }

    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        debug!("Sending {:?}", message);
        self.writer
            .send_client(message)
            .context("Failed to send message to display server")
    }
}

fn reader_loop(channel: Channel, events: mpsc::Sender<DisplayEvent>) {
    info!("Protocol reader started");
    loop {
        let message = match channel.recv_server() {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("Display server hung up");
                let _ = events.blocking_send(DisplayEvent::Reset);
                break;
            }
            Err(ProtoError::Io(e)) => {
                error!("Display channel read failed: {}", e);
                let _ = events.blocking_send(DisplayEvent::Reset);
                break;
            }
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                continue;
            }
        };

        match translate(message) {
            Ok(event) => {
                if events.blocking_send(event).is_err() {
                    debug!("Render side closed; stopping protocol reader");
                    break;
                }
            }
            Err(e) => warn!("Rejected display message: {}", e),
        }
    }
    debug!("Protocol reader ended");
}

/// Convert a wire message into a render-side event
pub fn translate(message: ServerMessage) -> Result<DisplayEvent, ProtocolError> {
    let event = match message {
        ServerMessage::PrimaryCreate { surface, shm } => {
            let format = SurfaceFormat::from_wire(surface.format)?;
            let len = surface.stride as usize * surface.height as usize;
            let pixels = PixelBuffer::map(shm, len)?;
            DisplayEvent::PrimaryCreate(Surface::new(
                surface.width,
                surface.height,
                surface.stride,
                format,
                pixels,
            )?)
        }
        ServerMessage::PrimaryDestroy => DisplayEvent::PrimaryDestroy,
        ServerMessage::Invalidate(r) => DisplayEvent::Invalidate(Rect::from_u32(r.x, r.y, r.w, r.h)),
        ServerMessage::GlScanout { scanout, fd } => {
            DisplayEvent::Scanout(ScanoutDescriptor::from_wire(&scanout, fd))
        }
        ServerMessage::GlDraw(r) => DisplayEvent::GlDraw(Rect::from_u32(r.x, r.y, r.w, r.h)),
        ServerMessage::MonitorsConfig(monitors) => {
            DisplayEvent::MonitorsConfig(monitors.into_iter().map(MonitorConfig::from).collect())
        }
        ServerMessage::Mark(mark) => DisplayEvent::Mark(mark),
        ServerMessage::CursorSet { shape, rgba } => DisplayEvent::CursorSet(CursorImage::new(
            shape.width,
            shape.height,
            shape.hot_x,
            shape.hot_y,
            rgba,
        )?),
        ServerMessage::CursorMove(pos) => DisplayEvent::CursorMove { x: pos.x, y: pos.y },
        ServerMessage::CursorHide => DisplayEvent::CursorHide,
        ServerMessage::MouseMode(mode) => DisplayEvent::MouseMode(MouseMode::from_wire(mode)),
        ServerMessage::Reset => DisplayEvent::Reset,
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanout::tests::FdWatch;
    use std::io::Write;
    use vmview_proto::wire::{GlScanoutWire, RectWire, SurfaceCreateWire};

    #[test]
    fn test_translate_scanout_keeps_fd_open() {
        let (mut watch, fd) = FdWatch::new();
        let event = translate(ServerMessage::GlScanout {
            scanout: GlScanoutWire {
                format: u32::from_le_bytes(*b"AR24"),
                width: 64,
                height: 32,
                stride: 256,
                w: 64,
                h: 32,
                ..Default::default()
            },
            fd: Some(fd),
        })
        .unwrap();
        let DisplayEvent::Scanout(desc) = event else {
            panic!("Wrong event type");
        };
        assert!(!watch.is_closed());
        assert!(!desc.y0top);
        drop(desc);
        assert!(watch.is_closed());
    }

    #[test]
    fn test_translate_unknown_surface_format() {
        let (_watch, fd) = FdWatch::new();
        let result = translate(ServerMessage::PrimaryCreate {
            surface: SurfaceCreateWire {
                format: 1,
                width: 1,
                height: 1,
                stride: 4,
            },
            shm: fd,
        });
        assert!(matches!(result, Err(ProtocolError::UnknownSurfaceFormat(1))));
    }

    #[tokio::test]
    async fn test_events_cross_from_reader_thread() {
        let (server, viewer) = Channel::pair().unwrap();
        let mut client = ProtocolClient::spawn(viewer).unwrap();

        let path = std::env::temp_dir().join(format!("vmview-proto-{}", std::process::id()));
        let mut shm = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        shm.write_all(&[0u8; 16]).unwrap();
        std::fs::remove_file(&path).unwrap();

        server
            .send_server(&ServerMessage::PrimaryCreate {
                surface: SurfaceCreateWire {
                    format: 32,
                    width: 2,
                    height: 2,
                    stride: 8,
                },
                shm: shm.into(),
            })
            .unwrap();
        server
            .send_server(&ServerMessage::Invalidate(RectWire { x: 0, y: 0, w: 2, h: 2 }))
            .unwrap();
        drop(server);

        assert!(matches!(client.recv_event().await, Some(DisplayEvent::PrimaryCreate(_))));
        assert!(matches!(
            client.recv_event().await,
            Some(DisplayEvent::Invalidate(r)) if r == Rect::new(0, 0, 2, 2)
        ));
        assert!(matches!(client.recv_event().await, Some(DisplayEvent::Reset)));
        assert!(client.recv_event().await.is_none());
    }

    #[tokio::test]
    async fn test_outbound_reaches_server() {
        let (server, viewer) = Channel::pair().unwrap();
        let client = ProtocolClient::spawn(viewer).unwrap();
        client.send(&ClientMessage::GlDrawDone).unwrap();
        assert_eq!(server.recv_client().unwrap(), Some(ClientMessage::GlDrawDone));
    }
}
