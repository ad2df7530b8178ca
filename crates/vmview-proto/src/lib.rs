//! vmview display channel protocol
//!
//! Message types exchanged between a display server (the VM side) and the
//! `vmview` viewer, plus the `SOCK_SEQPACKET` transport that carries them
//! together with file descriptors.

pub mod transport;
pub mod wire;

use bytemuck::Pod;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use thiserror::Error;
use wire::*;

pub use transport::Channel;

/// Default socket path for the display channel
pub fn socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join("vmview.sock")
}

/// Upper bound for a single datagram (cursor images are the largest payload)
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Upper bound for file descriptors attached to one datagram
pub const MAX_FDS: usize = 4;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("message kind {kind} truncated: need {need} bytes, got {got}")]
    Truncated { kind: u32, need: usize, got: usize },
    #[error("message kind {kind} expects {expected} fd(s), received {received}")]
    MissingFd {
        kind: u32,
        expected: usize,
        received: usize,
    },
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    #[error("datagram truncated by the kernel")]
    DatagramTruncated,
    #[error("socket error: {0}")]
    Io(#[from] nix::Error),
}

pub type Result<T, E = ProtoError> = std::result::Result<T, E>;

// ============================================================================
// Server -> Viewer
// ============================================================================

/// Messages sent from the display server to the viewer
#[derive(Debug)]
pub enum ServerMessage {
    /// A new primary surface; `shm` maps `stride * height` bytes of pixels
    PrimaryCreate {
        surface: SurfaceCreateWire,
        shm: OwnedFd,
    },

    /// The primary surface is gone
    PrimaryDestroy,

    /// Guest pixel-space damage rectangle
    Invalidate(RectWire),

    /// Scanout handoff; `fd` is present exactly when `scanout.format != 0`
    GlScanout {
        scanout: GlScanoutWire,
        fd: Option<OwnedFd>,
    },

    /// Draw the current scanout; must be acknowledged with `GlDrawDone`
    GlDraw(RectWire),

    /// Monitor layout of the primary surface
    MonitorsConfig(Vec<MonitorWire>),

    /// Display mark (non-zero once the guest has drawn its first frame)
    Mark(u32),

    /// New cursor shape with RGBA pixels
    CursorSet { shape: CursorSetWire, rgba: Vec<u8> },

    CursorMove(CursorMoveWire),

    CursorHide,

    /// 1 = server mouse mode, 2 = client mouse mode
    MouseMode(u32),

    /// Channel reset; descriptors held for this channel must be released
    Reset,
}

impl ServerMessage {
    pub fn kind(&self) -> u32 {
        match self {
            Self::PrimaryCreate { .. } => KIND_PRIMARY_CREATE,
            Self::PrimaryDestroy => KIND_PRIMARY_DESTROY,
            Self::Invalidate(_) => KIND_INVALIDATE,
            Self::GlScanout { .. } => KIND_GL_SCANOUT,
            Self::GlDraw(_) => KIND_GL_DRAW,
            Self::MonitorsConfig(_) => KIND_MONITORS_CONFIG,
            Self::Mark(_) => KIND_MARK,
            Self::CursorSet { .. } => KIND_CURSOR_SET,
            Self::CursorMove(_) => KIND_CURSOR_MOVE,
            Self::CursorHide => KIND_CURSOR_HIDE,
            Self::MouseMode(_) => KIND_MOUSE_MODE,
            Self::Reset => KIND_RESET,
        }
    }

    /// Encode into datagram bytes plus the raw fds to attach.
    ///
    /// The returned fds are borrowed from `self` and stay valid while it lives.
    pub fn encode(&self) -> (Vec<u8>, Vec<RawFd>) {
        let mut payload = Vec::new();
        let mut fds = Vec::new();
        match self {
            Self::PrimaryCreate { surface, shm } => {
                payload.extend_from_slice(bytemuck::bytes_of(surface));
                fds.push(shm.as_raw_fd());
            }
            Self::PrimaryDestroy | Self::CursorHide | Self::Reset => {}
            Self::Invalidate(rect) | Self::GlDraw(rect) => {
                payload.extend_from_slice(bytemuck::bytes_of(rect));
            }
            Self::GlScanout { scanout, fd } => {
                payload.extend_from_slice(bytemuck::bytes_of(scanout));
                if let Some(fd) = fd {
                    fds.push(fd.as_raw_fd());
                }
            }
            Self::MonitorsConfig(monitors) => {
                let count = U32Wire {
                    value: monitors.len() as u32,
                };
                payload.extend_from_slice(bytemuck::bytes_of(&count));
                payload.extend_from_slice(bytemuck::cast_slice(monitors));
            }
            Self::Mark(value) | Self::MouseMode(value) => {
                payload.extend_from_slice(bytemuck::bytes_of(&U32Wire { value: *value }));
            }
            Self::CursorSet { shape, rgba } => {
                payload.extend_from_slice(bytemuck::bytes_of(shape));
                payload.extend_from_slice(rgba);
            }
            Self::CursorMove(pos) => {
                payload.extend_from_slice(bytemuck::bytes_of(pos));
            }
        }
        (frame(self.kind(), &payload, fds.len()), fds)
    }

    /// Decode one datagram. Consumed fds are moved out of `fds`; any left over
    /// are dropped (closed) by the caller.
    pub fn decode(data: &[u8], fds: &mut VecDeque<OwnedFd>) -> Result<Self> {
        let (header, payload) = split_header(data)?;
        let kind = header.kind;
        let msg = match kind {
            KIND_PRIMARY_CREATE => {
                let surface: SurfaceCreateWire = read_pod(kind, payload, 0)?;
                let shm = take_fd(kind, fds, 1)?;
                Self::PrimaryCreate { surface, shm }
            }
            KIND_PRIMARY_DESTROY => Self::PrimaryDestroy,
            KIND_INVALIDATE => Self::Invalidate(read_pod(kind, payload, 0)?),
            KIND_GL_SCANOUT => {
                let scanout: GlScanoutWire = read_pod(kind, payload, 0)?;
                let fd = if scanout.format != 0 {
                    Some(take_fd(kind, fds, 1)?)
                } else {
                    None
                };
                Self::GlScanout { scanout, fd }
            }
            KIND_GL_DRAW => Self::GlDraw(read_pod(kind, payload, 0)?),
            KIND_MONITORS_CONFIG => {
                let count: U32Wire = read_pod(kind, payload, 0)?;
                let entry = std::mem::size_of::<MonitorWire>();
                let start = std::mem::size_of::<U32Wire>();
                let mut monitors =
                    Vec::with_capacity((count.value as usize).min(payload.len() / entry));
                for i in 0..count.value as usize {
                    monitors.push(read_pod(kind, payload, start + i * entry)?);
                }
                Self::MonitorsConfig(monitors)
            }
            KIND_MARK => Self::Mark(read_pod::<U32Wire>(kind, payload, 0)?.value),
            KIND_CURSOR_SET => {
                let shape: CursorSetWire = read_pod(kind, payload, 0)?;
                let start = std::mem::size_of::<CursorSetWire>();
                let len = shape.width as usize * shape.height as usize * 4;
                let rgba = payload
                    .get(start..start + len)
                    .ok_or(ProtoError::Truncated {
                        kind,
                        need: start + len,
                        got: payload.len(),
                    })?
                    .to_vec();
                Self::CursorSet { shape, rgba }
            }
            KIND_CURSOR_MOVE => Self::CursorMove(read_pod(kind, payload, 0)?),
            KIND_CURSOR_HIDE => Self::CursorHide,
            KIND_MOUSE_MODE => Self::MouseMode(read_pod::<U32Wire>(kind, payload, 0)?.value),
            KIND_RESET => Self::Reset,
            other => return Err(ProtoError::UnknownKind(other)),
        };
        Ok(msg)
    }
}

// ============================================================================
// Viewer -> Server
// ============================================================================

/// Messages sent from the viewer back to the display server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    /// The scanout requested by the last `GlDraw` has been presented
    GlDrawDone,

    /// Ask the guest to resize display `id`
    GuestResize(GuestResizeWire),
}

impl ClientMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::GlDrawDone => frame(KIND_GL_DRAW_DONE, &[], 0),
            Self::GuestResize(resize) => {
                frame(KIND_GUEST_RESIZE, bytemuck::bytes_of(resize), 0)
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, payload) = split_header(data)?;
        match header.kind {
            KIND_GL_DRAW_DONE => Ok(Self::GlDrawDone),
            KIND_GUEST_RESIZE => Ok(Self::GuestResize(read_pod(header.kind, payload, 0)?)),
            other => Err(ProtoError::UnknownKind(other)),
        }
    }
}

// ============================================================================
// Framing helpers
// ============================================================================

fn frame(kind: u32, payload: &[u8], num_fds: usize) -> Vec<u8> {
    let header = MessageHeader {
        magic: MessageHeader::MAGIC,
        kind,
        payload_len: payload.len() as u32,
        num_fds: num_fds as u32,
    };
    let mut buf = Vec::with_capacity(MessageHeader::size() + payload.len());
    buf.extend_from_slice(bytemuck::bytes_of(&header));
    buf.extend_from_slice(payload);
    buf
}

fn split_header(data: &[u8]) -> Result<(MessageHeader, &[u8])> {
    let header: MessageHeader = read_pod(0, data, 0)?;
    if header.magic != MessageHeader::MAGIC {
        return Err(ProtoError::BadMagic(header.magic));
    }
    let start = MessageHeader::size();
    let end = start + header.payload_len as usize;
    let payload = data.get(start..end).ok_or(ProtoError::Truncated {
        kind: header.kind,
        need: end,
        got: data.len(),
    })?;
    Ok((header, payload))
}

fn read_pod<T: Pod>(kind: u32, data: &[u8], offset: usize) -> Result<T> {
    let need = offset + std::mem::size_of::<T>();
    let bytes = data.get(offset..need).ok_or(ProtoError::Truncated {
        kind,
        need,
        got: data.len(),
    })?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

fn take_fd(kind: u32, fds: &mut VecDeque<OwnedFd>, expected: usize) -> Result<OwnedFd> {
    let received = fds.len();
    fds.pop_front().ok_or(ProtoError::MissingFd {
        kind,
        expected,
        received,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_invalidate() {
        let msg = ServerMessage::Invalidate(RectWire {
            x: 10,
            y: 20,
            w: 30,
            h: 40,
        });
        let (bytes, fds) = msg.encode();
        assert!(fds.is_empty());

        let decoded = ServerMessage::decode(&bytes, &mut VecDeque::new()).unwrap();
        match decoded {
            ServerMessage::Invalidate(rect) => {
                assert_eq!((rect.x, rect.y, rect.w, rect.h), (10, 20, 30, 40));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_scanout_without_format_needs_no_fd() {
        let msg = ServerMessage::GlScanout {
            scanout: GlScanoutWire::default(),
            fd: None,
        };
        let (bytes, fds) = msg.encode();
        assert!(fds.is_empty());

        match ServerMessage::decode(&bytes, &mut VecDeque::new()).unwrap() {
            ServerMessage::GlScanout { scanout, fd } => {
                assert_eq!(scanout.format, 0);
                assert!(fd.is_none());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_scanout_with_format_requires_fd() {
        let scanout = GlScanoutWire {
            format: u32::from_le_bytes(*b"XR24"),
            width: 64,
            height: 32,
            stride: 256,
            w: 64,
            h: 32,
            ..Default::default()
        };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(bytemuck::bytes_of(&MessageHeader {
            magic: MessageHeader::MAGIC,
            kind: KIND_GL_SCANOUT,
            payload_len: std::mem::size_of::<GlScanoutWire>() as u32,
            num_fds: 1,
        }));
        bytes.extend_from_slice(bytemuck::bytes_of(&scanout));

        let err = ServerMessage::decode(&bytes, &mut VecDeque::new()).unwrap_err();
        assert!(matches!(err, ProtoError::MissingFd { kind: KIND_GL_SCANOUT, .. }));
    }

    #[test]
    fn test_monitors_config_roundtrip() {
        let monitors = vec![
            MonitorWire {
                id: 0,
                surface_id: 0,
                x: 0,
                y: 0,
                width: 1024,
                height: 768,
            },
            MonitorWire {
                id: 1,
                surface_id: 0,
                x: 1024,
                y: 0,
                width: 800,
                height: 600,
            },
        ];
        let (bytes, _) = ServerMessage::MonitorsConfig(monitors.clone()).encode();
        match ServerMessage::decode(&bytes, &mut VecDeque::new()).unwrap() {
            ServerMessage::MonitorsConfig(decoded) => assert_eq!(decoded, monitors),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_cursor_is_rejected() {
        let (mut bytes, _) = ServerMessage::CursorSet {
            shape: CursorSetWire {
                width: 2,
                height: 2,
                hot_x: 0,
                hot_y: 0,
            },
            rgba: vec![0xff; 16],
        }
        .encode();
        bytes.truncate(bytes.len() - 4);
        assert!(ServerMessage::decode(&bytes, &mut VecDeque::new()).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = ClientMessage::GlDrawDone.encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtoError::BadMagic(_))
        ));
    }

    #[test]
    fn test_roundtrip_guest_resize() {
        let resize = GuestResizeWire {
            id: 1,
            x: 0,
            y: 0,
            width: 1280,
            height: 720,
        };
        let bytes = ClientMessage::GuestResize(resize).encode();
        assert_eq!(
            ClientMessage::decode(&bytes).unwrap(),
            ClientMessage::GuestResize(resize)
        );
    }
}
