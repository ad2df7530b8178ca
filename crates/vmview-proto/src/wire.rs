//! Low-level binary layout of display channel messages.
//!
//! Every message travels as a single `SOCK_SEQPACKET` datagram:
//!
//! 1. **Header**: `MessageHeader`
//! 2. **Payload**: one of the fixed structs below, optionally followed by a
//!    variable tail (monitor array, cursor pixels)
//! 3. **Ancillary data** (SCM_RIGHTS): `[RawFd; num_fds]` (shared memory or dma-buf)
//!
//! All fields are native-endian `u32`/`i32` so the structs are `Pod` without padding.

use bytemuck::{Pod, Zeroable};
use std::mem;

/// Header for every message on the display channel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct MessageHeader {
    /// Protocol sync marker, always [`MessageHeader::MAGIC`]
    pub magic: u32,
    /// One of the `KIND_*` constants
    pub kind: u32,
    /// Bytes following the header
    pub payload_len: u32,
    /// Number of file descriptors attached via ancillary data
    pub num_fds: u32,
}

impl MessageHeader {
    pub const MAGIC: u32 = 0x5756_4d56; // "VMVW" in ASCII, little-endian

    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }
}

// Server -> viewer
pub const KIND_PRIMARY_CREATE: u32 = 1;
pub const KIND_PRIMARY_DESTROY: u32 = 2;
pub const KIND_INVALIDATE: u32 = 3;
pub const KIND_GL_SCANOUT: u32 = 4;
pub const KIND_GL_DRAW: u32 = 5;
pub const KIND_MONITORS_CONFIG: u32 = 6;
pub const KIND_MARK: u32 = 7;
pub const KIND_CURSOR_SET: u32 = 8;
pub const KIND_CURSOR_MOVE: u32 = 9;
pub const KIND_CURSOR_HIDE: u32 = 10;
pub const KIND_MOUSE_MODE: u32 = 11;
pub const KIND_RESET: u32 = 12;

// Viewer -> server
pub const KIND_GL_DRAW_DONE: u32 = 100;
pub const KIND_GUEST_RESIZE: u32 = 101;

/// Bit 0 of [`GlScanoutWire::flags`]: row 0 is the top scanline.
pub const SCANOUT_FLAG_Y0TOP: u32 = 1;

/// Primary surface announcement. The pixel memory arrives as a shared-memory fd.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SurfaceCreateWire {
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// A guest pixel-space rectangle (damage updates and GL draw requests).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RectWire {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Scanout update. A dma-buf fd follows as ancillary data when `format != 0`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GlScanoutWire {
    /// DRM fourcc, 0 means "no scanout"
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub flags: u32,
}

/// One entry of a monitors configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MonitorWire {
    pub id: u32,
    pub surface_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Prefix of a cursor shape message; `width * height * 4` RGBA bytes follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CursorSetWire {
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CursorMoveWire {
    pub x: i32,
    pub y: i32,
}

/// Single `u32` payloads: mark value, mouse mode, monitor count.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct U32Wire {
    pub value: u32,
}

/// Viewer request to resize a guest display.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GuestResizeWire {
    pub id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}
