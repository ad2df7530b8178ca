//! Scanout descriptors and their fd lifetime
//!
//! A scanout is a GPU buffer exported by the server as a dma-buf fd plus the
//! geometry needed to sample it. `ScanoutResource` holds at most one live
//! descriptor; replacing or clearing it closes the previous fd exactly once,
//! since the fd is an `OwnedFd` that only ever has one owner.

use crate::rect::Rect;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tracing::debug;
use vmview_proto::wire::{GlScanoutWire, SCANOUT_FLAG_Y0TOP};

/// DRM fourcc code; 0 means "no scanout"
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const NONE: Fourcc = Fourcc(0);
    pub const XRGB8888: Fourcc = Fourcc::from_bytes(*b"XR24");
    pub const ARGB8888: Fourcc = Fourcc::from_bytes(*b"AR24");
    pub const XBGR8888: Fourcc = Fourcc::from_bytes(*b"XB24");
    pub const ABGR8888: Fourcc = Fourcc::from_bytes(*b"AB24");

    pub const fn from_bytes(b: [u8; 4]) -> Self {
        Fourcc(u32::from_le_bytes(b))
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_supported(self) -> bool {
        matches!(
            self,
            Self::XRGB8888 | Self::ARGB8888 | Self::XBGR8888 | Self::ABGR8888
        )
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        for b in self.0.to_le_bytes() {
            let c = if b.is_ascii_graphic() { b as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({})", self)
    }
}

/// Geometry and buffer handle of one scanout
#[derive(Debug)]
pub struct ScanoutDescriptor {
    fd: Option<OwnedFd>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: Fourcc,
    /// Region of the buffer to display
    pub crop: Rect,
    /// Row 0 is the top scanline
    pub y0top: bool,
}

impl ScanoutDescriptor {
    pub fn new(
        fd: OwnedFd,
        width: u32,
        height: u32,
        stride: u32,
        fourcc: Fourcc,
        crop: Rect,
        y0top: bool,
    ) -> Self {
        Self {
            fd: Some(fd),
            width,
            height,
            stride,
            fourcc,
            crop,
            y0top,
        }
    }

    /// The "no scanout" descriptor
    pub fn none() -> Self {
        Self {
            fd: None,
            width: 0,
            height: 0,
            stride: 0,
            fourcc: Fourcc::NONE,
            crop: Rect::default(),
            y0top: false,
        }
    }

    /// Build from a wire message. A format-0 message never keeps an fd.
    pub fn from_wire(wire: &GlScanoutWire, fd: Option<OwnedFd>) -> Self {
        let fourcc = Fourcc(wire.format);
        if fourcc.is_none() {
            return Self::none();
        }
        Self {
            fd,
            width: wire.width,
            height: wire.height,
            stride: wire.stride,
            fourcc,
            crop: Rect::from_u32(wire.x, wire.y, wire.w, wire.h),
            y0top: wire.flags & SCANOUT_FLAG_Y0TOP != 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.fourcc.is_none()
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutState {
    Unset,
    Active,
    Closed,
}

/// Result of [`ScanoutResource::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutUpdate {
    /// A new buffer is available
    Replaced,
    /// The server withdrew the scanout
    Cleared,
}

/// Owner of the current scanout descriptor
#[derive(Debug)]
pub struct ScanoutResource {
    current: Option<ScanoutDescriptor>,
    state: ScanoutState,
    generation: u64,
}

impl Default for ScanoutResource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanoutResource {
    pub fn new() -> Self {
        Self {
            current: None,
            state: ScanoutState::Unset,
            generation: 0,
        }
    }

    pub fn update(&mut self, descriptor: ScanoutDescriptor) -> ScanoutUpdate {
        if descriptor.is_none() {
            // Closes whatever was held; the incoming descriptor carries nothing.
            self.current = None;
            self.state = ScanoutState::Unset;
            debug!("Scanout cleared");
            return ScanoutUpdate::Cleared;
        }

        debug!(
            "Scanout {} {}x{} stride {} crop {:?} y0top={}",
            descriptor.fourcc,
            descriptor.width,
            descriptor.height,
            descriptor.stride,
            descriptor.crop,
            descriptor.y0top
        );
        let previous = self.current.replace(descriptor);
        self.state = ScanoutState::Active;
        self.generation += 1;
        drop(previous);
        ScanoutUpdate::Replaced
    }

    /// Close the live descriptor, if any
    pub fn close(&mut self) {
        if self.current.take().is_some() {
            debug!("Scanout closed");
        }
        self.state = ScanoutState::Closed;
    }

    pub fn descriptor(&self) -> Option<&ScanoutDescriptor> {
        self.current.as_ref()
    }

    pub fn state(&self) -> ScanoutState {
        self.state
    }

    /// Bumped on every replacement
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use std::fs::File;
    use std::io::{ErrorKind, Read};

    /// A pipe whose write end stands in for a dma-buf fd. Reading the read end
    /// returns EOF exactly when every copy of the write end has been closed.
    pub(crate) struct FdWatch {
        reader: File,
    }

    impl FdWatch {
        pub(crate) fn new() -> (Self, OwnedFd) {
            let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
            (
                Self {
                    reader: File::from(read_end),
                },
                write_end,
            )
        }

        pub(crate) fn is_closed(&mut self) -> bool {
            let mut buf = [0u8; 1];
            match self.reader.read(&mut buf) {
                Ok(0) => true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => false,
                other => panic!("unexpected pipe read result: {:?}", other),
            }
        }
    }

    pub(crate) fn descriptor(fd: OwnedFd, y0top: bool) -> ScanoutDescriptor {
        ScanoutDescriptor::new(
            fd,
            200,
            100,
            800,
            Fourcc::XRGB8888,
            Rect::new(0, 0, 200, 100),
            y0top,
        )
    }

    #[test]
    fn test_replacement_closes_previous_fd() {
        let mut res = ScanoutResource::new();
        let (mut first, fd1) = FdWatch::new();
        let (mut second, fd2) = FdWatch::new();

        res.update(descriptor(fd1, true));
        assert!(!first.is_closed());

        assert_eq!(res.update(descriptor(fd2, true)), ScanoutUpdate::Replaced);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(res.generation(), 2);

        res.close();
        assert!(second.is_closed());
        assert_eq!(res.state(), ScanoutState::Closed);
    }

    #[test]
    fn test_format_zero_closes_and_reports_none() {
        let mut res = ScanoutResource::new();
        let (mut watch, fd) = FdWatch::new();
        res.update(descriptor(fd, false));

        assert_eq!(res.update(ScanoutDescriptor::none()), ScanoutUpdate::Cleared);
        assert!(watch.is_closed());
        assert!(res.descriptor().is_none());
        assert_eq!(res.state(), ScanoutState::Unset);
    }

    #[test]
    fn test_format_zero_wire_drops_stray_fd() {
        let (mut watch, fd) = FdWatch::new();
        let desc = ScanoutDescriptor::from_wire(&GlScanoutWire::default(), Some(fd));
        assert!(desc.is_none());
        assert!(desc.fd().is_none());
        assert!(watch.is_closed());
    }

    #[test]
    fn test_drop_closes_live_fd() {
        let (mut watch, fd) = FdWatch::new();
        {
            let mut res = ScanoutResource::new();
            res.update(descriptor(fd, true));
        }
        assert!(watch.is_closed());
    }

    #[test]
    fn test_fourcc_display() {
        assert_eq!(Fourcc::XRGB8888.to_string(), "XR24");
        assert!(Fourcc::ABGR8888.is_supported());
        assert!(!Fourcc::from_bytes(*b"NV12").is_supported());
    }
}
