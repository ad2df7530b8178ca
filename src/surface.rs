//! Primary surface storage
//!
//! The primary surface is the guest framebuffer announced by the server. Its
//! pixels live in shared memory the guest keeps writing to; 16-bit surfaces
//! additionally get a 32-bit conversion buffer covering the visible area.

use crate::convert::{self, ConvertError};
use crate::error::ProtocolError;
use crate::rect::Rect;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// Wire values for surface formats
pub const FORMAT_16_555: u32 = 16;
pub const FORMAT_32_XRGB: u32 = 32;
pub const FORMAT_16_565: u32 = 80;

/// Pixel layout of a primary surface
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    Rgb32,
    Rgb16_555,
    Rgb16_565,
}

impl SurfaceFormat {
    pub fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            FORMAT_32_XRGB => Ok(Self::Rgb32),
            FORMAT_16_555 => Ok(Self::Rgb16_555),
            FORMAT_16_565 => Ok(Self::Rgb16_565),
            other => Err(ProtocolError::UnknownSurfaceFormat(other)),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb32 => 4,
            Self::Rgb16_555 | Self::Rgb16_565 => 2,
        }
    }

    pub fn needs_conversion(self) -> bool {
        !matches!(self, Self::Rgb32)
    }
}

enum Backing {
    Heap(Vec<u8>),
    Mapped { ptr: NonNull<c_void>, len: usize },
}

/// Raw surface memory: either owned bytes or a read-only shared mapping
pub struct PixelBuffer {
    backing: Backing,
}

// The mapping is read-only on our side and is unmapped exactly once in Drop.
unsafe impl Send for PixelBuffer {}
unsafe impl Sync for PixelBuffer {}

impl PixelBuffer {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Heap(bytes),
        }
    }

    /// Map `len` bytes of a shared-memory fd. The fd is closed once mapped.
    pub fn map(fd: OwnedFd, len: usize) -> Result<Self, ProtocolError> {
        let Some(length) = NonZeroUsize::new(len) else {
            return Ok(Self::from_vec(Vec::new()));
        };
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(ProtocolError::SurfaceMap)?;
        debug!("Mapped {} bytes of surface memory", len);
        Ok(Self {
            backing: Backing::Mapped { ptr, len },
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Heap(bytes) => bytes,
            Backing::Mapped { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr() as *const u8, *len)
            },
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Backing::Mapped { ptr, len } = self.backing {
            if let Err(e) = unsafe { munmap(ptr, len) } {
                warn!("munmap of surface memory failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Heap(_) => "heap",
            Backing::Mapped { .. } => "mapped",
        };
        f.debug_struct("PixelBuffer")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

/// The guest framebuffer as announced by the server
#[derive(Debug, Clone)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: SurfaceFormat,
    pub pixels: Arc<PixelBuffer>,
}

impl Surface {
    /// Validate geometry against the buffer before accepting it
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: SurfaceFormat,
        pixels: PixelBuffer,
    ) -> Result<Self, ProtocolError> {
        let row = width as u64 * format.bytes_per_pixel() as u64;
        let needed = if height == 0 {
            0
        } else {
            stride as u64 * (height as u64 - 1) + row
        };
        if (stride as u64) < row || needed > pixels.len() as u64 {
            return Err(ProtocolError::SurfaceGeometry {
                width,
                height,
                stride,
                len: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            stride,
            format,
            pixels: Arc::new(pixels),
        })
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_u32(0, 0, self.width, self.height)
    }

    /// 32-bit pixel at surface coordinates; only meaningful for `Rgb32`
    fn rgb32_at(&self, x: i32, y: i32) -> u32 {
        let offset = y as usize * self.stride as usize + x as usize * 4;
        let bytes = &self.pixels.as_bytes()[offset..offset + 4];
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) | 0xFF00_0000
    }
}

/// Holds the primary surface, its visible area and the conversion buffer
#[derive(Debug, Default)]
pub struct SurfaceStore {
    surface: Option<Surface>,
    area: Rect,
    converted: Option<Vec<u32>>,
}

impl SurfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new primary surface. Any previous conversion buffer is dropped
    /// and the area is reset to cover the whole surface.
    pub fn replace(&mut self, surface: Surface) -> Result<(), ConvertError> {
        debug!(
            "Primary surface {}x{} stride {} {:?}",
            surface.width, surface.height, surface.stride, surface.format
        );
        let bounds = surface.bounds();
        self.surface = Some(surface);
        self.converted = None;
        self.set_area(bounds)
    }

    pub fn destroy(&mut self) {
        if self.surface.take().is_some() {
            debug!("Primary surface destroyed");
        }
        self.converted = None;
        self.area = Rect::default();
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    pub fn area(&self) -> Rect {
        self.area
    }

    /// Visible area with non-zero extent on an existing surface
    pub fn has_visible_area(&self) -> bool {
        self.surface.is_some() && !self.area.is_empty()
    }

    pub fn needs_conversion(&self) -> bool {
        self.surface
            .as_ref()
            .is_some_and(|s| s.format.needs_conversion())
    }

    /// Change the visible area. For 16-bit surfaces the conversion buffer is
    /// reallocated to the area size and fully converted.
    pub fn set_area(&mut self, area: Rect) -> Result<(), ConvertError> {
        let area = match &self.surface {
            Some(surface) => surface.bounds().intersect(&area).unwrap_or_default(),
            None => Rect::default(),
        };
        self.area = area;
        self.converted = None;

        if !self.needs_conversion() || area.is_empty() {
            return Ok(());
        }
        self.converted = Some(vec![0xFF00_0000; area.area()]);
        self.convert_rect(area)
    }

    /// Clip guest damage to the visible area and reconvert it when the surface
    /// is 16-bit. Returns the visible part, `None` when nothing is visible.
    pub fn refresh(&mut self, rect: Rect) -> Result<Option<Rect>, ConvertError> {
        if !self.has_visible_area() {
            return Ok(None);
        }
        let Some(visible) = self.area.intersect(&rect) else {
            return Ok(None);
        };
        self.convert_rect(visible)?;
        Ok(Some(visible))
    }

    /// Re-convert a damaged rectangle (guest coordinates, already clipped to the area)
    pub fn convert_rect(&mut self, rect: Rect) -> Result<(), ConvertError> {
        let (Some(surface), Some(dest)) = (self.surface.as_ref(), self.converted.as_mut()) else {
            return Ok(());
        };
        convert::convert_region(surface, self.area, rect, dest)
    }

    /// Visible pixel as 0xAARRGGBB, coordinates relative to the area origin
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        let surface = self.surface.as_ref()?;
        if x < 0 || y < 0 || x >= self.area.width || y >= self.area.height {
            return None;
        }
        match &self.converted {
            Some(buf) => buf
                .get(y as usize * self.area.width as usize + x as usize)
                .copied(),
            None if surface.format == SurfaceFormat::Rgb32 => {
                Some(surface.rgb32_at(self.area.x + x, self.area.y + y))
            }
            None => None,
        }
    }

    /// Row-major copy of the whole visible area as 0xAARRGGBB
    pub fn visible_pixels(&self) -> Vec<u32> {
        if !self.has_visible_area() {
            return Vec::new();
        }
        if let Some(buf) = &self.converted {
            return buf.clone();
        }
        let mut out = Vec::with_capacity(self.area.area());
        for y in 0..self.area.height {
            out.extend((0..self.area.width).map(|x| self.pixel(x, y).unwrap_or(0xFF00_0000)));
        }
        out
    }
}
