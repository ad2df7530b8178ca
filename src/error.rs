//! Error types for the display core

use crate::convert::ConvertError;
use crate::scanout::Fourcc;
use thiserror::Error;

/// Malformed or unsupported input from the display channel
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("monitor {monitor_id} is bound to surface {surface_id}, only the primary surface (0) can be displayed")]
    NonPrimarySurface { monitor_id: u32, surface_id: u32 },

    #[error("unknown surface format {0}")]
    UnknownSurfaceFormat(u32),

    #[error("surface {width}x{height} with stride {stride} does not fit its {len} byte buffer")]
    SurfaceGeometry {
        width: u32,
        height: u32,
        stride: u32,
        len: usize,
    },

    #[error("failed to map primary surface memory: {0}")]
    SurfaceMap(#[source] nix::Error),

    #[error("cursor shape {width}x{height} does not match {len} bytes of pixel data")]
    CursorShape { width: u32, height: u32, len: usize },

    #[error("cursor hotspot ({hot_x}, {hot_y}) lies outside the {width}x{height} image")]
    CursorHotspot {
        hot_x: u32,
        hot_y: u32,
        width: u32,
        height: u32,
    },

    #[error(transparent)]
    Wire(#[from] vmview_proto::ProtoError),
}

/// Failures of the GPU rendering path
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("EGL/GL context setup failed: {0}")]
    Context(String),

    #[error("shader compilation failed: {0}")]
    Shader(String),

    #[error("program linking failed: {0}")]
    Link(String),

    #[error("required extension {0} is not available")]
    Extension(&'static str),

    #[error("dma-buf import failed for {fourcc} {width}x{height}: {reason}")]
    Import {
        fourcc: Fourcc,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("GL error 0x{0:04x} while drawing")]
    Draw(u32),

    #[error("hardware rendering is not available")]
    Unavailable,
}

impl GpuError {
    /// Errors after which the hardware path must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GpuError::Context(_) | GpuError::Shader(_) | GpuError::Link(_) | GpuError::Extension(_)
        )
    }
}

/// Anything a display event or repaint can fail with
#[derive(Debug, Error)]
pub enum DisplayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("presenting frame failed: {0}")]
    Present(String),
}

pub type Result<T, E = DisplayError> = std::result::Result<T, E>;
