//! vmview - remote VM display renderer
//!
//! Shows the framebuffer of a remote virtual machine in an X11 window, either
//! by blitting a shared-memory surface in software or by importing a dma-buf
//! scanout straight into a GL texture.

pub mod backend;
pub mod config;
pub mod convert;
pub mod cursor;
pub mod damage;
pub mod display;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod rect;
pub mod scaling;
pub mod scanout;
pub mod stats;
pub mod surface;
pub mod window;

pub use backend::{BackendKind, Pixbuf};
pub use display::{DisplayContext, DisplayEvent, DisplayOptions};
pub use error::{DisplayError, GpuError, ProtocolError};
pub use rect::Rect;
pub use scaling::{ScaleConfig, ScaleState};
pub use scanout::{Fourcc, ScanoutDescriptor};
