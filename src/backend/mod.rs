//! Rendering backends and the switching policy between them
//!
//! Exactly one backend is active. Damage on the primary surface selects the
//! software path; a new scanout or a GL draw request selects the hardware
//! path. The most recent event wins. Once the hardware pipeline has failed
//! to initialise every hardware request is answered with software.

pub mod egl;
pub mod hardware;
pub mod software;

pub use hardware::{GpuDevice, HardwareBackend};
pub use software::{Frame, Presenter, SoftwareBackend};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Software,
    Hardware,
}

/// Tightly packed image returned by screenshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixbuf {
    pub width: u32,
    pub height: u32,
    /// 3 (RGB) or 4 (RGBA)
    pub channels: u8,
    pub data: Vec<u8>,
}

impl Pixbuf {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn row_len(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn flip_vertical(&mut self) {
        let row = self.row_len();
        if row == 0 {
            return;
        }
        let rows = self.data.len() / row;
        for y in 0..rows / 2 {
            let (top, bottom) = self.data.split_at_mut((rows - 1 - y) * row);
            top[y * row..(y + 1) * row].swap_with_slice(&mut bottom[..row]);
        }
    }
}

/// Owner of both backends and the active tag
#[derive(Debug)]
pub struct Backends {
    active: BackendKind,
    software: SoftwareBackend,
    hardware: Option<HardwareBackend>,
}

impl Backends {
    pub fn new(hardware: Option<HardwareBackend>) -> Self {
        Self {
            active: BackendKind::Software,
            software: SoftwareBackend::new(),
            hardware,
        }
    }

    pub fn active(&self) -> BackendKind {
        self.active
    }

    pub fn use_software(&mut self) {
        if self.active != BackendKind::Software {
            debug!("Switching to software rendering");
            self.active = BackendKind::Software;
        }
    }

    /// Request the hardware backend. Returns the backend that is active afterwards.
    pub fn use_hardware(&mut self) -> BackendKind {
        let Some(hw) = self.hardware.as_mut() else {
            self.active = BackendKind::Software;
            return self.active;
        };
        match hw.activate() {
            Ok(()) => {
                if self.active != BackendKind::Hardware {
                    debug!("Switching to hardware rendering");
                }
                self.active = BackendKind::Hardware;
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!("Falling back to software rendering");
                }
                self.active = BackendKind::Software;
            }
        }
        self.active
    }

    pub fn software(&mut self) -> &mut SoftwareBackend {
        &mut self.software
    }

    /// The hardware backend, unless absent or failed
    pub fn hardware(&mut self) -> Option<&mut HardwareBackend> {
        self.hardware.as_mut().filter(|hw| !hw.is_failed())
    }

    pub fn hardware_available(&self) -> bool {
        self.hardware.as_ref().is_some_and(|hw| !hw.is_failed())
    }
}
