//! Zero-copy rendering of dma-buf scanouts
//!
//! All geometry is computed here; the GL calls live behind [`GpuDevice`].

use super::Pixbuf;
use crate::error::GpuError;
use crate::rect::Rect;
use crate::scaling::ScaleState;
use crate::scanout::{Fourcc, ScanoutDescriptor};
use std::os::fd::BorrowedFd;
use tracing::{debug, error, info, trace, warn};

/// Parameters for importing one dma-buf plane
#[derive(Debug, Clone, Copy)]
pub struct DmabufImport<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: Fourcc,
    pub offset: u32,
}

/// Normalised texture rectangle; `th` is negative when flipped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexRect {
    pub tx: f32,
    pub ty: f32,
    pub tw: f32,
    pub th: f32,
}

/// Texture coordinates sampling `crop` out of a `width` x `height` buffer
pub fn texcoords(width: u32, height: u32, crop: Rect, y0top: bool) -> TexRect {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    let tx = crop.x as f32 / w;
    let mut ty = crop.y as f32 / h;
    let tw = crop.width as f32 / w;
    let mut th = crop.height as f32 / h;
    ty += 1.0 - th;
    if !y0top {
        ty = 1.0 - ty;
        th = -th;
    }
    TexRect { tx, ty, tw, th }
}

/// Column-major orthographic projection
pub fn ortho(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> [f32; 16] {
    let mut m = [0.0f32; 16];
    m[0] = 2.0 / (right - left);
    m[5] = 2.0 / (top - bottom);
    m[10] = -2.0 / (far - near);
    m[12] = -(right + left) / (right - left);
    m[13] = -(top + bottom) / (top - bottom);
    m[14] = -(far + near) / (far - near);
    m[15] = 1.0;
    m
}

/// Everything a device needs to draw one frame
#[derive(Debug, Clone, PartialEq)]
pub struct QuadFrame {
    pub viewport: (i32, i32),
    pub projection: [f32; 16],
    /// Four `vec4` positions in triangle-strip order
    pub positions: [f32; 16],
    /// Four `vec2` texture coordinates matching `positions`
    pub texcoords: [f32; 8],
    /// `false` means clear only
    pub textured: bool,
}

impl QuadFrame {
    pub fn blank(viewport: (i32, i32)) -> Self {
        let (w, h) = viewport;
        Self {
            viewport,
            projection: ortho(0.0, w.max(1) as f32, 0.0, h.max(1) as f32, -1.0, 1.0),
            positions: [0.0; 16],
            texcoords: [0.0; 8],
            textured: false,
        }
    }

    pub fn textured(viewport: (i32, i32), placement: Rect, tex: TexRect) -> Self {
        let (x, y) = (placement.x as f32, placement.y as f32);
        let (w, h) = (placement.width as f32, placement.height as f32);
        let TexRect { tx, ty, tw, th } = tex;
        Self {
            positions: [
                x, y, 0.0, 1.0,
                x + w, y, 0.0, 1.0,
                x, y + h, 0.0, 1.0,
                x + w, y + h, 0.0, 1.0,
            ],
            texcoords: [
                tx, ty,
                tx + tw, ty,
                tx, ty + th,
                tx + tw, ty + th,
            ],
            textured: true,
            ..Self::blank(viewport)
        }
    }

    /// Vertex buffer contents: positions followed by texcoords
    pub fn vertex_data(&self) -> [f32; 24] {
        let mut data = [0.0f32; 24];
        data[..16].copy_from_slice(&self.positions);
        data[16..].copy_from_slice(&self.texcoords);
        data
    }
}

/// GL operations the hardware backend needs
pub trait GpuDevice {
    /// Compile shaders and allocate the vertex buffer
    fn create_pipeline(&mut self) -> Result<(), GpuError>;

    /// Import a dma-buf and bind it as the current texture
    fn import_dmabuf(&mut self, import: &DmabufImport<'_>) -> Result<(), GpuError>;

    /// Destroy the current imported image, if any
    fn release_image(&mut self);

    /// Clear, then draw the quad when `frame.textured`
    fn draw(&mut self, frame: &QuadFrame) -> Result<(), GpuError>;

    fn swap_buffers(&mut self) -> Result<(), GpuError>;

    /// RGBA bytes of `rect` in GL window coordinates, bottom row first
    fn read_pixels(&mut self, rect: Rect) -> Result<Vec<u8>, GpuError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Uninitialized,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct ImportedImage {
    width: u32,
    height: u32,
    crop: Rect,
    y0top: bool,
}

pub struct HardwareBackend {
    device: Box<dyn GpuDevice>,
    pipeline: Pipeline,
    image: Option<ImportedImage>,
}

impl HardwareBackend {
    pub fn new(device: Box<dyn GpuDevice>) -> Self {
        Self {
            device,
            pipeline: Pipeline::Uninitialized,
            image: None,
        }
    }

    /// Build the GL pipeline on first use. A failure is permanent.
    pub fn activate(&mut self) -> Result<(), GpuError> {
        match self.pipeline {
            Pipeline::Ready => Ok(()),
            Pipeline::Failed => Err(GpuError::Unavailable),
            Pipeline::Uninitialized => match self.device.create_pipeline() {
                Ok(()) => {
                    info!("Hardware rendering pipeline ready");
                    self.pipeline = Pipeline::Ready;
                    Ok(())
                }
                Err(e) => {
                    error!("Hardware rendering disabled: {}", e);
                    self.pipeline = Pipeline::Failed;
                    Err(e)
                }
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        self.pipeline == Pipeline::Failed
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Re-import after a scanout change. The previous image is always
    /// released; a descriptor without an fd leaves the backend blank.
    pub fn update_scanout(&mut self, descriptor: Option<&ScanoutDescriptor>) -> Result<(), GpuError> {
        self.release_image();
        if self.pipeline != Pipeline::Ready {
            return Err(GpuError::Unavailable);
        }
        let Some(desc) = descriptor else {
            return Ok(());
        };
        let Some(fd) = desc.fd() else {
            debug!("Scanout {} has no buffer to import", desc.fourcc);
            return Ok(());
        };
        if !desc.fourcc.is_supported() {
            return Err(GpuError::Import {
                fourcc: desc.fourcc,
                width: desc.width,
                height: desc.height,
                reason: "unsupported fourcc".into(),
            });
        }

        self.device.import_dmabuf(&DmabufImport {
            fd,
            width: desc.width,
            height: desc.height,
            stride: desc.stride,
            fourcc: desc.fourcc,
            offset: 0,
        })?;
        self.image = Some(ImportedImage {
            width: desc.width,
            height: desc.height,
            crop: desc.crop,
            y0top: desc.y0top,
        });
        debug!("Imported scanout {} {}x{}", desc.fourcc, desc.width, desc.height);
        Ok(())
    }

    pub fn release_image(&mut self) {
        if self.image.take().is_some() {
            self.device.release_image();
        }
    }

    /// Frame description for the current image placed at `placement`
    pub fn frame(&self, window: (i32, i32), placement: &ScaleState) -> QuadFrame {
        match self.image {
            Some(img) => QuadFrame::textured(
                window,
                placement.placement(),
                texcoords(img.width, img.height, img.crop, img.y0top),
            ),
            None => QuadFrame::blank(window),
        }
    }

    pub fn draw(&mut self, window: (i32, i32), placement: &ScaleState) -> Result<(), GpuError> {
        if self.pipeline != Pipeline::Ready {
            return Err(GpuError::Unavailable);
        }
        let frame = self.frame(window, placement);
        trace!("Hardware draw {:?} textured={}", placement, frame.textured);
        self.device.draw(&frame)?;
        self.device.swap_buffers()
    }

    /// Redraw into the back buffer and read the displayed image back
    pub fn screenshot(&mut self, window: (i32, i32), placement: &ScaleState) -> Result<Pixbuf, GpuError> {
        if self.pipeline != Pipeline::Ready {
            return Err(GpuError::Unavailable);
        }
        let frame = self.frame(window, placement);
        self.device.draw(&frame)?;
        let rect = placement.placement();
        let rgba = self.device.read_pixels(rect)?;
        let expected = rect.area() * 4;
        if rgba.len() != expected {
            warn!("read_pixels returned {} bytes, expected {}", rgba.len(), expected);
            return Err(GpuError::Draw(0));
        }
        let mut pixbuf = Pixbuf::new(rect.width as u32, rect.height as u32, 4, rgba);
        pixbuf.flip_vertical();
        Ok(pixbuf)
    }
}

impl std::fmt::Debug for HardwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareBackend")
            .field("pipeline", &self.pipeline)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Call log shared between a test and its fake device
    #[derive(Debug, Default)]
    pub(crate) struct FakeLog {
        pub imports: usize,
        pub releases: usize,
        pub frames: Vec<QuadFrame>,
        pub swaps: usize,
    }

    pub(crate) struct FakeDevice {
        pub log: Rc<RefCell<FakeLog>>,
        pub fail_pipeline: bool,
        pub fail_import: bool,
    }

    impl FakeDevice {
        pub(crate) fn new() -> (Self, Rc<RefCell<FakeLog>>) {
            let log = Rc::new(RefCell::new(FakeLog::default()));
            (
                Self {
                    log: log.clone(),
                    fail_pipeline: false,
                    fail_import: false,
                },
                log,
            )
        }
    }

    impl GpuDevice for FakeDevice {
        fn create_pipeline(&mut self) -> Result<(), GpuError> {
            if self.fail_pipeline {
                return Err(GpuError::Shader("0:1: syntax error".into()));
            }
            Ok(())
        }

        fn import_dmabuf(&mut self, import: &DmabufImport<'_>) -> Result<(), GpuError> {
            if self.fail_import {
                return Err(GpuError::Import {
                    fourcc: import.fourcc,
                    width: import.width,
                    height: import.height,
                    reason: "EGL_BAD_MATCH".into(),
                });
            }
            self.log.borrow_mut().imports += 1;
            Ok(())
        }

        fn release_image(&mut self) {
            self.log.borrow_mut().releases += 1;
        }

        fn draw(&mut self, frame: &QuadFrame) -> Result<(), GpuError> {
            self.log.borrow_mut().frames.push(frame.clone());
            Ok(())
        }

        fn swap_buffers(&mut self) -> Result<(), GpuError> {
            self.log.borrow_mut().swaps += 1;
            Ok(())
        }

        fn read_pixels(&mut self, rect: Rect) -> Result<Vec<u8>, GpuError> {
            // Row r is filled with the value r so flips are observable.
            let mut out = Vec::with_capacity(rect.area() * 4);
            for row in 0..rect.height {
                out.extend(std::iter::repeat(row as u8).take(rect.width as usize * 4));
            }
            Ok(out)
        }
    }

    use crate::scanout::tests::{descriptor, FdWatch};

    const FULL: ScaleState = ScaleState { s: 1.0, x: 0, y: 0, w: 200, h: 100 };

    #[test]
    fn test_texcoords_full_buffer() {
        let t = texcoords(200, 100, Rect::new(0, 0, 200, 100), true);
        assert_eq!(t, TexRect { tx: 0.0, ty: 0.0, tw: 1.0, th: 1.0 });
        let t = texcoords(200, 100, Rect::new(0, 0, 200, 100), false);
        assert_eq!(t, TexRect { tx: 0.0, ty: 1.0, tw: 1.0, th: -1.0 });
    }

    #[test]
    fn test_texcoords_crop_and_flip() {
        let crop = Rect::new(50, 10, 100, 50);
        let t = texcoords(200, 100, crop, true);
        assert_eq!((t.tx, t.tw, t.th), (0.25, 0.5, 0.5));
        assert!((t.ty - 0.6).abs() < 1e-6);

        let t = texcoords(200, 100, crop, false);
        assert!((t.ty - 0.4).abs() < 1e-6);
        assert_eq!(t.th, -0.5);
    }

    #[test]
    fn test_ortho_maps_corners() {
        let m = ortho(0.0, 200.0, 0.0, 100.0, -1.0, 1.0);
        let apply = |x: f32, y: f32| (m[0] * x + m[12], m[5] * y + m[13]);
        assert_eq!(apply(0.0, 0.0), (-1.0, -1.0));
        assert_eq!(apply(200.0, 100.0), (1.0, 1.0));
    }

    #[test]
    fn test_quad_is_triangle_strip_order() {
        let frame = QuadFrame::textured(
            (300, 200),
            Rect::new(10, 20, 100, 50),
            TexRect { tx: 0.0, ty: 0.0, tw: 1.0, th: 1.0 },
        );
        let data = frame.vertex_data();
        assert_eq!(&data[0..4], &[10.0, 20.0, 0.0, 1.0]);
        assert_eq!(&data[4..6], &[110.0, 20.0]);
        assert_eq!(&data[8..10], &[10.0, 70.0]);
        assert_eq!(&data[12..14], &[110.0, 70.0]);
        assert_eq!(&data[16..], &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_pipeline_failure_is_permanent() {
        let (mut dev, _log) = FakeDevice::new();
        dev.fail_pipeline = true;
        let mut hw = HardwareBackend::new(Box::new(dev));
        assert!(matches!(hw.activate(), Err(GpuError::Shader(_))));
        assert!(hw.is_failed());
        assert!(matches!(hw.activate(), Err(GpuError::Unavailable)));
    }

    #[test]
    fn test_import_failure_draws_blank_frame() {
        let (mut dev, log) = FakeDevice::new();
        dev.fail_import = true;
        let mut hw = HardwareBackend::new(Box::new(dev));
        hw.activate().unwrap();

        let (_watch, fd) = FdWatch::new();
        let desc = descriptor(fd, true);
        assert!(matches!(hw.update_scanout(Some(&desc)), Err(GpuError::Import { .. })));
        assert!(!hw.has_image());

        hw.draw((200, 100), &FULL).unwrap();
        let log = log.borrow();
        assert!(!log.frames[0].textured);
        assert_eq!(log.swaps, 1);
    }

    #[test]
    fn test_reimport_releases_previous_image() {
        let (dev, log) = FakeDevice::new();
        let mut hw = HardwareBackend::new(Box::new(dev));
        hw.activate().unwrap();

        let (_p1, fd1) = FdWatch::new();
        let (_p2, fd2) = FdWatch::new();
        hw.update_scanout(Some(&descriptor(fd1, true))).unwrap();
        hw.update_scanout(Some(&descriptor(fd2, false))).unwrap();
        assert_eq!(log.borrow().imports, 2);
        assert_eq!(log.borrow().releases, 1);

        hw.draw((200, 100), &FULL).unwrap();
        let frame = log.borrow().frames[0].clone();
        assert!(frame.textured);
        // Bottom-up buffer: first vertex samples the flipped top edge.
        assert_eq!(&frame.texcoords[0..2], &[0.0, 1.0]);
    }

    #[test]
    fn test_unsupported_fourcc_is_rejected() {
        let (dev, log) = FakeDevice::new();
        let mut hw = HardwareBackend::new(Box::new(dev));
        hw.activate().unwrap();
        let (_watch, fd) = FdWatch::new();
        let mut desc = descriptor(fd, true);
        desc.fourcc = Fourcc::from_bytes(*b"NV12");
        assert!(matches!(hw.update_scanout(Some(&desc)), Err(GpuError::Import { .. })));
        assert_eq!(log.borrow().imports, 0);
    }

    #[test]
    fn test_screenshot_is_flipped() {
        let (dev, _log) = FakeDevice::new();
        let mut hw = HardwareBackend::new(Box::new(dev));
        hw.activate().unwrap();
        let placement = ScaleState { s: 1.0, x: 0, y: 0, w: 2, h: 3 };
        let shot = hw.screenshot((2, 3), &placement).unwrap();
        assert_eq!(shot.channels, 4);
        assert_eq!(shot.data[0], 2);
        assert_eq!(shot.data[shot.data.len() - 1], 0);
    }
}
