//! EGL/GLES2 implementation of [`GpuDevice`]
//!
//! libEGL is loaded at runtime; the dma-buf import entry points come from
//! `eglGetProcAddress`.

use super::hardware::{DmabufImport, GpuDevice, QuadFrame};
use crate::error::GpuError;
use crate::rect::Rect;
use khronos_egl as egl;
use std::ffi::{c_void, CStr, CString};
use std::os::fd::AsRawFd;
use std::ptr;
use tracing::{debug, info, warn};
use x11_dl::xlib::{self, Xlib};

// EGL_EXT_image_dma_buf_import
const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;
const EGL_DMA_BUF_PLANE0_FD_EXT: i32 = 0x3272;
const EGL_DMA_BUF_PLANE0_OFFSET_EXT: i32 = 0x3273;
const EGL_DMA_BUF_PLANE0_PITCH_EXT: i32 = 0x3274;

type EglImage = *mut c_void;
type CreateImageKhr = unsafe extern "system" fn(
    dpy: *mut c_void,
    ctx: *mut c_void,
    target: u32,
    buffer: *mut c_void,
    attribs: *const i32,
) -> EglImage;
type DestroyImageKhr = unsafe extern "system" fn(dpy: *mut c_void, image: EglImage) -> u32;
type ImageTargetTexture2dOes = unsafe extern "system" fn(target: u32, image: EglImage);

const VERTEX_SHADER: &str = r#"#version 100
attribute vec4 position;
attribute vec2 texcoords;
uniform mat4 mproj;
varying vec2 v_texcoords;

void main() {
    v_texcoords = texcoords;
    gl_Position = mproj * position;
}
"#;

const FRAGMENT_SHADER: &str = r#"#version 100
precision mediump float;
varying highp vec2 v_texcoords;
uniform sampler2D samp;

void main() {
    gl_FragColor = texture2D(samp, v_texcoords);
}
"#;

/// GL objects created by [`GpuDevice::create_pipeline`]
struct Pipeline {
    program: u32,
    vbo: u32,
    texture: u32,
    attr_position: u32,
    attr_texcoords: u32,
    uniform_mproj: i32,
    uniform_samp: i32,
}

pub struct EglDevice {
    egl: egl::DynamicInstance<egl::EGL1_4>,
    xlib: Xlib,
    x_display: *mut xlib::Display,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    create_image: CreateImageKhr,
    destroy_image: DestroyImageKhr,
    image_target_texture: ImageTargetTexture2dOes,
    pipeline: Option<Pipeline>,
    image: Option<EglImage>,
}

fn context_err(what: &str) -> impl FnOnce(egl::Error) -> GpuError + '_ {
    move |e| GpuError::Context(format!("{}: {}", what, e))
}

impl EglDevice {
    /// Create a GLES2 context rendering into the X11 window `window`
    pub fn new(window: u32) -> Result<Self, GpuError> {
        let egl = unsafe { egl::DynamicInstance::<egl::EGL1_4>::load_required() }
            .map_err(|e| GpuError::Context(format!("failed to load libEGL: {}", e)))?;
        let xlib = Xlib::open().map_err(|e| GpuError::Context(format!("failed to load libX11: {}", e)))?;

        let x_display = unsafe { (xlib.XOpenDisplay)(ptr::null()) };
        if x_display.is_null() {
            return Err(GpuError::Context("failed to open X11 display".into()));
        }

        match Self::with_display(egl, xlib, x_display, window) {
            Ok(dev) => Ok(dev),
            Err((xlib, e)) => {
                unsafe { (xlib.XCloseDisplay)(x_display) };
                Err(e)
            }
        }
    }

    fn with_display(
        egl: egl::DynamicInstance<egl::EGL1_4>,
        xlib: Xlib,
        x_display: *mut xlib::Display,
        window: u32,
    ) -> Result<Self, (Xlib, GpuError)> {
        let display = match unsafe { egl.get_display(x_display as egl::NativeDisplayType) } {
            Some(d) => d,
            None => return Err((xlib, GpuError::Context("eglGetDisplay returned no display".into()))),
        };

        let setup = || -> Result<_, GpuError> {
            let (major, minor) = egl.initialize(display).map_err(context_err("eglInitialize"))?;
            info!("EGL version {}.{}", major, minor);

            let extensions = egl
                .query_string(Some(display), egl::EXTENSIONS)
                .map_err(context_err("eglQueryString"))?
                .to_string_lossy();
            if !extensions.contains("EGL_EXT_image_dma_buf_import") {
                return Err(GpuError::Extension("EGL_EXT_image_dma_buf_import"));
            }

            egl.bind_api(egl::OPENGL_ES_API)
                .map_err(context_err("eglBindAPI"))?;

            let attribs = [
                egl::SURFACE_TYPE, egl::WINDOW_BIT,
                egl::RENDERABLE_TYPE, egl::OPENGL_ES2_BIT,
                egl::RED_SIZE, 8,
                egl::GREEN_SIZE, 8,
                egl::BLUE_SIZE, 8,
                egl::NONE,
            ];
            let config = egl
                .choose_first_config(display, &attribs)
                .map_err(context_err("eglChooseConfig"))?
                .ok_or_else(|| GpuError::Context("no GLES2 window config".into()))?;

            let ctx_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
            let context = egl
                .create_context(display, config, None, &ctx_attribs)
                .map_err(context_err("eglCreateContext"))?;

            let surface = unsafe {
                egl.create_window_surface(
                    display,
                    config,
                    window as usize as egl::NativeWindowType,
                    None,
                )
            }
            .map_err(context_err("eglCreateWindowSurface"))?;

            egl.make_current(display, Some(surface), Some(surface), Some(context))
                .map_err(context_err("eglMakeCurrent"))?;

            Ok((context, surface))
        };

        let (context, surface) = match setup() {
            Ok(v) => v,
            Err(e) => {
                let _ = egl.terminate(display);
                return Err((xlib, e));
            }
        };

        gl::load_with(|symbol| {
            egl.get_proc_address(symbol)
                .map_or(ptr::null(), |f| f as *const c_void)
        });

        let create_image = egl.get_proc_address("eglCreateImageKHR");
        let destroy_image = egl.get_proc_address("eglDestroyImageKHR");
        let image_target = egl.get_proc_address("glEGLImageTargetTexture2DOES");
        let (Some(create_image), Some(destroy_image), Some(image_target)) =
            (create_image, destroy_image, image_target)
        else {
            let _ = egl.make_current(display, None, None, None);
            let _ = egl.destroy_surface(display, surface);
            let _ = egl.destroy_context(display, context);
            let _ = egl.terminate(display);
            return Err((xlib, GpuError::Extension("EGL_KHR_image_base / GL_OES_EGL_image")));
        };

        info!("EGL context created for window 0x{:x}", window);

        Ok(Self {
            egl,
            xlib,
            x_display,
            display,
            context,
            surface,
            create_image: unsafe { std::mem::transmute::<extern "system" fn(), CreateImageKhr>(create_image) },
            destroy_image: unsafe { std::mem::transmute::<extern "system" fn(), DestroyImageKhr>(destroy_image) },
            image_target_texture: unsafe {
                std::mem::transmute::<extern "system" fn(), ImageTargetTexture2dOes>(image_target)
            },
            pipeline: None,
            image: None,
        })
    }

    fn make_current(&self) -> Result<(), GpuError> {
        self.egl
            .make_current(self.display, Some(self.surface), Some(self.surface), Some(self.context))
            .map_err(context_err("eglMakeCurrent"))
    }

    fn compile_shader(source: &str, shader_type: u32) -> Result<u32, GpuError> {
        let c_str = CString::new(source).map_err(|e| GpuError::Shader(e.to_string()))?;
        unsafe {
            let shader = gl::CreateShader(shader_type);
            gl::ShaderSource(shader, 1, &c_str.as_ptr(), ptr::null());
            gl::CompileShader(shader);

            let mut success = 0;
            gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut success);
            if success == 0 {
                let mut len = 0;
                gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
                let mut buffer = vec![0u8; len.max(1) as usize];
                gl::GetShaderInfoLog(shader, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
                gl::DeleteShader(shader);
                return Err(GpuError::Shader(String::from_utf8_lossy(&buffer).trim_end_matches('\0').to_string()));
            }
            Ok(shader)
        }
    }

    fn link_program(vs: u32, fs: u32) -> Result<u32, GpuError> {
        unsafe {
            let program = gl::CreateProgram();
            gl::AttachShader(program, vs);
            gl::AttachShader(program, fs);
            gl::LinkProgram(program);

            let mut success = 0;
            gl::GetProgramiv(program, gl::LINK_STATUS, &mut success);
            if success == 0 {
                let mut len = 0;
                gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
                let mut buffer = vec![0u8; len.max(1) as usize];
                gl::GetProgramInfoLog(program, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
                gl::DeleteProgram(program);
                return Err(GpuError::Link(String::from_utf8_lossy(&buffer).trim_end_matches('\0').to_string()));
            }
            Ok(program)
        }
    }

    fn attrib_location(program: u32, name: &CStr) -> Result<u32, GpuError> {
        let loc = unsafe { gl::GetAttribLocation(program, name.as_ptr()) };
        u32::try_from(loc).map_err(|_| GpuError::Link(format!("attribute {:?} not found", name)))
    }

    fn check_gl(what: &str) -> Result<(), GpuError> {
        let err = unsafe { gl::GetError() };
        if err != gl::NO_ERROR {
            warn!("OpenGL error during {}: 0x{:x}", what, err);
            return Err(GpuError::Draw(err));
        }
        Ok(())
    }
}

impl GpuDevice for EglDevice {
    fn create_pipeline(&mut self) -> Result<(), GpuError> {
        if self.pipeline.is_some() {
            return Ok(());
        }
        self.make_current()?;

        let vs = Self::compile_shader(VERTEX_SHADER, gl::VERTEX_SHADER)?;
        let fs = match Self::compile_shader(FRAGMENT_SHADER, gl::FRAGMENT_SHADER) {
            Ok(fs) => fs,
            Err(e) => {
                unsafe { gl::DeleteShader(vs) };
                return Err(e);
            }
        };
        let program = Self::link_program(vs, fs);
        unsafe {
            gl::DeleteShader(vs);
            gl::DeleteShader(fs);
        }
        let program = program?;

        let attr_position = Self::attrib_location(program, c"position")?;
        let attr_texcoords = Self::attrib_location(program, c"texcoords")?;
        let (uniform_mproj, uniform_samp) = unsafe {
            (
                gl::GetUniformLocation(program, c"mproj".as_ptr()),
                gl::GetUniformLocation(program, c"samp".as_ptr()),
            )
        };

        let mut vbo = 0;
        let mut texture = 0;
        unsafe {
            gl::GenBuffers(1, &mut vbo);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                (24 * std::mem::size_of::<f32>()) as isize,
                ptr::null(),
                gl::DYNAMIC_DRAW,
            );

            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::NEAREST as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
        }
        Self::check_gl("pipeline setup").map_err(|e| GpuError::Context(e.to_string()))?;

        debug!("GLES pipeline: program {} vbo {} texture {}", program, vbo, texture);
        self.pipeline = Some(Pipeline {
            program,
            vbo,
            texture,
            attr_position,
            attr_texcoords,
            uniform_mproj,
            uniform_samp,
        });
        Ok(())
    }

    fn import_dmabuf(&mut self, import: &DmabufImport<'_>) -> Result<(), GpuError> {
        let texture = self.pipeline.as_ref().map(|p| p.texture).ok_or(GpuError::Unavailable)?;
        self.make_current()?;
        self.release_image();

        let attribs = [
            EGL_LINUX_DRM_FOURCC_EXT, import.fourcc.0 as i32,
            egl::WIDTH, import.width as i32,
            egl::HEIGHT, import.height as i32,
            EGL_DMA_BUF_PLANE0_FD_EXT, import.fd.as_raw_fd(),
            EGL_DMA_BUF_PLANE0_OFFSET_EXT, import.offset as i32,
            EGL_DMA_BUF_PLANE0_PITCH_EXT, import.stride as i32,
            egl::NONE,
        ];
        let image = unsafe {
            (self.create_image)(
                self.display.as_ptr(),
                ptr::null_mut(),
                EGL_LINUX_DMA_BUF_EXT,
                ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        if image.is_null() {
            let reason = match self.egl.get_error() {
                Some(e) => e.to_string(),
                None => "eglCreateImageKHR returned no image".to_string(),
            };
            return Err(GpuError::Import {
                fourcc: import.fourcc,
                width: import.width,
                height: import.height,
                reason,
            });
        }

        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture);
            (self.image_target_texture)(gl::TEXTURE_2D, image);
        }
        self.image = Some(image);
        if let Err(e) = Self::check_gl("dma-buf bind") {
            self.release_image();
            return Err(GpuError::Import {
                fourcc: import.fourcc,
                width: import.width,
                height: import.height,
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    fn release_image(&mut self) {
        if let Some(image) = self.image.take() {
            unsafe { (self.destroy_image)(self.display.as_ptr(), image) };
        }
    }

    fn draw(&mut self, frame: &QuadFrame) -> Result<(), GpuError> {
        let Some(p) = self.pipeline.as_ref() else {
            return Err(GpuError::Unavailable);
        };
        self.make_current()?;
        let (w, h) = frame.viewport;
        let data = frame.vertex_data();
        unsafe {
            gl::Viewport(0, 0, w, h);
            gl::ClearColor(0.0, 0.0, 0.0, 0.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);

            if frame.textured && self.image.is_some() {
                gl::UseProgram(p.program);
                gl::UniformMatrix4fv(p.uniform_mproj, 1, gl::FALSE, frame.projection.as_ptr());
                gl::Uniform1i(p.uniform_samp, 0);
                gl::ActiveTexture(gl::TEXTURE0);
                gl::BindTexture(gl::TEXTURE_2D, p.texture);

                gl::BindBuffer(gl::ARRAY_BUFFER, p.vbo);
                gl::BufferSubData(
                    gl::ARRAY_BUFFER,
                    0,
                    std::mem::size_of_val(&data) as isize,
                    data.as_ptr() as *const _,
                );
                gl::VertexAttribPointer(p.attr_position, 4, gl::FLOAT, gl::FALSE, 0, ptr::null());
                gl::VertexAttribPointer(
                    p.attr_texcoords,
                    2,
                    gl::FLOAT,
                    gl::FALSE,
                    0,
                    (16 * std::mem::size_of::<f32>()) as *const _,
                );
                gl::EnableVertexAttribArray(p.attr_position);
                gl::EnableVertexAttribArray(p.attr_texcoords);

                gl::DrawArrays(gl::TRIANGLE_STRIP, 0, 4);

                gl::DisableVertexAttribArray(p.attr_position);
                gl::DisableVertexAttribArray(p.attr_texcoords);
                gl::BindBuffer(gl::ARRAY_BUFFER, 0);
                gl::UseProgram(0);
            }
        }
        Self::check_gl("draw")
    }

    fn swap_buffers(&mut self) -> Result<(), GpuError> {
        self.egl
            .swap_buffers(self.display, self.surface)
            .map_err(context_err("eglSwapBuffers"))
    }

    fn read_pixels(&mut self, rect: Rect) -> Result<Vec<u8>, GpuError> {
        self.make_current()?;
        let mut out = vec![0u8; rect.area() * 4];
        unsafe {
            gl::PixelStorei(gl::PACK_ALIGNMENT, 1);
            gl::ReadPixels(
                rect.x,
                rect.y,
                rect.width,
                rect.height,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                out.as_mut_ptr() as *mut _,
            );
        }
        Self::check_gl("read back")?;
        Ok(out)
    }
}

impl Drop for EglDevice {
    fn drop(&mut self) {
        let _ = self.make_current();
        self.release_image();
        if let Some(p) = self.pipeline.take() {
            unsafe {
                gl::DeleteTextures(1, &p.texture);
                gl::DeleteBuffers(1, &p.vbo);
                gl::DeleteProgram(p.program);
            }
        }
        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.terminate(self.display);
        unsafe { (self.xlib.XCloseDisplay)(self.x_display) };
    }
}
