//! EGL bootstrap and the GPU colour-conversion stage for the Wayland
//! capture path. DMA-BUF planes are imported as EGLImages bound to
//! external textures, then rendered into an RGBA output texture that CUDA
//! can map.

use std::ffi::c_void;

use gl::types::{GLchar, GLenum, GLint, GLsizei, GLuint};
use khronos_egl::{self as egl, ClientBuffer, Dynamic, Instance};

use crate::types::config::VideoOutputScale;
use crate::types::error::{Error, Result};

pub const TEXTURE_EXTERNAL_OES: GLenum = 0x8D65;

type PFNGLEGLIMAGETARGETTEXTURE2DOESPROC =
    unsafe extern "C" fn(target: GLenum, image: *const c_void);

/// One plane of a DMA-BUF backed image.
#[derive(Debug, Clone, Copy)]
pub struct DmaBufPlane {
    pub fd: i32,
    pub offset: u32,
    pub stride: u32,
}

unsafe impl Send for EglContext {}

pub struct EglContext {
    egl_instance: Instance<Dynamic<libloading::Library, egl::EGL1_5>>,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    _config: egl::Config,
    dmabuf_modifiers_supported: bool,
    image_target_texture: PFNGLEGLIMAGETARGETTEXTURE2DOESPROC,

    // Keep Wayland display alive
    _wayland_display: wayland_client::Display,
}

impl EglContext {
    pub fn new(width: i32, height: i32) -> Result<Self> {
        let lib = unsafe { libloading::Library::new("libEGL.so.1") }
            .map_err(|err| Error::Gpu(format!("unable to load libEGL.so.1: {err}")))?;
        let egl_instance = unsafe { egl::DynamicInstance::<egl::EGL1_5>::load_required_from(lib) }
            .map_err(|err| Error::Gpu(format!("unable to bind libEGL.so.1: {err}")))?;

        let wayland_display = wayland_client::Display::connect_to_env()
            .map_err(|err| Error::Capture(format!("failed to connect to Wayland: {err}")))?;
        let display = unsafe {
            egl_instance.get_display(wayland_display.c_ptr() as *mut std::ffi::c_void)
        }
        .ok_or_else(|| Error::Gpu("no EGL display for the Wayland connection".into()))?;
        egl_instance.initialize(display)?;

        let attributes = [
            egl::BUFFER_SIZE,
            24,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::NONE,
            egl::NONE,
        ];
        let config = egl_instance
            .choose_first_config(display, &attributes)?
            .ok_or_else(|| Error::Gpu("no suitable EGL configuration".into()))?;

        egl_instance.bind_api(egl::OPENGL_ES_API)?;

        let context_attributes = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = egl_instance.create_context(display, config, None, &context_attributes)?;

        let surface_attributes = [egl::WIDTH, width, egl::HEIGHT, height, egl::NONE];
        let surface = egl_instance.create_pbuffer_surface(display, config, &surface_attributes)?;
        egl_instance.make_current(display, Some(surface), Some(surface), Some(context))?;

        // Capture must never block on the compositor's vsync
        let _ = egl_instance.swap_interval(display, 0);

        gl::load_with(|symbol| match egl_instance.get_proc_address(symbol) {
            Some(addr) => addr as *const _,
            None => std::ptr::null(),
        });

        let extensions = egl_instance
            .query_string(Some(display), egl::EXTENSIONS)?
            .to_string_lossy()
            .into_owned();
        if !extensions.contains("EGL_EXT_image_dma_buf_import") {
            return Err(Error::Gpu("EGL_EXT_image_dma_buf_import not supported".into()));
        }
        let dmabuf_modifiers_supported =
            extensions.contains("EGL_EXT_image_dma_buf_import_modifiers");

        let image_target_texture = egl_instance
            .get_proc_address("glEGLImageTargetTexture2DOES")
            .map(|addr| unsafe {
                std::mem::transmute::<_, PFNGLEGLIMAGETARGETTEXTURE2DOESPROC>(addr)
            })
            .ok_or_else(|| Error::Gpu("glEGLImageTargetTexture2DOES not available".into()))?;

        log::info!("Created EGL context");

        Ok(Self {
            egl_instance,
            display,
            context,
            surface,
            _config: config,
            dmabuf_modifiers_supported,
            image_target_texture,
            _wayland_display: wayland_display,
        })
    }

    pub fn create_image_from_dmabuf(
        &self,
        planes: &[DmaBufPlane],
        format: u32,
        width: u32,
        height: u32,
        modifier: u64,
    ) -> Result<egl::Image> {
        let mut attributes = vec![
            // EGL_LINUX_DRM_FOURCC_EXT
            0x3271,
            format as usize,
            egl::WIDTH as usize,
            width as usize,
            egl::HEIGHT as usize,
            height as usize,
        ];

        for (i, plane) in planes.iter().enumerate().take(3) {
            // EGL_DMA_BUF_PLANEn_{FD,OFFSET,PITCH}_EXT
            let fd_attr = 0x3272 + i * 3;
            attributes.extend([
                fd_attr,
                plane.fd as usize,
                fd_attr + 1,
                plane.offset as usize,
                fd_attr + 2,
                plane.stride as usize,
            ]);

            if self.dmabuf_modifiers_supported {
                // EGL_DMA_BUF_PLANEn_MODIFIER_{LO,HI}_EXT
                let modifier_attr = 0x3443 + i * 2;
                attributes.extend([
                    modifier_attr,
                    (modifier & 0xFFFF_FFFF) as usize,
                    modifier_attr + 1,
                    (modifier >> 32) as usize,
                ]);
            }
        }

        attributes.push(egl::NONE as usize);

        let image = self
            .egl_instance
            .create_image(
                self.display,
                unsafe { egl::Context::from_ptr(egl::NO_CONTEXT) },
                // EGL_LINUX_DMA_BUF_EXT
                0x3270,
                unsafe { ClientBuffer::from_ptr(std::ptr::null_mut()) },
                &attributes,
            )
            .map_err(|err| Error::Gpu(format!("failed to import DMA-BUF image: {err:?}")))?;

        Ok(image)
    }

    /// Binds an EGLImage to an external texture so the converter can sample
    /// it.
    pub fn attach_image_to_texture(&self, texture: GLuint, image: egl::Image) {
        unsafe {
            gl::BindTexture(TEXTURE_EXTERNAL_OES, texture);
            (self.image_target_texture)(TEXTURE_EXTERNAL_OES, image.as_ptr());
            gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);
        }
    }

    pub fn destroy_image(&self, image: egl::Image) {
        if let Err(err) = self.egl_instance.destroy_image(self.display, image) {
            log::error!("Failed to destroy EGL image: {err:?}");
        }
    }

    pub fn make_current(&self) -> Result<()> {
        self.egl_instance.make_current(
            self.display,
            Some(self.surface),
            Some(self.surface),
            Some(self.context),
        )?;
        Ok(())
    }

    pub fn release_current(&self) -> Result<()> {
        self.egl_instance
            .make_current(self.display, None, None, None)?;
        Ok(())
    }
}

impl Drop for EglContext {
    fn drop(&mut self) {
        let _ = self
            .egl_instance
            .make_current(self.display, None, None, None);
        let _ = self
            .egl_instance
            .destroy_surface(self.display, self.surface);
        let _ = self
            .egl_instance
            .destroy_context(self.display, self.context);
        let _ = self.egl_instance.terminate(self.display);
    }
}

/// Cursor plane placement, in desktop coordinates.
#[derive(Debug, Clone, Copy)]
pub struct MouseParameters {
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
}

const VERTEX_SHADER: &str = "\
attribute vec2 position;
attribute vec2 texcoord;
varying vec2 v_texcoord;
void main() {
    gl_Position = vec4(position, 0.0, 1.0);
    v_texcoord = texcoord;
}
";

const FRAGMENT_SHADER: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 v_texcoord;
uniform samplerExternalOES tex;
void main() {
    gl_FragColor = texture2D(tex, v_texcoord);
}
";

// x, y, u, v per vertex, triangle strip, flipped so the scan-out image
// lands the right way up in the output texture
const FULLSCREEN_QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, //
    -1.0, 1.0, 0.0, 0.0, //
    1.0, 1.0, 1.0, 0.0,
];

/// Renders the imported desktop image (and optionally the cursor plane on
/// top) into an RGBA output texture of the configured size.
pub struct ColorConverter {
    width: u32,
    height: u32,
    scale: VideoOutputScale,
    program: GLuint,
    sampler_location: GLint,
    input_texture: GLuint,
    mouse_texture: GLuint,
    output_texture: GLuint,
    framebuffer: GLuint,
}

impl ColorConverter {
    /// Requires a current GL context.
    pub fn new(width: u32, height: u32, scale: VideoOutputScale) -> Result<Self> {
        unsafe {
            let program = link_program(VERTEX_SHADER, FRAGMENT_SHADER)?;
            let sampler_location =
                gl::GetUniformLocation(program, c"tex".as_ptr() as *const GLchar);

            let mut textures = [0u32; 3];
            gl::GenTextures(3, textures.as_mut_ptr());
            let [input_texture, mouse_texture, output_texture] = textures;

            for texture in [input_texture, mouse_texture] {
                gl::BindTexture(TEXTURE_EXTERNAL_OES, texture);
                gl::TexParameteri(
                    TEXTURE_EXTERNAL_OES,
                    gl::TEXTURE_MIN_FILTER,
                    gl::LINEAR as GLint,
                );
                gl::TexParameteri(
                    TEXTURE_EXTERNAL_OES,
                    gl::TEXTURE_MAG_FILTER,
                    gl::LINEAR as GLint,
                );
            }
            gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);

            gl::BindTexture(gl::TEXTURE_2D, output_texture);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA8 as GLint,
                width as GLint,
                height as GLint,
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                std::ptr::null(),
            );
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as GLint);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as GLint);
            gl::BindTexture(gl::TEXTURE_2D, 0);

            let mut framebuffer = 0;
            gl::GenFramebuffers(1, &mut framebuffer);
            gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                output_texture,
                0,
            );
            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            if status != gl::FRAMEBUFFER_COMPLETE {
                return Err(Error::Gpu(format!(
                    "output framebuffer incomplete: 0x{status:x}"
                )));
            }

            Ok(Self {
                width,
                height,
                scale,
                program,
                sampler_location,
                input_texture,
                mouse_texture,
                output_texture,
                framebuffer,
            })
        }
    }

    pub fn input_texture(&self) -> GLuint {
        self.input_texture
    }

    pub fn mouse_texture(&self) -> GLuint {
        self.mouse_texture
    }

    pub fn output_texture(&self) -> GLuint {
        self.output_texture
    }

    pub fn convert(&self, mouse: Option<MouseParameters>) -> Result<()> {
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, self.framebuffer);
            gl::Viewport(0, 0, self.width as GLsizei, self.height as GLsizei);

            gl::UseProgram(self.program);
            gl::Uniform1i(self.sampler_location, 0);
            gl::ActiveTexture(gl::TEXTURE0);

            gl::Disable(gl::BLEND);
            gl::BindTexture(TEXTURE_EXTERNAL_OES, self.input_texture);
            draw_quad(&FULLSCREEN_QUAD);

            if let Some(mouse) = mouse {
                gl::Enable(gl::BLEND);
                gl::BlendFunc(gl::SRC_ALPHA, gl::ONE_MINUS_SRC_ALPHA);
                gl::BindTexture(TEXTURE_EXTERNAL_OES, self.mouse_texture);
                draw_quad(&self.mouse_quad(&mouse));
                gl::Disable(gl::BLEND);
            }

            gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            gl::Finish();

            let error = gl::GetError();
            if error != gl::NO_ERROR {
                return Err(Error::Gpu(format!("colour conversion failed: 0x{error:x}")));
            }
        }
        Ok(())
    }

    fn mouse_quad(&self, mouse: &MouseParameters) -> [f32; 16] {
        let left = mouse.x as f32 * self.scale.width;
        let top = mouse.y as f32 * self.scale.height;
        let right = left + mouse.width as f32 * self.scale.width;
        let bottom = top + mouse.height as f32 * self.scale.height;

        let ndc_x = |px: f32| 2.0 * px / self.width as f32 - 1.0;
        let ndc_y = |py: f32| 1.0 - 2.0 * py / self.height as f32;

        [
            ndc_x(left),
            ndc_y(bottom),
            0.0,
            1.0, //
            ndc_x(right),
            ndc_y(bottom),
            1.0,
            1.0, //
            ndc_x(left),
            ndc_y(top),
            0.0,
            0.0, //
            ndc_x(right),
            ndc_y(top),
            1.0,
            0.0,
        ]
    }
}

impl Drop for ColorConverter {
    fn drop(&mut self) {
        unsafe {
            gl::DeleteFramebuffers(1, &self.framebuffer);
            let textures = [self.input_texture, self.mouse_texture, self.output_texture];
            gl::DeleteTextures(3, textures.as_ptr());
            gl::DeleteProgram(self.program);
        }
    }
}

unsafe fn draw_quad(vertices: &[f32; 16]) {
    let stride = (4 * std::mem::size_of::<f32>()) as GLsizei;
    gl::EnableVertexAttribArray(0);
    gl::EnableVertexAttribArray(1);
    gl::VertexAttribPointer(
        0,
        2,
        gl::FLOAT,
        gl::FALSE,
        stride,
        vertices.as_ptr() as *const c_void,
    );
    gl::VertexAttribPointer(
        1,
        2,
        gl::FLOAT,
        gl::FALSE,
        stride,
        vertices.as_ptr().wrapping_add(2) as *const c_void,
    );
    gl::DrawArrays(gl::TRIANGLE_STRIP, 0, 4);
    gl::DisableVertexAttribArray(0);
    gl::DisableVertexAttribArray(1);
}

unsafe fn compile_shader(kind: GLenum, source: &str) -> Result<GLuint> {
    let shader = gl::CreateShader(kind);
    let ptr = source.as_ptr() as *const GLchar;
    let len = source.len() as GLint;
    gl::ShaderSource(shader, 1, &ptr, &len);
    gl::CompileShader(shader);

    let mut status = 0;
    gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status);
    if status == 0 {
        let mut log = vec![0u8; 1024];
        let mut written = 0;
        gl::GetShaderInfoLog(
            shader,
            log.len() as GLsizei,
            &mut written,
            log.as_mut_ptr() as *mut GLchar,
        );
        gl::DeleteShader(shader);
        log.truncate(written.max(0) as usize);
        return Err(Error::Gpu(format!(
            "shader compilation failed: {}",
            String::from_utf8_lossy(&log)
        )));
    }
    Ok(shader)
}

unsafe fn link_program(vertex_source: &str, fragment_source: &str) -> Result<GLuint> {
    let vertex = compile_shader(gl::VERTEX_SHADER, vertex_source)?;
    let fragment = compile_shader(gl::FRAGMENT_SHADER, fragment_source)?;

    let program = gl::CreateProgram();
    gl::AttachShader(program, vertex);
    gl::AttachShader(program, fragment);
    gl::BindAttribLocation(program, 0, c"position".as_ptr() as *const GLchar);
    gl::BindAttribLocation(program, 1, c"texcoord".as_ptr() as *const GLchar);
    gl::LinkProgram(program);

    gl::DeleteShader(vertex);
    gl::DeleteShader(fragment);

    let mut status = 0;
    gl::GetProgramiv(program, gl::LINK_STATUS, &mut status);
    if status == 0 {
        let mut log = vec![0u8; 1024];
        let mut written = 0;
        gl::GetProgramInfoLog(
            program,
            log.len() as GLsizei,
            &mut written,
            log.as_mut_ptr() as *mut GLchar,
        );
        gl::DeleteProgram(program);
        log.truncate(written.max(0) as usize);
        return Err(Error::Gpu(format!(
            "program link failed: {}",
            String::from_utf8_lossy(&log)
        )));
    }
    Ok(program)
}
