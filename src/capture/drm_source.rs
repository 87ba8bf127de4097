use std::os::fd::OwnedFd;
use std::process::{Child, Command};
use std::ptr::null_mut;
use std::sync::Arc;
use std::time::Duration;

use cust::sys::{
    cuCtxSetCurrent, cuGraphicsMapResources, cuGraphicsResourceSetMapFlags_v2,
    cuGraphicsSubResourceGetMappedArray, cuGraphicsUnmapResources, cuGraphicsUnregisterResource,
    cuMemcpy2D_v2, CUarray, CUcontext, CUdeviceptr, CUgraphicsResource, CUmemorytype, CUresult,
};
use ffmpeg_next::frame;

use crate::cancel::StickyCancelTimer;
use crate::capture::{CaptureSource, IntervalSource};
use crate::drm::{self, messaging, plane_flags, PlaneDescriptor};
use crate::encoders::cuda::{cuGraphicsGLRegisterImage, CU_GRAPHICS_REGISTER_FLAGS_READ_ONLY};
use crate::shadow_egl::{ColorConverter, DmaBufPlane, EglContext, MouseParameters, TEXTURE_EXTERNAL_OES};
use crate::types::config::{Parameters, VideoOutputScale, VideoOutputSize};
use crate::types::error::{Error, Result};

const HELPER_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval-driven video source for Wayland. Each tick fetches the current
/// scan-out planes from the DRM helper, imports them through EGL, runs the
/// colour converter and copies the result into the encoder's CUDA frame.
pub struct DrmCudaCaptureSource {
    timer: Arc<StickyCancelTimer>,
    frame_interval: Duration,
    cuda_ctx: CUcontext,
    output_size: VideoOutputSize,
    output_scale: VideoOutputScale,
    egl: Option<EglContext>,
    converter: Option<ColorConverter>,
    helper: Option<Child>,
    socket: Option<OwnedFd>,
    frame_number: i64,
}

// EGL/GL state is created and used exclusively on the capture thread; the
// CUDA context pointer is only dereferenced there too
unsafe impl Send for DrmCudaCaptureSource {}

impl DrmCudaCaptureSource {
    pub fn new(
        params: &Parameters,
        cuda_ctx: CUcontext,
        desktop_size: VideoOutputSize,
    ) -> Result<Self> {
        let output_size = params.resolution.unwrap_or(desktop_size);
        let output_scale = VideoOutputScale {
            width: output_size.width as f32 / desktop_size.width as f32,
            height: output_size.height as f32 / desktop_size.height as f32,
        };

        Ok(Self {
            timer: Arc::new(StickyCancelTimer::new()),
            frame_interval: Duration::from_nanos(params.frame_time.value()),
            cuda_ctx,
            output_size,
            output_scale,
            egl: None,
            converter: None,
            helper: None,
            socket: None,
            frame_number: 0,
        })
    }

    pub fn timer_handle(&self) -> Arc<StickyCancelTimer> {
        Arc::clone(&self.timer)
    }

    fn helper_binary() -> Result<std::path::PathBuf> {
        // The helper ships alongside the main executable
        let mut path = std::env::current_exe()?;
        path.pop();
        path.push(drm::HELPER_BINARY);
        if !path.exists() {
            return Err(Error::Config(format!(
                "couldn't locate DRM helper at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    fn spawn_helper(&mut self) -> Result<()> {
        let listener = messaging::bind_listener(drm::SOCKET_PATH)?;

        let helper = Command::new(Self::helper_binary()?)
            .arg(drm::SOCKET_PATH)
            .spawn()
            .map_err(|err| Error::Capture(format!("failed to spawn DRM helper: {err}")))?;
        self.helper = Some(helper);

        // The child either connects promptly or we can't proceed at all;
        // the listener is not needed beyond this one accept
        let socket = messaging::accept_with_timeout(&listener, HELPER_CONNECT_TIMEOUT);
        let _ = std::fs::remove_file(drm::SOCKET_PATH);
        self.socket = Some(socket?);

        Ok(())
    }

    fn stop_helper(&mut self) {
        if let Some(socket) = &self.socket {
            let _ = messaging::send_request(socket, drm::request::STOP);
        }
        self.socket = None;

        if let Some(mut helper) = self.helper.take() {
            let _ = helper.kill();
            let _ = helper.wait();
        }
    }

    /// Copies the converter's output texture into the frame's device memory
    /// through the CUDA/GL interop path. Every interop resource is released
    /// before returning, on success and failure alike.
    fn copy_output_into_frame(&self, frame: &mut frame::Video) -> Result<()> {
        let converter = self.converter.as_ref().unwrap();

        unsafe {
            let mut resource: CUgraphicsResource = null_mut();

            let result = cuGraphicsGLRegisterImage(
                &mut resource,
                converter.output_texture(),
                gl::TEXTURE_2D,
                CU_GRAPHICS_REGISTER_FLAGS_READ_ONLY,
            );
            if result != CUresult::CUDA_SUCCESS {
                return Err(Error::Gpu(format!(
                    "error registering GL texture with CUDA: {result:?}"
                )));
            }

            let result = cuGraphicsResourceSetMapFlags_v2(resource, 0);
            if result != CUresult::CUDA_SUCCESS {
                cuGraphicsUnregisterResource(resource);
                return Err(Error::Gpu(format!(
                    "failed to set graphics resource map flags: {result:?}"
                )));
            }

            let result = cuGraphicsMapResources(1, &mut resource, null_mut());
            if result != CUresult::CUDA_SUCCESS {
                cuGraphicsUnregisterResource(resource);
                return Err(Error::Gpu(format!(
                    "error mapping GL image into CUDA: {result:?}"
                )));
            }

            let mut cuda_array: CUarray = null_mut();
            let result = cuGraphicsSubResourceGetMappedArray(&mut cuda_array, resource, 0, 0);
            if result != CUresult::CUDA_SUCCESS {
                cuGraphicsUnmapResources(1, &mut resource, null_mut());
                cuGraphicsUnregisterResource(resource);
                return Err(Error::Gpu(format!("error getting CUDA array: {result:?}")));
            }

            let av = frame.as_mut_ptr();
            let mut copy: cust::sys::CUDA_MEMCPY2D_v2 = std::mem::zeroed();
            copy.srcMemoryType = CUmemorytype::CU_MEMORYTYPE_ARRAY;
            copy.srcArray = cuda_array;
            copy.dstMemoryType = CUmemorytype::CU_MEMORYTYPE_DEVICE;
            copy.dstDevice = (*av).data[0] as CUdeviceptr;
            copy.dstPitch = (*av).linesize[0] as usize;
            copy.WidthInBytes = (*av).linesize[0] as usize;
            copy.Height = (*av).height as usize;

            let result = cuMemcpy2D_v2(&copy);

            cuGraphicsUnmapResources(1, &mut resource, null_mut());
            cuGraphicsUnregisterResource(resource);

            if result != CUresult::CUDA_SUCCESS {
                return Err(Error::Gpu(format!(
                    "failed to copy CUDA buffer for frame {}: {result:?}",
                    self.frame_number
                )));
            }
        }

        Ok(())
    }
}

impl CaptureSource for DrmCudaCaptureSource {
    type Input = frame::Video;

    fn name(&self) -> &'static str {
        "DRM video source"
    }

    fn init(&mut self) -> Result<()> {
        let result = unsafe { cuCtxSetCurrent(self.cuda_ctx) };
        if result != CUresult::CUDA_SUCCESS {
            return Err(Error::Gpu(format!(
                "failed to make CUDA context current: {result:?}"
            )));
        }

        let egl = EglContext::new(self.output_size.width as i32, self.output_size.height as i32)?;
        self.converter = Some(ColorConverter::new(
            self.output_size.width,
            self.output_size.height,
            self.output_scale,
        )?);
        self.egl = Some(egl);

        self.spawn_helper()
    }

    fn deinit(&mut self) {
        self.stop_helper();
        self.converter = None;
        if let Some(egl) = self.egl.take() {
            let _ = egl.release_current();
        }
    }

    fn capture(&mut self, frame: &mut Self::Input) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::Capture("DRM helper is not connected".into()))?;

        // `fds` owns every received descriptor; dropping it at the end of
        // this call closes them all
        let (response, fds) = messaging::get_planes(socket)?;
        if response.num_fds == 0 {
            return Err(Error::Capture("no DRM planes received".into()));
        }

        let count = (response.num_fds as usize).min(drm::MAX_PLANE_DESCRIPTORS);
        let descriptors = &response.descriptors[..count];

        // The largest plane is the desktop image
        let desktop = descriptors
            .iter()
            .max_by_key(|plane| u64::from(plane.width) * u64::from(plane.height))
            .expect("descriptor list is non-empty");
        let mouse = descriptors
            .iter()
            .find(|plane| plane.is_flag_set(plane_flags::IS_CURSOR));

        if self.frame_number == 0 {
            log::debug!(
                "Desktop plane {}x{}, format {:?}",
                desktop.width,
                desktop.height,
                drm_fourcc::DrmFourcc::try_from(desktop.pixel_format).ok()
            );
        }

        let egl = self.egl.as_ref().unwrap();
        let converter = self.converter.as_ref().unwrap();

        let import = |plane: &PlaneDescriptor| {
            egl.create_image_from_dmabuf(
                &[DmaBufPlane {
                    fd: plane.fd,
                    offset: plane.offset,
                    stride: plane.pitch,
                }],
                plane.pixel_format,
                plane.width,
                plane.height,
                plane.modifier,
            )
        };

        let desktop_image = import(desktop)?;
        egl.attach_image_to_texture(converter.input_texture(), desktop_image);

        let mut mouse_image = None;
        let mouse_params = match mouse {
            Some(plane) => match import(plane) {
                Ok(image) => {
                    egl.attach_image_to_texture(converter.mouse_texture(), image);
                    mouse_image = Some(image);
                    Some(MouseParameters {
                        width: plane.width,
                        height: plane.height,
                        x: plane.x,
                        y: plane.y,
                    })
                }
                Err(err) => {
                    egl.destroy_image(desktop_image);
                    return Err(err);
                }
            },
            None => None,
        };

        let result = converter
            .convert(mouse_params)
            .and_then(|()| self.copy_output_into_frame(frame));

        unsafe {
            gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);
        }
        let egl = self.egl.as_ref().unwrap();
        egl.destroy_image(desktop_image);
        if let Some(image) = mouse_image {
            egl.destroy_image(image);
        }
        drop(fds);

        result?;

        frame.set_pts(Some(self.frame_number));
        self.frame_number += 1;
        Ok(())
    }
}

impl IntervalSource for DrmCudaCaptureSource {
    fn interval(&self) -> Duration {
        self.frame_interval
    }

    fn timer(&self) -> &StickyCancelTimer {
        &self.timer
    }
}
