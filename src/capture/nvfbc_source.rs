use std::sync::Arc;
use std::time::Duration;

use cust::sys::{cuCtxSetCurrent, cuMemcpy2D_v2, CUcontext, CUdeviceptr, CUmemorytype, CUresult};
use ffmpeg_next::frame;

use crate::cancel::StickyCancelTimer;
use crate::capture::{CaptureSource, IntervalSource};
use crate::nvfbc::{NvFbc, NVFBC_SESSION_HANDLE, NVFBC_SIZE, NVFBC_TOCUDA_GRAB_FLAGS_NOWAIT};
use crate::types::config::{Parameters, VideoOutputSize};
use crate::types::error::{Error, Result};

/// Interval-driven video source grabbing frames straight into CUDA device
/// memory through NvFBC. X11 only.
pub struct NvfbcCaptureSource {
    timer: Arc<StickyCancelTimer>,
    frame_interval: Duration,
    nvfbc: NvFbc,
    session: NVFBC_SESSION_HANDLE,
    cuda_ctx: CUcontext,
    desktop_size: VideoOutputSize,
    frame_number: i64,
}

// The CUDA context pointer is only dereferenced on the capture thread
unsafe impl Send for NvfbcCaptureSource {}

impl NvfbcCaptureSource {
    pub fn new(params: &Parameters, cuda_ctx: CUcontext) -> Result<Self> {
        let nvfbc = NvFbc::load()?;
        let session = nvfbc.create_handle()?;

        let screen = nvfbc.screen_size(session)?;
        let desktop_size = VideoOutputSize::new(screen.w, screen.h)?;

        let mut size = NVFBC_SIZE {
            w: desktop_size.width,
            h: desktop_size.height,
        };
        if let Some(resolution) = params.resolution {
            size.w = resolution.width;
            size.h = resolution.height;
        }

        if let Err(err) = nvfbc.create_capture_session(session, params.frame_time, size) {
            nvfbc.destroy_handle(session);
            return Err(err);
        }

        Ok(Self {
            timer: Arc::new(StickyCancelTimer::new()),
            frame_interval: Duration::from_nanos(params.frame_time.value()),
            nvfbc,
            session,
            cuda_ctx,
            desktop_size,
            frame_number: 0,
        })
    }

    /// Screen size reported by the driver, before any capture override.
    pub fn desktop_size(&self) -> VideoOutputSize {
        self.desktop_size
    }

    pub fn timer_handle(&self) -> Arc<StickyCancelTimer> {
        Arc::clone(&self.timer)
    }
}

impl CaptureSource for NvfbcCaptureSource {
    type Input = frame::Video;

    fn name(&self) -> &'static str {
        "NvFBC video source"
    }

    fn init(&mut self) -> Result<()> {
        let result = unsafe { cuCtxSetCurrent(self.cuda_ctx) };
        if result != CUresult::CUDA_SUCCESS {
            return Err(Error::Gpu(format!(
                "failed to make CUDA context current: {result:?}"
            )));
        }
        Ok(())
    }

    fn capture(&mut self, frame: &mut Self::Input) -> Result<()> {
        let (device_ptr, _info) = self
            .nvfbc
            .grab_cuda_frame(self.session, NVFBC_TOCUDA_GRAB_FLAGS_NOWAIT)?;

        unsafe {
            let av = frame.as_mut_ptr();

            let mut copy: cust::sys::CUDA_MEMCPY2D_v2 = std::mem::zeroed();
            copy.srcMemoryType = CUmemorytype::CU_MEMORYTYPE_DEVICE;
            copy.srcDevice = device_ptr as CUdeviceptr;
            copy.dstMemoryType = CUmemorytype::CU_MEMORYTYPE_DEVICE;
            copy.dstDevice = (*av).data[0] as CUdeviceptr;
            copy.dstPitch = (*av).linesize[0] as usize;
            copy.WidthInBytes = (*av).linesize[0] as usize;
            copy.Height = (*av).height as usize;

            let result = cuMemcpy2D_v2(&copy);
            if result != CUresult::CUDA_SUCCESS {
                return Err(Error::Gpu(format!(
                    "failed to copy CUDA buffer for frame {}: {result:?}",
                    self.frame_number
                )));
            }
        }

        frame.set_pts(Some(self.frame_number));
        self.frame_number += 1;
        Ok(())
    }
}

impl IntervalSource for NvfbcCaptureSource {
    fn interval(&self) -> Duration {
        self.frame_interval
    }

    fn timer(&self) -> &StickyCancelTimer {
        &self.timer
    }
}

impl Drop for NvfbcCaptureSource {
    fn drop(&mut self) {
        self.nvfbc.destroy_capture_session(self.session);
        self.nvfbc.destroy_handle(self.session);
    }
}
