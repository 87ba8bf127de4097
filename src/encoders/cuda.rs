use std::ffi::c_void;

use cust::sys::{CUcontext, CUgraphicsResource, CUresult, CUstream};
use gl::types::{GLenum, GLuint};
use libc::c_uint;

/// Mirror of libavutil's AVCUDADeviceContext, which ffmpeg-next does not
/// expose.
#[repr(C)]
pub struct AVCUDADeviceContext {
    pub cuda_ctx: CUcontext,
    pub stream: CUstream,
    pub internal: *mut c_void,
}

pub const CU_GRAPHICS_REGISTER_FLAGS_READ_ONLY: c_uint = 0x01;

unsafe extern "C" {
    // The GL interop entry points are absent from cust's bindings
    pub fn cuGraphicsGLRegisterImage(
        resource: *mut CUgraphicsResource,
        image: GLuint,
        target: GLenum,
        flags: c_uint,
    ) -> CUresult;
}
