//! Minimal dynamic binding for the NvFBC frame-buffer capture library.
//! Only the CUDA grab path is bound; the library is loaded at runtime with
//! `libloading`, so nothing links against it.

#![allow(non_snake_case, non_camel_case_types)]

use std::ffi::{c_char, c_void, CStr};

use base64::Engine;
use libloading::Library;

use crate::types::error::{Error, Result};
use crate::utils::FrameTime;

/// Base64-encoded private key required to create an NvFBC session.
pub const NVFBC_KEY_ENV: &str = "SHADOW_CAST_NVFBC_KEY";

const NVFBC_LIBRARY: &str = "libnvidia-fbc.so.1";

const NVFBC_VERSION_MAJOR: u32 = 1;
const NVFBC_VERSION_MINOR: u32 = 8;
const NVFBC_VERSION: u32 = NVFBC_VERSION_MINOR | (NVFBC_VERSION_MAJOR << 8);

fn nvfbc_struct_version<T>(ver: u32) -> u32 {
    (std::mem::size_of::<T>() as u32) | (ver << 16) | (NVFBC_VERSION << 24)
}

pub type NVFBCSTATUS = u32;
pub const NVFBC_SUCCESS: NVFBCSTATUS = 0;

type NVFBC_BOOL = u32;
const NVFBC_TRUE: NVFBC_BOOL = 1;

pub type NVFBC_SESSION_HANDLE = u64;

const NVFBC_CAPTURE_SHARED_CUDA: u32 = 2;
const NVFBC_TRACKING_DEFAULT: u32 = 0;
const NVFBC_BUFFER_FORMAT_BGRA: u32 = 5;

pub const NVFBC_TOCUDA_GRAB_FLAGS_NOWAIT: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NVFBC_SIZE {
    pub w: u32,
    pub h: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NVFBC_BOX {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[repr(C)]
struct NVFBC_CREATE_HANDLE_PARAMS {
    dwVersion: u32,
    privateData: *const c_void,
    privateDataSize: u32,
    bExternallyManagedContext: NVFBC_BOOL,
    glxCtx: *mut c_void,
    glxFBConfig: *mut c_void,
}

#[repr(C)]
struct NVFBC_DESTROY_HANDLE_PARAMS {
    dwVersion: u32,
}

#[repr(C)]
struct NVFBC_GET_STATUS_PARAMS {
    dwVersion: u32,
    bIsCapturePossible: NVFBC_BOOL,
    bCurrentlyCapturing: NVFBC_BOOL,
    bCanCreateNow: NVFBC_BOOL,
    screenSize: NVFBC_SIZE,
    bXRandRAvailable: NVFBC_BOOL,
    dwOutputNum: u32,
    dwNvFBCVersion: u32,
}

#[repr(C)]
struct NVFBC_CREATE_CAPTURE_SESSION_PARAMS {
    dwVersion: u32,
    eCaptureType: u32,
    eTrackingType: u32,
    dwOutputId: u32,
    captureBox: NVFBC_BOX,
    frameSize: NVFBC_SIZE,
    bWithCursor: NVFBC_BOOL,
    bDisableAutoModesetRecovery: NVFBC_BOOL,
    bRoundFrameSize: NVFBC_BOOL,
    dwSamplingRateMs: u32,
    bPushModel: NVFBC_BOOL,
}

#[repr(C)]
struct NVFBC_DESTROY_CAPTURE_SESSION_PARAMS {
    dwVersion: u32,
}

#[repr(C)]
struct NVFBC_TOCUDA_SETUP_PARAMS {
    dwVersion: u32,
    eBufferFormat: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NVFBC_FRAME_GRAB_INFO {
    pub dwWidth: u32,
    pub dwHeight: u32,
    pub dwByteSize: u32,
    pub dwCurrentFrame: u32,
    pub bIsNewFrame: u32,
    pub ulTimestampUs: u64,
}

#[repr(C)]
struct NVFBC_TOCUDA_GRAB_FRAME_PARAMS {
    dwVersion: u32,
    dwFlags: u32,
    pCUDADeviceBuffer: *mut c_void,
    pFrameGrabInfo: *mut NVFBC_FRAME_GRAB_INFO,
    dwTimeoutMs: u32,
}

#[repr(C)]
struct NVFBC_API_FUNCTION_LIST {
    dwVersion: u32,
    nvFBCGetLastErrorStr:
        Option<unsafe extern "C" fn(NVFBC_SESSION_HANDLE) -> *const c_char>,
    nvFBCCreateHandle: Option<
        unsafe extern "C" fn(*mut NVFBC_SESSION_HANDLE, *mut NVFBC_CREATE_HANDLE_PARAMS) -> NVFBCSTATUS,
    >,
    nvFBCDestroyHandle: Option<
        unsafe extern "C" fn(NVFBC_SESSION_HANDLE, *mut NVFBC_DESTROY_HANDLE_PARAMS) -> NVFBCSTATUS,
    >,
    nvFBCGetStatus: Option<
        unsafe extern "C" fn(NVFBC_SESSION_HANDLE, *mut NVFBC_GET_STATUS_PARAMS) -> NVFBCSTATUS,
    >,
    nvFBCCreateCaptureSession: Option<
        unsafe extern "C" fn(
            NVFBC_SESSION_HANDLE,
            *mut NVFBC_CREATE_CAPTURE_SESSION_PARAMS,
        ) -> NVFBCSTATUS,
    >,
    nvFBCDestroyCaptureSession: Option<
        unsafe extern "C" fn(
            NVFBC_SESSION_HANDLE,
            *mut NVFBC_DESTROY_CAPTURE_SESSION_PARAMS,
        ) -> NVFBCSTATUS,
    >,
    nvFBCToCudaSetUp: Option<
        unsafe extern "C" fn(NVFBC_SESSION_HANDLE, *mut NVFBC_TOCUDA_SETUP_PARAMS) -> NVFBCSTATUS,
    >,
    nvFBCToCudaGrabFrame: Option<
        unsafe extern "C" fn(
            NVFBC_SESSION_HANDLE,
            *mut NVFBC_TOCUDA_GRAB_FRAME_PARAMS,
        ) -> NVFBCSTATUS,
    >,
}

/// Loaded NvFBC instance. All calls go through the function table returned
/// by `NvFBCCreateInstance`.
pub struct NvFbc {
    api: NVFBC_API_FUNCTION_LIST,
    _lib: Library,
}

// The function table is immutable once created and the driver entry points
// are documented as thread-safe per session
unsafe impl Send for NvFbc {}

macro_rules! api_call {
    ($self:expr, $name:ident, $($arg:expr),*) => {{
        let f = $self.api.$name.ok_or_else(|| {
            Error::Capture(concat!("NvFBC does not provide ", stringify!($name)).into())
        })?;
        unsafe { f($($arg),*) }
    }};
}

impl NvFbc {
    pub fn load() -> Result<Self> {
        let lib = unsafe { Library::new(NVFBC_LIBRARY) }
            .map_err(|err| Error::Capture(format!("failed to load {NVFBC_LIBRARY}: {err}")))?;

        let mut api: NVFBC_API_FUNCTION_LIST = unsafe { std::mem::zeroed() };
        api.dwVersion = nvfbc_struct_version::<NVFBC_API_FUNCTION_LIST>(1);

        let status = unsafe {
            let create_instance: libloading::Symbol<
                unsafe extern "C" fn(*mut NVFBC_API_FUNCTION_LIST) -> NVFBCSTATUS,
            > = lib
                .get(b"NvFBCCreateInstance\0")
                .map_err(|err| Error::Capture(format!("NvFBCCreateInstance not found: {err}")))?;
            create_instance(&mut api)
        };
        if status != NVFBC_SUCCESS {
            return Err(Error::Capture(format!(
                "NvFBCCreateInstance failed: {status}"
            )));
        }

        Ok(Self { api, _lib: lib })
    }

    fn last_error(&self, session: NVFBC_SESSION_HANDLE) -> String {
        match self.api.nvFBCGetLastErrorStr {
            Some(f) => unsafe {
                let ptr = f(session);
                if ptr.is_null() {
                    "unknown".into()
                } else {
                    CStr::from_ptr(ptr).to_string_lossy().into_owned()
                }
            },
            None => "unknown".into(),
        }
    }

    /// Creates a session handle. The private key is taken base64-encoded
    /// from `SHADOW_CAST_NVFBC_KEY`.
    pub fn create_handle(&self) -> Result<NVFBC_SESSION_HANDLE> {
        let key = std::env::var(NVFBC_KEY_ENV)
            .map_err(|_| Error::Capture(format!("{NVFBC_KEY_ENV} is not set")))?;
        let key = base64::engine::general_purpose::STANDARD
            .decode(key.trim())
            .map_err(|err| Error::Capture(format!("invalid {NVFBC_KEY_ENV} value: {err}")))?;

        let mut handle: NVFBC_SESSION_HANDLE = 0;
        let mut params: NVFBC_CREATE_HANDLE_PARAMS = unsafe { std::mem::zeroed() };
        params.dwVersion = nvfbc_struct_version::<NVFBC_CREATE_HANDLE_PARAMS>(2);
        params.privateData = key.as_ptr() as *const c_void;
        params.privateDataSize = key.len() as u32;

        let status = api_call!(self, nvFBCCreateHandle, &mut handle, &mut params);
        if status != NVFBC_SUCCESS {
            return Err(Error::Capture(format!(
                "failed to create NvFBC session: {status}"
            )));
        }
        Ok(handle)
    }

    pub fn destroy_handle(&self, session: NVFBC_SESSION_HANDLE) {
        let mut params: NVFBC_DESTROY_HANDLE_PARAMS = unsafe { std::mem::zeroed() };
        params.dwVersion = nvfbc_struct_version::<NVFBC_DESTROY_HANDLE_PARAMS>(1);
        if let Some(f) = self.api.nvFBCDestroyHandle {
            unsafe {
                f(session, &mut params);
            }
        }
    }

    /// The current screen size as reported by the driver.
    pub fn screen_size(&self, session: NVFBC_SESSION_HANDLE) -> Result<NVFBC_SIZE> {
        let mut params: NVFBC_GET_STATUS_PARAMS = unsafe { std::mem::zeroed() };
        params.dwVersion = nvfbc_struct_version::<NVFBC_GET_STATUS_PARAMS>(2);

        let status = api_call!(self, nvFBCGetStatus, session, &mut params);
        if status != NVFBC_SUCCESS {
            return Err(Error::Capture(self.last_error(session)));
        }
        if params.bIsCapturePossible != NVFBC_TRUE {
            return Err(Error::Capture("NvFBC capture is not possible".into()));
        }
        Ok(params.screenSize)
    }

    pub fn create_capture_session(
        &self,
        session: NVFBC_SESSION_HANDLE,
        frame_time: FrameTime,
        size: NVFBC_SIZE,
    ) -> Result<()> {
        let mut params: NVFBC_CREATE_CAPTURE_SESSION_PARAMS = unsafe { std::mem::zeroed() };
        params.dwVersion = nvfbc_struct_version::<NVFBC_CREATE_CAPTURE_SESSION_PARAMS>(6);
        params.eCaptureType = NVFBC_CAPTURE_SHARED_CUDA;
        params.eTrackingType = NVFBC_TRACKING_DEFAULT;
        params.frameSize = size;
        params.bWithCursor = NVFBC_TRUE;
        params.bRoundFrameSize = NVFBC_TRUE;
        params.dwSamplingRateMs = frame_time.value_in_milliseconds() as u32;

        let status = api_call!(self, nvFBCCreateCaptureSession, session, &mut params);
        if status != NVFBC_SUCCESS {
            return Err(Error::Capture(self.last_error(session)));
        }

        let mut setup: NVFBC_TOCUDA_SETUP_PARAMS = unsafe { std::mem::zeroed() };
        setup.dwVersion = nvfbc_struct_version::<NVFBC_TOCUDA_SETUP_PARAMS>(1);
        setup.eBufferFormat = NVFBC_BUFFER_FORMAT_BGRA;

        let status = api_call!(self, nvFBCToCudaSetUp, session, &mut setup);
        if status != NVFBC_SUCCESS {
            return Err(Error::Capture(self.last_error(session)));
        }
        Ok(())
    }

    pub fn destroy_capture_session(&self, session: NVFBC_SESSION_HANDLE) {
        let mut params: NVFBC_DESTROY_CAPTURE_SESSION_PARAMS = unsafe { std::mem::zeroed() };
        params.dwVersion = nvfbc_struct_version::<NVFBC_DESTROY_CAPTURE_SESSION_PARAMS>(1);
        if let Some(f) = self.api.nvFBCDestroyCaptureSession {
            unsafe {
                f(session, &mut params);
            }
        }
    }

    /// Grabs the next frame into CUDA device memory, returning the device
    /// pointer the driver copied it to.
    pub fn grab_cuda_frame(
        &self,
        session: NVFBC_SESSION_HANDLE,
        flags: u32,
    ) -> Result<(u64, NVFBC_FRAME_GRAB_INFO)> {
        let mut device_buffer: *mut c_void = std::ptr::null_mut();
        let mut info = NVFBC_FRAME_GRAB_INFO::default();

        let mut params: NVFBC_TOCUDA_GRAB_FRAME_PARAMS = unsafe { std::mem::zeroed() };
        params.dwVersion = nvfbc_struct_version::<NVFBC_TOCUDA_GRAB_FRAME_PARAMS>(2);
        params.dwFlags = flags;
        params.pCUDADeviceBuffer = &mut device_buffer as *mut *mut c_void as *mut c_void;
        params.pFrameGrabInfo = &mut info;

        let status = api_call!(self, nvFBCToCudaGrabFrame, session, &mut params);
        if status != NVFBC_SUCCESS {
            return Err(Error::Capture(self.last_error(session)));
        }
        Ok((device_buffer as u64, info))
    }
}
