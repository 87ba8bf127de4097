//! # shadow-cast
//!
//! `shadow-cast` is a real-time Linux desktop and game recorder. Video
//! frames are pulled straight from the GPU (NVIDIA NvFBC on X11, or
//! DMA-BUF + EGL + CUDA interop on Wayland), PCM audio comes from
//! PipeWire, both are encoded (NVENC for video, AAC by default for audio)
//! and interleaved into a single container in real time.
//!
//! ## Platform support
//!
//! Linux with an NVIDIA GPU. X11 capture requires NvFBC (and the
//! `SHADOW_CAST_NVFBC_KEY` environment variable); Wayland capture requires
//! the `shadow-cast-kms` DRM helper next to the executable.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use shadow_cast::cancel::StickyCancelEvent;
//! use shadow_cast::session::{run_session, GpuContext};
//! use shadow_cast::types::config::Parameters;
//! use shadow_cast::utils::FrameTime;
//!
//! # move || {
//! fn main() -> shadow_cast::Result<()> {
//!     pipewire::init();
//!
//!     let params = Parameters {
//!         output_file: "/tmp/out.mp4".into(),
//!         frame_time: FrameTime::from_fps(60).truncate_to_millisecond(),
//!         video_encoder: "h264_nvenc".into(),
//!         audio_encoder: "aac".into(),
//!         sample_rate: 48_000,
//!         bitrate: 0,
//!         quality: 8,
//!         resolution: None,
//!         enable_metrics: false,
//!     };
//!
//!     let cancel = Arc::new(StickyCancelEvent::new());
//!     let interrupt = Arc::clone(&cancel);
//!     ctrlc::set_handler(move || interrupt.trigger(1)).unwrap();
//!
//!     let desktop = shadow_cast::desktop::detect()?;
//!     let gpu = GpuContext::new()?;
//!     run_session(cancel, desktop, &params, &gpu)
//! }
//! # };
//! ```

#![warn(clippy::all)]

pub mod cancel;
pub mod capture;
pub mod desktop;
pub mod drm;
pub mod encoders;
pub mod metrics;
pub mod mux;
pub mod nvfbc;
pub mod session;
pub mod shadow_egl;
pub mod types;
pub mod utils;

pub use capture::{AudioCapture, Capture, VideoCapture};
pub use session::{run_session, GpuContext};
pub use types::error::{Error, Result};
pub use utils::{FrameTime, TIME_UNIT_NS};
