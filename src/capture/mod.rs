use std::sync::Arc;
use std::time::Duration;

use crate::cancel::{StickyCancelEvent, StickyCancelTimer};
use crate::encoders::audio::AudioEncoderSink;
use crate::encoders::nvenc::NvencEncoderSink;
use crate::types::error::Result;

pub mod audio_loop;
pub mod drm_source;
pub mod nvfbc_source;
pub mod pipeline;
pub mod pipewire_source;
pub mod video_loop;

use drm_source::DrmCudaCaptureSource;
use nvfbc_source::NvfbcCaptureSource;
use pipewire_source::PipewireCaptureSource;

/// Message used to stop PipeWire loops from the outside.
pub struct Terminate;

/// Produces one frame's worth of data into a caller-supplied input slot.
pub trait CaptureSource {
    type Input;

    fn name(&self) -> &'static str;

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) {}

    fn capture(&mut self, input: &mut Self::Input) -> Result<()>;
}

/// Interval-driven source; the loop schedules ticks against its timer.
pub trait IntervalSource: CaptureSource {
    fn interval(&self) -> Duration;
    fn timer(&self) -> &StickyCancelTimer;
}

/// Event-triggered source; the loop blocks on its event between frames.
pub trait EventSource: CaptureSource {
    fn event(&self) -> &StickyCancelEvent;
}

/// Accepts filled input slots and forwards encoded packets to the muxer.
/// `prepare` must not block.
pub trait CaptureSink {
    type Input;

    fn prepare(&mut self) -> Result<Self::Input>;
    fn write(&mut self, input: Self::Input) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Shareable handle used to cancel a capture from another thread.
#[derive(Clone)]
pub enum CancelHandle {
    Timer(Arc<StickyCancelTimer>),
    Event(Arc<StickyCancelEvent>),
}

impl CancelHandle {
    pub fn cancel(&self) {
        match self {
            CancelHandle::Timer(timer) => timer.cancel(),
            CancelHandle::Event(event) => event.cancel(),
        }
    }
}

/// The concrete video source selected for the running desktop.
pub enum VideoSource {
    Nvfbc(NvfbcCaptureSource),
    Drm(DrmCudaCaptureSource),
}

impl CaptureSource for VideoSource {
    type Input = ffmpeg_next::frame::Video;

    fn name(&self) -> &'static str {
        match self {
            VideoSource::Nvfbc(source) => source.name(),
            VideoSource::Drm(source) => source.name(),
        }
    }

    fn init(&mut self) -> Result<()> {
        match self {
            VideoSource::Nvfbc(source) => source.init(),
            VideoSource::Drm(source) => source.init(),
        }
    }

    fn deinit(&mut self) {
        match self {
            VideoSource::Nvfbc(source) => source.deinit(),
            VideoSource::Drm(source) => source.deinit(),
        }
    }

    fn capture(&mut self, input: &mut Self::Input) -> Result<()> {
        match self {
            VideoSource::Nvfbc(source) => source.capture(input),
            VideoSource::Drm(source) => source.capture(input),
        }
    }
}

impl IntervalSource for VideoSource {
    fn interval(&self) -> Duration {
        match self {
            VideoSource::Nvfbc(source) => source.interval(),
            VideoSource::Drm(source) => source.interval(),
        }
    }

    fn timer(&self) -> &StickyCancelTimer {
        match self {
            VideoSource::Nvfbc(source) => source.timer(),
            VideoSource::Drm(source) => source.timer(),
        }
    }
}

pub struct VideoCapture {
    pub(crate) source: VideoSource,
    pub(crate) sink: NvencEncoderSink,
}

impl VideoCapture {
    pub fn cancel_handle(&self) -> CancelHandle {
        let timer = match &self.source {
            VideoSource::Nvfbc(source) => source.timer_handle(),
            VideoSource::Drm(source) => source.timer_handle(),
        };
        CancelHandle::Timer(timer)
    }

    pub fn run(mut self) -> Result<()> {
        video_loop::run_video_capture(&mut self.source, &mut self.sink)
    }
}

pub struct AudioCapture {
    pub(crate) source: PipewireCaptureSource,
    pub(crate) sink: AudioEncoderSink,
}

impl AudioCapture {
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::Event(self.source.event_handle())
    }

    pub fn run(mut self) -> Result<()> {
        audio_loop::run_audio_capture(&mut self.source, &mut self.sink)
    }
}

/// One half of a session: a concrete source/sink pair behind a single
/// run/cancel surface.
pub enum Capture {
    Video(VideoCapture),
    Audio(AudioCapture),
}

impl Capture {
    pub fn cancel_handle(&self) -> CancelHandle {
        match self {
            Capture::Video(capture) => capture.cancel_handle(),
            Capture::Audio(capture) => capture.cancel_handle(),
        }
    }

    pub fn run(self) -> Result<()> {
        match self {
            Capture::Video(capture) => capture.run(),
            Capture::Audio(capture) => capture.run(),
        }
    }
}
