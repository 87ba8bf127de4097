//! The session coordinator: one container, one video capture, one audio
//! capture, one cancel arm. The first capture to finish brings the other
//! one down; the trailer is written exactly once after both have settled.

use std::sync::Arc;

use cust::sys::CUcontext;

use crate::cancel::StickyCancelEvent;
use crate::capture::{
    drm_source::DrmCudaCaptureSource, nvfbc_source::NvfbcCaptureSource,
    pipewire_source::PipewireCaptureSource, AudioCapture, Capture, VideoCapture, VideoSource,
};
use crate::desktop::{self, Desktop};
use crate::encoders::audio::{self, AudioEncoderSink};
use crate::encoders::nvenc::{NvencEncoderSink, SinkPixelFormat};
use crate::metrics::MetricsWriter;
use crate::mux::MediaContainer;
use crate::types::config::Parameters;
use crate::types::error::{Error, Result};

/// Owns the CUDA primary context for the lifetime of a session.
pub struct GpuContext {
    cuda: cust::prelude::Context,
}

impl GpuContext {
    pub fn new() -> Result<Self> {
        let cuda = cust::quick_init()
            .map_err(|err| Error::Gpu(format!("failed to initialize CUDA: {err}")))?;
        Ok(Self { cuda })
    }

    pub fn cuda_ctx(&self) -> CUcontext {
        self.cuda.as_raw()
    }
}

/// Completion bookkeeping shared by the two captures. The first non-cancel
/// error wins; errors provoked by cancelling the peer are discarded.
struct SessionProgress {
    remaining: usize,
    error: Option<Error>,
}

impl SessionProgress {
    fn new() -> Self {
        Self {
            remaining: 2,
            error: None,
        }
    }

    /// Returns true when this completion is the first of the two, i.e. the
    /// moment the peer capture must be cancelled.
    fn on_capture_done(&mut self, result: Result<()>) -> bool {
        debug_assert!(self.remaining > 0);
        self.remaining -= 1;

        if let Err(err) = result {
            if self.error.is_none() && !err.is_cancelled() {
                self.error = Some(err);
            }
        }

        self.remaining == 1
    }

    fn into_error(self) -> Option<Error> {
        self.error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureKind {
    Video,
    Audio,
}

fn build_video_capture(
    desktop: Desktop,
    params: &Parameters,
    gpu: &GpuContext,
    container: &Arc<MediaContainer>,
    metrics: Option<Arc<MetricsWriter>>,
) -> Result<VideoCapture> {
    match desktop {
        Desktop::X11 => {
            let source = NvfbcCaptureSource::new(params, gpu.cuda_ctx())?;
            let sink = NvencEncoderSink::new(
                Arc::clone(container),
                params,
                gpu.cuda_ctx(),
                source.desktop_size(),
                SinkPixelFormat::Bgra,
                metrics,
            )?;
            Ok(VideoCapture {
                source: VideoSource::Nvfbc(source),
                sink,
            })
        }
        Desktop::Wayland => {
            let desktop_size = desktop::wayland_output_size()?;
            let source = DrmCudaCaptureSource::new(params, gpu.cuda_ctx(), desktop_size)?;
            let sink = NvencEncoderSink::new(
                Arc::clone(container),
                params,
                gpu.cuda_ctx(),
                desktop_size,
                SinkPixelFormat::Bgra,
                metrics,
            )?;
            Ok(VideoCapture {
                source: VideoSource::Drm(source),
                sink,
            })
        }
    }
}

fn build_audio_capture(
    params: &Parameters,
    container: &Arc<MediaContainer>,
    metrics: Option<Arc<MetricsWriter>>,
) -> Result<AudioCapture> {
    let sink = AudioEncoderSink::new(Arc::clone(container), params, metrics)?;
    let source =
        PipewireCaptureSource::new(params.sample_rate, sink.frame_size(), sink.sample_format())?;
    Ok(AudioCapture { source, sink })
}

fn spawn_capture(
    name: &str,
    capture: Capture,
    kind: CaptureKind,
    done_tx: crossbeam::channel::Sender<(CaptureKind, Result<()>)>,
) -> Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let result = capture.run();
            let _ = done_tx.send((kind, result));
        })?;
    Ok(handle)
}

/// Runs one end-to-end recording. Returns once both captures have finished
/// and the trailer has been attempted.
pub fn run_session(
    cancel_event: Arc<StickyCancelEvent>,
    desktop: Desktop,
    params: &Parameters,
    gpu: &GpuContext,
) -> Result<()> {
    // Reject unusable audio configurations before creating the output file
    audio::validate(params)?;

    let container = Arc::new(MediaContainer::new(&params.output_file)?);
    let metrics = match params.enable_metrics {
        true => Some(Arc::new(MetricsWriter::new(&params.output_file)?)),
        false => None,
    };

    let video = Capture::Video(build_video_capture(
        desktop,
        params,
        gpu,
        &container,
        metrics.clone(),
    )?);
    let audio = Capture::Audio(build_audio_capture(params, &container, metrics)?);

    let video_cancel = video.cancel_handle();
    let audio_cancel = audio.cancel_handle();

    container.write_header()?;

    // Arm cancellation: one trigger of the session event brings both
    // captures down
    let cancel_arm = {
        let cancel_event = Arc::clone(&cancel_event);
        let video_cancel = video_cancel.clone();
        let audio_cancel = audio_cancel.clone();
        std::thread::Builder::new()
            .name("sc-cancel".into())
            .spawn(move || {
                let _ = cancel_event.wait_for_event();
                audio_cancel.cancel();
                video_cancel.cancel();
            })?
    };

    let (done_tx, done_rx) = crossbeam::channel::bounded(2);
    let video_handle = spawn_capture("sc-video", video, CaptureKind::Video, done_tx.clone())?;
    let audio_handle = spawn_capture("sc-audio", audio, CaptureKind::Audio, done_tx)?;

    let mut progress = SessionProgress::new();
    for _ in 0..2 {
        let (kind, result) = done_rx
            .recv()
            .expect("capture thread disconnected without reporting");
        if let Err(err) = &result {
            log::error!("{kind:?} capture finished with an error: {err}");
        }
        if progress.on_capture_done(result) {
            // A single failure (or completion) brings the session down
            match kind {
                CaptureKind::Video => audio_cancel.cancel(),
                CaptureKind::Audio => video_cancel.cancel(),
            }
        }
    }

    let _ = video_handle.join();
    let _ = audio_handle.join();

    // Release the cancel arm; cancelling the event is idempotent from the
    // user's point of view
    cancel_event.cancel();
    let _ = cancel_arm.join();

    let trailer_result = container.finish();
    match progress.into_error() {
        Some(err) => Err(err),
        None => trailer_result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_completion_triggers_peer_cancel_exactly_once() {
        let mut progress = SessionProgress::new();
        assert!(progress.on_capture_done(Ok(())));
        assert!(!progress.on_capture_done(Ok(())));
        assert!(progress.into_error().is_none());
    }

    #[test]
    fn first_non_cancel_error_wins() {
        let mut progress = SessionProgress::new();
        progress.on_capture_done(Err(Error::Encoder("send failed".into())));
        progress.on_capture_done(Err(Error::Muxer("write failed".into())));
        assert!(matches!(progress.into_error(), Some(Error::Encoder(_))));
    }

    #[test]
    fn cancelled_completions_are_not_errors() {
        let mut progress = SessionProgress::new();
        progress.on_capture_done(Err(Error::Cancelled));
        progress.on_capture_done(Ok(()));
        assert!(progress.into_error().is_none());
    }

    #[test]
    fn peer_error_after_a_real_error_is_discarded() {
        let mut progress = SessionProgress::new();
        progress.on_capture_done(Err(Error::Timeout("helper stalled".into())));
        progress.on_capture_done(Err(Error::Cancelled));
        assert!(matches!(progress.into_error(), Some(Error::Timeout(_))));
    }
}
