use std::sync::Arc;
use std::time::Instant;

use cust::sys::CUcontext;
use ffmpeg_next::{
    self as ffmpeg,
    ffi::{
        av_buffer_ref, av_buffer_unref, av_hwdevice_ctx_alloc, av_hwdevice_ctx_init,
        av_hwframe_ctx_alloc, av_hwframe_ctx_init, av_hwframe_get_buffer, AVHWDeviceContext,
        AVHWDeviceType, AVHWFramesContext, AVPixelFormat,
    },
};

use crate::capture::CaptureSink;
use crate::encoders::cuda::AVCUDADeviceContext;
use crate::metrics::{MetricsWriter, CATEGORY_VIDEO};
use crate::mux::MediaContainer;
use crate::types::config::{Parameters, VideoOutputSize};
use crate::types::error::{Error, Result};

/// Software layout of the hardware frames handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPixelFormat {
    Rgba,
    Bgra,
}

impl SinkPixelFormat {
    fn sw_format(self) -> AVPixelFormat {
        match self {
            SinkPixelFormat::Bgra => AVPixelFormat::AV_PIX_FMT_BGR0,
            SinkPixelFormat::Rgba => AVPixelFormat::AV_PIX_FMT_RGB0,
        }
    }
}

/// Maps the 1..=10 quality setting onto the inverse of the codec CQ range
/// [18..51].
fn convert_quality_to_cq(setting: u32) -> i32 {
    const TRANSPOSED_RANGE: i32 = 51 - 18;
    let transposed = ((setting as f32 - 1.0) / (10.0 - 1.0)) * TRANSPOSED_RANGE as f32;
    TRANSPOSED_RANGE - transposed as i32 + 18
}

/// Video sink encoding CUDA hardware frames with NVENC and feeding the
/// resulting packets to the container.
pub struct NvencEncoderSink {
    encoder: ffmpeg::encoder::Video,
    container: Arc<MediaContainer>,
    stream_index: usize,
    metrics: Option<Arc<MetricsWriter>>,
}

// The sink lives on the video capture thread; the raw codec pointers never
// leave it
unsafe impl Send for NvencEncoderSink {}

impl NvencEncoderSink {
    pub fn new(
        container: Arc<MediaContainer>,
        params: &Parameters,
        cuda_ctx: CUcontext,
        desktop_resolution: VideoOutputSize,
        pixel_format: SinkPixelFormat,
        metrics: Option<Arc<MetricsWriter>>,
    ) -> Result<Self> {
        let encoder = create_encoder_context(params, desktop_resolution, cuda_ctx, pixel_format)?;
        let stream_index = container.add_video_stream(&encoder)?;

        Ok(Self {
            encoder,
            container,
            stream_index,
            metrics,
        })
    }

    fn drain_packets(&mut self) -> Result<(usize, u64)> {
        let mut bytes = 0;
        let mut count = 0;
        loop {
            let mut packet = ffmpeg::codec::packet::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    bytes += packet.size();
                    count += 1;
                    self.container
                        .submit(packet, self.encoder.time_base(), self.stream_index)?;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(err) => return Err(Error::encoder(err)),
            }
        }
        Ok((bytes, count))
    }
}

impl CaptureSink for NvencEncoderSink {
    type Input = ffmpeg::frame::Video;

    /// Acquires a frame from the hardware pool and stamps it with the
    /// encoder's colour metadata. The pool holds a single frame, so the
    /// slot must be written back before the next prepare.
    fn prepare(&mut self) -> Result<Self::Input> {
        let mut frame = ffmpeg::frame::Video::empty();
        unsafe {
            let av = frame.as_mut_ptr();
            (*av).format = AVPixelFormat::AV_PIX_FMT_CUDA as i32;
            (*av).width = self.encoder.width() as i32;
            (*av).height = self.encoder.height() as i32;

            let ret = av_hwframe_get_buffer((*self.encoder.as_ptr()).hw_frames_ctx, av, 0);
            if ret < 0 {
                return Err(Error::Gpu(format!(
                    "failed to acquire hardware frame: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            (*av).extended_data = (*av).data.as_mut_ptr();
            (*av).color_range = (*self.encoder.as_ptr()).color_range;
            (*av).color_primaries = (*self.encoder.as_ptr()).color_primaries;
            (*av).color_trc = (*self.encoder.as_ptr()).color_trc;
            (*av).colorspace = (*self.encoder.as_ptr()).colorspace;
            (*av).chroma_location = (*self.encoder.as_ptr()).chroma_sample_location;
        }
        Ok(frame)
    }

    fn write(&mut self, frame: Self::Input) -> Result<()> {
        let started = Instant::now();
        let frame_id = frame.pts().unwrap_or(0) as u64;

        self.encoder.send_frame(&frame).map_err(Error::encoder)?;
        let (bytes, count) = self.drain_packets()?;

        if let Some(metrics) = &self.metrics {
            metrics.post(
                CATEGORY_VIDEO,
                frame_id,
                started.elapsed().as_nanos() as u64,
                bytes as u64,
                count,
            );
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.encoder.send_eof().map_err(Error::encoder)?;
        self.drain_packets()?;
        Ok(())
    }
}

/// Builds the NVENC encoder context.
///
/// Two rate-control modes are available. A non-zero bit rate selects CBR
/// with two B-frames around every P-frame and an I-frame every two seconds
/// (GOP = fps * 2), which is what streaming services expect. A zero bit
/// rate selects VBR driven by a constant-quality value. Both use the `p5`
/// preset.
fn create_encoder_context(
    params: &Parameters,
    desktop_resolution: VideoOutputSize,
    cuda_ctx: CUcontext,
    pixel_format: SinkPixelFormat,
) -> Result<ffmpeg::encoder::Video> {
    let codec = ffmpeg::encoder::find_by_name(&params.video_encoder).ok_or_else(|| {
        Error::Config(format!(
            "failed to find video codec: {}",
            params.video_encoder
        ))
    })?;

    let mut encoder_ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(Error::encoder)?;

    let framerate = params.frame_time.fps_rational();
    encoder_ctx.set_frame_rate(Some(framerate));
    encoder_ctx.set_time_base(framerate.invert());
    encoder_ctx.set_format(ffmpeg::format::Pixel::CUDA);
    encoder_ctx.set_bit_rate(params.bitrate as usize);
    if params.bitrate > 0 {
        encoder_ctx.set_max_b_frames(2);
        encoder_ctx.set_gop(framerate.numerator() as u32 * 2);
    }
    encoder_ctx.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);

    let size = params.resolution.unwrap_or(desktop_resolution);
    encoder_ctx.set_width(size.width);
    encoder_ctx.set_height(size.height);

    unsafe {
        let nvenc_device = av_hwdevice_ctx_alloc(AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA);
        if nvenc_device.is_null() {
            return Err(Error::Gpu("could not allocate CUDA device context".into()));
        }

        let hw_device_ctx = (*nvenc_device).data as *mut AVHWDeviceContext;
        let cuda_device_ctx = (*hw_device_ctx).hwctx as *mut AVCUDADeviceContext;
        (*cuda_device_ctx).cuda_ctx = cuda_ctx;

        let err = av_hwdevice_ctx_init(nvenc_device);
        if err < 0 {
            return Err(Error::Gpu(format!(
                "error initializing hardware device context: {}",
                ffmpeg::Error::from(err)
            )));
        }

        let mut frame_ctx = av_hwframe_ctx_alloc(nvenc_device);
        if frame_ctx.is_null() {
            return Err(Error::Gpu("could not allocate hardware frame context".into()));
        }

        let hw_frame_context = &mut *((*frame_ctx).data as *mut AVHWFramesContext);
        hw_frame_context.width = size.width as i32;
        hw_frame_context.height = size.height as i32;
        hw_frame_context.sw_format = pixel_format.sw_format();
        hw_frame_context.format = AVPixelFormat::AV_PIX_FMT_CUDA;
        hw_frame_context.device_ctx = hw_device_ctx;
        // One frame is enough; the loop writes each slot back before
        // preparing the next
        hw_frame_context.initial_pool_size = 1;

        let err = av_hwframe_ctx_init(frame_ctx);
        if err < 0 {
            return Err(Error::Gpu(format!(
                "error initializing hardware frame context: {}",
                ffmpeg::Error::from(err)
            )));
        }

        (*encoder_ctx.as_mut_ptr()).hw_device_ctx = av_buffer_ref(nvenc_device);
        (*encoder_ctx.as_mut_ptr()).hw_frames_ctx = av_buffer_ref(frame_ctx);

        av_buffer_unref(&mut frame_ctx);
    }

    let mut opts = ffmpeg::Dictionary::new();
    opts.set("preset", "p5");
    if codec.id() == ffmpeg::codec::Id::H264 {
        opts.set("profile", "high");
        opts.set("coder", "cavlc");
    }
    if params.bitrate == 0 {
        let cq = convert_quality_to_cq(params.quality);
        log::info!("NVENC using VBR, cq value {cq}");
        opts.set("rc", "vbr");
        opts.set("cq", &cq.to_string());
    } else {
        log::info!("NVENC using CBR, bitrate {}", params.bitrate);
        opts.set("rc", "cbr");
    }

    encoder_ctx
        .open_with(opts)
        .map_err(|err| Error::Encoder(format!("failed to open video codec: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_extremes_map_onto_the_cq_range() {
        assert_eq!(convert_quality_to_cq(1), 51);
        assert_eq!(convert_quality_to_cq(10), 18);
    }

    #[test]
    fn quality_scale_is_monotonically_decreasing() {
        for setting in 1..10 {
            assert!(convert_quality_to_cq(setting) >= convert_quality_to_cq(setting + 1));
        }
    }
}
