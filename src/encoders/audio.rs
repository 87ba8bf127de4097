use std::sync::Arc;
use std::time::Instant;

use ffmpeg_next::{self as ffmpeg, ChannelLayout, Rational};

use crate::capture::CaptureSink;
use crate::metrics::{MetricsWriter, CATEGORY_AUDIO};
use crate::mux::MediaContainer;
use crate::types::config::{CaptureQuality, Parameters};
use crate::types::error::{Error, Result};
use crate::types::sample_format::{
    find_supported_formats, is_sample_rate_supported, SampleFormat,
};

/// Used when the codec accepts variable frame sizes.
const DEFAULT_AUDIO_FRAME_SIZE: usize = 1024;

/// Captures are always downmixed to stereo.
pub const CHANNEL_COUNT: u32 = 2;

fn bit_rate_for(quality: CaptureQuality) -> usize {
    match quality {
        CaptureQuality::Minimum => 64_000,
        CaptureQuality::Low => 96_000,
        CaptureQuality::Medium => 128_000,
    }
}

fn find_codec(name: &str) -> Result<ffmpeg::codec::Codec> {
    ffmpeg::encoder::find_by_name(name)
        .ok_or_else(|| Error::Config(format!("failed to find audio codec: {name}")))
}

fn negotiate_format(codec: ffmpeg::codec::Codec, sample_rate: u32) -> Result<SampleFormat> {
    let capabilities = codec.audio().map_err(Error::encoder)?;

    if !is_sample_rate_supported(&capabilities, sample_rate) {
        return Err(Error::Config(format!(
            "sample rate not supported by codec: {sample_rate}"
        )));
    }

    find_supported_formats(&capabilities)
        .first()
        .copied()
        .ok_or_else(|| Error::Config("no supported sample formats found".into()))
}

/// Rejects unusable audio configurations before any output file is opened.
pub fn validate(params: &Parameters) -> Result<()> {
    negotiate_format(find_codec(&params.audio_encoder)?, params.sample_rate).map(|_| ())
}

/// Audio sink around a generic libav encoder, AAC by default.
pub struct AudioEncoderSink {
    encoder: ffmpeg::encoder::Audio,
    container: Arc<MediaContainer>,
    stream_index: usize,
    frame_size: usize,
    sample_format: SampleFormat,
    metrics: Option<Arc<MetricsWriter>>,
}

// The sink lives on the audio capture thread; the raw codec pointers never
// leave it
unsafe impl Send for AudioEncoderSink {}

impl AudioEncoderSink {
    pub fn new(
        container: Arc<MediaContainer>,
        params: &Parameters,
        metrics: Option<Arc<MetricsWriter>>,
    ) -> Result<Self> {
        let codec = find_codec(&params.audio_encoder)?;
        let sample_format = negotiate_format(codec, params.sample_rate)?;

        let mut encoder_ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(Error::encoder)?;

        encoder_ctx.set_rate(params.sample_rate as i32);
        encoder_ctx.set_format(sample_format.to_libav());
        encoder_ctx.set_channel_layout(ChannelLayout::STEREO);
        encoder_ctx.set_bit_rate(bit_rate_for(params.audio_quality()));
        encoder_ctx.set_time_base(Rational::new(1, params.sample_rate as i32));
        encoder_ctx.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);

        let encoder = encoder_ctx
            .open()
            .map_err(|err| Error::Encoder(format!("failed to open audio codec: {err}")))?;

        let frame_size = match encoder.frame_size() {
            0 => DEFAULT_AUDIO_FRAME_SIZE,
            size => size as usize,
        };

        let stream_index = container.add_audio_stream(&encoder)?;

        Ok(Self {
            encoder,
            container,
            stream_index,
            frame_size,
            sample_format,
            metrics,
        })
    }

    /// Samples per encoded frame; the capture side slices its accumulator
    /// to exactly this count.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
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

impl CaptureSink for AudioEncoderSink {
    type Input = ffmpeg::frame::Audio;

    fn prepare(&mut self) -> Result<Self::Input> {
        let mut frame = ffmpeg::frame::Audio::new(
            self.encoder.format(),
            self.frame_size,
            ChannelLayout::STEREO,
        );
        frame.set_rate(self.encoder.rate());
        Ok(frame)
    }

    fn write(&mut self, frame: Self::Input) -> Result<()> {
        let started = Instant::now();
        let frame_id = frame.pts().unwrap_or(0) as u64;

        self.encoder.send_frame(&frame).map_err(Error::encoder)?;
        let (bytes, count) = self.drain_packets()?;

        if let Some(metrics) = &self.metrics {
            metrics.post(
                CATEGORY_AUDIO,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_rate_follows_the_quality_tier() {
        assert_eq!(bit_rate_for(CaptureQuality::Minimum), 64_000);
        assert_eq!(bit_rate_for(CaptureQuality::Low), 96_000);
        assert_eq!(bit_rate_for(CaptureQuality::Medium), 128_000);
    }
}
