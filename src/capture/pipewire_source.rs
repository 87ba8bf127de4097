use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use ffmpeg_next::frame;
use pipewire::{
    self as pw,
    context::Context,
    main_loop::MainLoop,
    properties::properties,
    spa::{
        self,
        param::format::{MediaSubtype, MediaType},
        pod::Pod,
        utils::Direction,
    },
    stream::StreamFlags,
};

use crate::cancel::StickyCancelEvent;
use crate::capture::{CaptureSource, EventSource, Terminate};
use crate::encoders::audio::CHANNEL_COUNT;
use crate::types::error::{Error, Result};
use crate::types::media_chunk::{DynamicBuffer, MediaChunk};
use crate::types::sample_format::SampleFormat;

#[derive(Clone, Copy, Default)]
struct AudioFormatInfo {
    format: spa::param::audio::AudioInfoRaw,
}

/// Sample store shared between the PipeWire callback and the capture loop.
#[derive(Default)]
struct AudioAccumulator {
    chunk: MediaChunk,
    frame_samples_written: usize,
    samples_written: u64,
}

impl AudioAccumulator {
    /// Appends one PipeWire buffer's worth of channel data and returns how
    /// many whole encoder frames became available.
    fn push(
        &mut self,
        channels: &[&[u8]],
        samples: usize,
        watermark: usize,
        timestamp_ms: u64,
    ) -> u64 {
        self.chunk.timestamp_ms = timestamp_ms;
        self.chunk.sample_count += samples;

        let buffers = self.chunk.channel_buffers_mut();
        while buffers.len() < channels.len() {
            buffers.push(DynamicBuffer::new());
        }

        for (data, buffer) in channels.iter().zip(buffers.iter_mut()) {
            let target = buffer.prepare(data.len());
            target[..data.len()].copy_from_slice(data);
            buffer.commit(data.len());
        }

        self.frame_samples_written += samples;
        if self.frame_samples_written >= watermark {
            let frames_ready = (self.frame_samples_written / watermark) as u64;
            self.frame_samples_written %= watermark;
            frames_ready
        } else {
            0
        }
    }

    /// Moves exactly `samples` per channel into the frame and stamps its
    /// pts with the running sample count.
    fn transfer(
        &mut self,
        frame: &mut frame::Audio,
        samples: usize,
        format: SampleFormat,
    ) -> Result<()> {
        if self.chunk.sample_count < samples {
            return Err(Error::Capture("audio accumulator underrun".into()));
        }

        let sample_size = format.sample_size();
        if format.is_planar() {
            let num_bytes = samples * sample_size;
            let channels = frame.planes();
            let buffers = self.chunk.channel_buffers_mut();
            if buffers.len() < channels {
                return Err(Error::Capture(format!(
                    "expected {channels} channel buffers, have {}",
                    buffers.len()
                )));
            }
            for (channel, buffer) in buffers.iter_mut().enumerate().take(channels) {
                frame.data_mut(channel)[..num_bytes].copy_from_slice(&buffer.data()[..num_bytes]);
                buffer.consume(num_bytes);
            }
        } else {
            let num_bytes = samples * sample_size * CHANNEL_COUNT as usize;
            let buffer = &mut self.chunk.channel_buffers_mut()[0];
            frame.data_mut(0)[..num_bytes].copy_from_slice(&buffer.data()[..num_bytes]);
            buffer.consume(num_bytes);
        }

        self.chunk.sample_count -= samples;
        frame.set_pts(Some(self.samples_written as i64));
        self.samples_written += samples as u64;
        Ok(())
    }
}

struct AudioSourceState {
    event: Arc<StickyCancelEvent>,
    sample_format: SampleFormat,
    /// High watermark; equals the encoder's frame size.
    frame_size: usize,
    audio: Mutex<AudioAccumulator>,
    started: Instant,
}

/// Event-triggered audio source backed by a PipeWire capture stream running
/// on its own thread.
pub struct PipewireCaptureSource {
    state: Arc<AudioSourceState>,
    sample_rate: u32,
    terminate_tx: Option<pw::channel::Sender<Terminate>>,
    loop_handle: Option<JoinHandle<()>>,
}

impl PipewireCaptureSource {
    pub fn new(sample_rate: u32, frame_size: usize, sample_format: SampleFormat) -> Result<Self> {
        // Fail configuration early if PipeWire can't deliver this layout
        sample_format.to_spa()?;

        Ok(Self {
            state: Arc::new(AudioSourceState {
                event: Arc::new(StickyCancelEvent::new()),
                sample_format,
                frame_size,
                audio: Mutex::new(AudioAccumulator::default()),
                started: Instant::now(),
            }),
            sample_rate,
            terminate_tx: None,
            loop_handle: None,
        })
    }

    pub fn event_handle(&self) -> Arc<StickyCancelEvent> {
        Arc::clone(&self.state.event)
    }

    fn stop_stream(&mut self) {
        if let Some(terminate_tx) = self.terminate_tx.take() {
            let _ = terminate_tx.send(Terminate);
        }
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
    }
}

impl CaptureSource for PipewireCaptureSource {
    type Input = frame::Audio;

    fn name(&self) -> &'static str {
        "PipeWire audio source"
    }

    fn init(&mut self) -> Result<()> {
        let (terminate_tx, terminate_rx) = pw::channel::channel();
        self.terminate_tx = Some(terminate_tx);

        let state = Arc::clone(&self.state);
        let sample_rate = self.sample_rate;
        let handle = std::thread::Builder::new()
            .name("sc-pipewire".into())
            .spawn(move || {
                if let Err(err) = run_stream(state, sample_rate, terminate_rx) {
                    log::error!("PipeWire audio loop failed: {err}");
                }
            })?;
        self.loop_handle = Some(handle);
        Ok(())
    }

    fn deinit(&mut self) {
        self.stop_stream();
    }

    fn capture(&mut self, frame: &mut Self::Input) -> Result<()> {
        let samples = frame.samples();
        debug_assert!(samples > 0);

        // The loop consumed one event, so at least one frame's worth of
        // samples is waiting in the accumulator
        let mut audio = self.state.audio.lock().unwrap();
        audio.transfer(frame, samples, self.state.sample_format)
    }
}

impl EventSource for PipewireCaptureSource {
    fn event(&self) -> &StickyCancelEvent {
        &self.state.event
    }
}

impl Drop for PipewireCaptureSource {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

fn run_stream(
    state: Arc<AudioSourceState>,
    sample_rate: u32,
    terminate_rx: pw::channel::Receiver<Terminate>,
) -> Result<()> {
    let pw_loop = MainLoop::new(None)?;
    let terminate_loop = pw_loop.clone();

    let _terminate_recv = terminate_rx.attach(pw_loop.loop_(), move |_| {
        log::debug!("Terminating audio capture loop");
        terminate_loop.quit();
    });

    let context = Context::new(&pw_loop)?;
    let core = context.connect(None)?;

    let stream = pw::stream::Stream::new(
        &core,
        "shadow-cast-audio",
        properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Music",
            // Capture what the desktop is playing, not a microphone
            *pw::keys::STREAM_CAPTURE_SINK => "true",
        },
    )?;

    let process_state = Arc::clone(&state);
    let _stream_listener = stream
        .add_local_listener_with_user_data(AudioFormatInfo::default())
        .state_changed(|_, _, old, new| {
            log::debug!("Audio stream state changed: {old:?} -> {new:?}");
        })
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else {
                return;
            };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match spa::param::format_utils::parse_format(param) {
                Ok(value) => value,
                Err(_) => return,
            };
            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if user_data.format.parse(param).is_err() {
                log::error!("Failed to parse audio stream format");
                return;
            }

            log::debug!(
                "Capturing rate:{} channels:{} format:{}",
                user_data.format.rate(),
                user_data.format.channels(),
                user_data.format.format().as_raw()
            );

            if user_data.format.channels() != CHANNEL_COUNT {
                log::error!(
                    "Negotiated {} channels; only stereo capture is supported",
                    user_data.format.channels()
                );
            }
        })
        .process(move |stream, user_data| {
            on_process(stream, user_data, &process_state);
        })
        .register()?;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(state.sample_format.to_spa()?);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(CHANNEL_COUNT);

    let audio_spa_values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(spa::pod::Object {
            type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
            id: spa::param::ParamType::EnumFormat.as_raw(),
            properties: audio_info.into(),
        }),
    )
    .map_err(|err| Error::Capture(format!("failed to serialize audio format: {err:?}")))?
    .0
    .into_inner();

    let mut audio_params = [Pod::from_bytes(&audio_spa_values)
        .ok_or_else(|| Error::Capture("invalid audio format pod".into()))?];

    stream.connect(
        Direction::Input,
        None,
        StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::RT_PROCESS,
        &mut audio_params,
    )?;

    pw_loop.run();
    Ok(())
}

fn on_process(
    stream: &pw::stream::StreamRef,
    info: &mut AudioFormatInfo,
    state: &AudioSourceState,
) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        log::debug!("Out of audio buffers");
        return;
    };

    if state.event.is_cancelled() {
        return;
    }

    let datas = buffer.datas_mut();
    if datas.is_empty() {
        return;
    }

    let sample_size = state.sample_format.sample_size();
    let channel_count = match info.format.channels() {
        0 => CHANNEL_COUNT as usize,
        channels => channels as usize,
    };

    let first_chunk_bytes = datas[0].chunk().size() as usize;
    let samples = if state.sample_format.is_planar() {
        first_chunk_bytes / sample_size
    } else {
        first_chunk_bytes / (sample_size * channel_count)
    };
    if samples == 0 {
        return;
    }

    let mut channel_data: Vec<&[u8]> = Vec::with_capacity(datas.len());
    for data in datas.iter_mut() {
        let size = data.chunk().size() as usize;
        if let Some(bytes) = data.data() {
            let len = size.min(bytes.len());
            channel_data.push(&bytes[..len]);
        }
    }
    if channel_data.is_empty() {
        return;
    }

    let timestamp_ms = state.started.elapsed().as_millis() as u64;
    let frames_ready = {
        let mut audio = state.audio.lock().unwrap();
        audio.push(&channel_data, samples, state.frame_size, timestamp_ms)
    };

    if frames_ready > 0 {
        state.event.trigger(frames_ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_next::format::sample::Type as SampleType;
    use ffmpeg_next::format::Sample as AvSample;
    use ffmpeg_next::ChannelLayout;

    fn planar_frame(samples: usize) -> frame::Audio {
        frame::Audio::new(
            AvSample::F32(SampleType::Planar),
            samples,
            ChannelLayout::STEREO,
        )
    }

    #[test]
    fn watermark_reports_whole_frames_only() {
        let mut accumulator = AudioAccumulator::default();
        let half = vec![1u8; 512 * 4];

        assert_eq!(accumulator.push(&[&half, &half], 512, 1024, 0), 0);
        assert_eq!(accumulator.push(&[&half, &half], 512, 1024, 1), 1);
        assert_eq!(accumulator.frame_samples_written, 0);
        assert_eq!(accumulator.chunk.sample_count, 1024);
    }

    #[test]
    fn a_large_burst_reports_multiple_frames() {
        let mut accumulator = AudioAccumulator::default();
        let burst = vec![0u8; 2500 * 4];
        assert_eq!(accumulator.push(&[&burst, &burst], 2500, 1024, 0), 2);
        assert_eq!(accumulator.frame_samples_written, 2500 % 1024);
    }

    #[test]
    fn transfer_stamps_the_cumulative_sample_count() {
        let mut accumulator = AudioAccumulator::default();
        let data = vec![3u8; 2048 * 4];
        accumulator.push(&[&data, &data], 2048, 1024, 0);

        let mut frame = planar_frame(1024);
        accumulator
            .transfer(&mut frame, 1024, SampleFormat::FloatPlanar)
            .unwrap();
        assert_eq!(frame.pts(), Some(0));

        accumulator
            .transfer(&mut frame, 1024, SampleFormat::FloatPlanar)
            .unwrap();
        assert_eq!(frame.pts(), Some(1024));
        assert_eq!(accumulator.chunk.sample_count, 0);
    }

    #[test]
    fn transfer_without_enough_samples_is_an_error() {
        let mut accumulator = AudioAccumulator::default();
        let mut frame = planar_frame(1024);
        assert!(accumulator
            .transfer(&mut frame, 1024, SampleFormat::FloatPlanar)
            .is_err());
    }
}
