use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ffmpeg_next::codec::packet::Packet;
use ffmpeg_next::format::context;
use ffmpeg_next::Rational;

use crate::types::error::{Error, Result};

pub mod packet_queue;

use packet_queue::PacketQueue;

struct OutputContext(context::Output);

// The context only crosses into the muxer thread behind the container's
// mutex
unsafe impl Send for OutputContext {}

/// Owns the output file. Streams are declared up front, encoded packets are
/// funnelled through a byte-bounded queue, and a dedicated muxer thread is
/// the only writer of the underlying I/O context.
pub struct MediaContainer {
    output: Arc<Mutex<OutputContext>>,
    queue: Arc<PacketQueue>,
    write_error: Arc<Mutex<Option<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    header_written: AtomicBool,
    trailer_written: AtomicBool,
}

impl MediaContainer {
    /// Opens the output file; the container format is inferred from the
    /// file extension.
    pub fn new(output_file: &Path) -> Result<Self> {
        let output = ffmpeg_next::format::output(&output_file)
            .map_err(|err| Error::Muxer(format!("failed to open output: {err}")))?;

        Ok(Self {
            output: Arc::new(Mutex::new(OutputContext(output))),
            queue: Arc::new(PacketQueue::default()),
            write_error: Arc::new(Mutex::new(None)),
            writer: Mutex::new(None),
            header_written: AtomicBool::new(false),
            trailer_written: AtomicBool::new(false),
        })
    }

    pub fn add_video_stream(&self, encoder: &ffmpeg_next::encoder::Video) -> Result<usize> {
        let codec = encoder
            .codec()
            .ok_or_else(|| Error::Encoder("video encoder has no codec".into()))?;
        let mut output = self.output.lock().unwrap();
        let mut stream = output.0.add_stream(codec).map_err(Error::muxer)?;
        stream.set_time_base(encoder.time_base());
        stream.set_parameters(encoder);
        Ok(stream.index())
    }

    pub fn add_audio_stream(&self, encoder: &ffmpeg_next::encoder::Audio) -> Result<usize> {
        let codec = encoder
            .codec()
            .ok_or_else(|| Error::Encoder("audio encoder has no codec".into()))?;
        let mut output = self.output.lock().unwrap();
        let mut stream = output.0.add_stream(codec).map_err(Error::muxer)?;
        stream.set_time_base(encoder.time_base());
        stream.set_parameters(encoder);
        Ok(stream.index())
    }

    /// Writes the container header and starts the muxer thread. Call once,
    /// after every stream has been added.
    pub fn write_header(&self) -> Result<()> {
        {
            let mut output = self.output.lock().unwrap();
            output.0.write_header().map_err(Error::muxer)?;
        }
        self.header_written.store(true, Ordering::Release);

        let queue = Arc::clone(&self.queue);
        let output = Arc::clone(&self.output);
        let write_error = Arc::clone(&self.write_error);
        let handle = std::thread::Builder::new()
            .name("sc-muxer".into())
            .spawn(move || {
                while let Some(item) = queue.dequeue() {
                    let mut output = output.lock().unwrap();
                    if let Err(err) = item.packet.write_interleaved(&mut output.0) {
                        log::error!("Failed to write packet: {err}");
                        let mut slot = write_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err.to_string());
                        }
                    }
                }
            })?;
        *self.writer.lock().unwrap() = Some(handle);

        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Result<Rational> {
        let output = self.output.lock().unwrap();
        output
            .0
            .stream(index)
            .map(|stream| stream.time_base())
            .ok_or_else(|| Error::Muxer(format!("no stream with index {index}")))
    }

    /// Rescales the packet onto its stream's time base and hands it to the
    /// muxer thread. Blocks while the queue is at capacity.
    pub fn submit(
        &self,
        mut packet: Packet,
        encoder_time_base: Rational,
        stream_index: usize,
    ) -> Result<()> {
        if let Some(msg) = self.write_error.lock().unwrap().as_ref() {
            return Err(Error::Muxer(msg.clone()));
        }

        packet.rescale_ts(encoder_time_base, self.stream_time_base(stream_index)?);
        packet.set_stream(stream_index);
        self.queue.enqueue(packet);
        Ok(())
    }

    /// Drains the queue, stops the muxer thread and writes the trailer.
    /// The trailer is written at most once, and only after a successful
    /// header. A deferred packet-write error takes precedence over the
    /// trailer outcome.
    pub fn finish(&self) -> Result<()> {
        self.queue.shutdown();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }

        let trailer_result = if self.header_written.load(Ordering::Acquire)
            && !self.trailer_written.swap(true, Ordering::AcqRel)
        {
            let mut output = self.output.lock().unwrap();
            output.0.write_trailer().map_err(Error::muxer)
        } else {
            Ok(())
        };

        if let Some(msg) = self.write_error.lock().unwrap().take() {
            return Err(Error::Muxer(msg));
        }

        trailer_result
    }
}

impl Drop for MediaContainer {
    fn drop(&mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
