use crate::capture::pipeline::capture_frame;
use crate::capture::{CaptureSink, EventSource};
use crate::types::error::Result;

/// Drives an event-triggered source+sink pair until cancellation or error.
/// Each consumed event corresponds to one encoder frame's worth of samples.
pub fn run_audio_capture<Src, Sink>(source: &mut Src, sink: &mut Sink) -> Result<()>
where
    Src: EventSource,
    Sink: CaptureSink<Input = Src::Input>,
{
    log::info!("Initializing {}", source.name());
    source.init()?;

    let result = capture_loop(source, sink);

    log::info!("Uninitializing {}", source.name());
    source.deinit();

    match result {
        Err(err) if !err.is_cancelled() => {
            log::error!("{} exited with an error: {err}", source.name());
            Err(err)
        }
        _ => {
            log::info!("{} exited normally. Flushing output stream.", source.name());
            sink.flush()
        }
    }
}

fn capture_loop<Src, Sink>(source: &mut Src, sink: &mut Sink) -> Result<()>
where
    Src: EventSource,
    Sink: CaptureSink<Input = Src::Input>,
{
    loop {
        source.event().wait_for_event()?;
        capture_frame(source, sink)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::StickyCancelEvent;
    use crate::capture::CaptureSource;
    use crate::types::error::Error;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct ChunkSource {
        event: Arc<StickyCancelEvent>,
        captured: mpsc::Sender<u64>,
        samples_written: u64,
        nb_samples: u64,
    }

    impl CaptureSource for ChunkSource {
        type Input = i64;

        fn name(&self) -> &'static str {
            "chunk-source"
        }

        fn capture(&mut self, input: &mut i64) -> Result<()> {
            *input = self.samples_written as i64;
            self.samples_written += self.nb_samples;
            self.captured.send(self.samples_written).unwrap();
            Ok(())
        }
    }

    impl EventSource for ChunkSource {
        fn event(&self) -> &StickyCancelEvent {
            &self.event
        }
    }

    #[derive(Default)]
    struct PtsSink {
        written: Vec<i64>,
        flushes: usize,
        fail_write: bool,
    }

    impl CaptureSink for PtsSink {
        type Input = i64;

        fn prepare(&mut self) -> Result<i64> {
            Ok(0)
        }

        fn write(&mut self, input: i64) -> Result<()> {
            if self.fail_write {
                return Err(Error::Encoder("send_frame failed".into()));
            }
            self.written.push(input);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn pts_tracks_the_cumulative_sample_count() {
        let event = Arc::new(StickyCancelEvent::new());
        let (tx, rx) = mpsc::channel();
        let cancel = Arc::clone(&event);

        event.trigger(3);
        let handle = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                let mut source = ChunkSource {
                    event,
                    captured: tx,
                    samples_written: 0,
                    nb_samples: 1024,
                };
                let mut sink = PtsSink::default();
                let result = run_audio_capture(&mut source, &mut sink);
                (result, sink)
            })
        };

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        cancel.cancel();
        let (result, sink) = handle.join().unwrap();

        assert!(result.is_ok());
        assert_eq!(sink.written, vec![0, 1024, 2048]);
        assert_eq!(sink.flushes, 1);
    }

    #[test]
    fn encoder_errors_propagate_without_flushing() {
        let event = Arc::new(StickyCancelEvent::new());
        event.trigger(1);
        let (tx, _rx) = mpsc::channel();

        let mut source = ChunkSource {
            event: Arc::clone(&event),
            captured: tx,
            samples_written: 0,
            nb_samples: 1024,
        };
        let mut sink = PtsSink {
            fail_write: true,
            ..Default::default()
        };

        let result = run_audio_capture(&mut source, &mut sink);
        assert!(matches!(result, Err(Error::Encoder(_))));
        assert_eq!(sink.flushes, 0);
    }
}
