use std::time::{Duration, Instant};

use crate::cancel::WaitStatus;
use crate::capture::pipeline::capture_frame;
use crate::capture::{CaptureSink, IntervalSource};
use crate::types::error::{Error, Result};

/// Drives an interval-based source+sink pair until cancellation or error.
/// The sink is flushed on any clean exit; a non-cancellation error is
/// surfaced verbatim without flushing.
pub fn run_video_capture<Src, Sink>(source: &mut Src, sink: &mut Sink) -> Result<()>
where
    Src: IntervalSource,
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

/// `missed` whole intervals contained in `elapsed`, and the wait required
/// to land on the next interval boundary.
fn missed_and_delta(elapsed: u64, frame_time: u64) -> (u64, u64) {
    (elapsed / frame_time, frame_time - (elapsed % frame_time))
}

fn capture_loop<Src, Sink>(source: &mut Src, sink: &mut Sink) -> Result<()>
where
    Src: IntervalSource,
    Sink: CaptureSink<Input = Src::Input>,
{
    let frame_time = source.interval().as_nanos() as u64;
    debug_assert!(frame_time > 0);

    let mut frame_start = Instant::now();
    let mut frame_backlog: u64 = 0;
    let mut frame_number: u64 = 0;

    loop {
        let outcome = capture_frame(source, sink);
        let frame_finish = Instant::now();

        let timing = match outcome {
            Ok(timing) => timing,
            Err(err) => return drain_backlog(source, sink, frame_backlog, err),
        };

        // Elapsed covers the frame itself plus any scheduling overhead
        let elapsed = frame_finish
            .saturating_duration_since(frame_start)
            .as_nanos() as u64;

        let (missed_frames, mut delta) = missed_and_delta(elapsed, frame_time);
        if missed_frames > 0 {
            log::warn!(
                "Frame {frame_number} took {elapsed}ns and missed {missed_frames} frame(s) \
                 (Source={}ns, Sink={}ns). Attempting to catch up.",
                timing.capture.as_nanos(),
                timing.write.as_nanos()
            );
        }
        frame_backlog += missed_frames;

        // Behind schedule; capture the next frame without waiting
        if frame_backlog > 0 {
            delta = 0;
        }

        frame_number += 1;

        match source.timer().wait_for(Duration::from_nanos(delta)) {
            WaitStatus::Elapsed => {
                // The timer may overrun, so schedule from the intended
                // start rather than from now
                frame_start = frame_finish + Duration::from_nanos(delta);
                if frame_backlog > 0 {
                    frame_backlog -= 1;
                }
            }
            WaitStatus::Cancelled => {
                return drain_backlog(source, sink, frame_backlog, Error::Cancelled)
            }
        }
    }
}

fn drain_backlog<Src, Sink>(
    source: &mut Src,
    sink: &mut Sink,
    mut backlog: u64,
    err: Error,
) -> Result<()>
where
    Src: IntervalSource,
    Sink: CaptureSink<Input = Src::Input>,
{
    if err.is_cancelled() && backlog > 0 {
        log::info!(
            "{}: Clearing backlog of {backlog} frame(s)",
            source.name()
        );
        while backlog > 0 {
            capture_frame(source, sink)?;
            backlog -= 1;
        }
    }

    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::StickyCancelTimer;
    use crate::capture::CaptureSource;
    use std::sync::Arc;
    use std::thread;

    struct TickSource {
        timer: Arc<StickyCancelTimer>,
        interval: Duration,
        next_pts: i64,
    }

    impl CaptureSource for TickSource {
        type Input = i64;

        fn name(&self) -> &'static str {
            "tick-source"
        }

        fn capture(&mut self, input: &mut i64) -> Result<()> {
            *input = self.next_pts;
            self.next_pts += 1;
            Ok(())
        }
    }

    impl IntervalSource for TickSource {
        fn interval(&self) -> Duration {
            self.interval
        }

        fn timer(&self) -> &StickyCancelTimer {
            &self.timer
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        written: Vec<i64>,
        flushes: usize,
        stall_on_first: Option<Duration>,
    }

    impl CaptureSink for RecordingSink {
        type Input = i64;

        fn prepare(&mut self) -> Result<i64> {
            Ok(-1)
        }

        fn write(&mut self, input: i64) -> Result<()> {
            if self.written.is_empty() {
                if let Some(stall) = self.stall_on_first.take() {
                    thread::sleep(stall);
                }
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
    fn elapsed_below_frame_time_misses_nothing() {
        let (missed, delta) = missed_and_delta(10, 16);
        assert_eq!(missed, 0);
        assert_eq!(delta, 6);
    }

    #[test]
    fn elapsed_of_two_frame_times_misses_two() {
        let (missed, _) = missed_and_delta(32, 16);
        assert_eq!(missed, 2);
    }

    #[test]
    fn loop_recovers_from_a_stalled_sink() {
        let timer = Arc::new(StickyCancelTimer::new());
        let cancel = Arc::clone(&timer);

        let handle = thread::spawn(move || {
            let mut source = TickSource {
                timer,
                interval: Duration::from_millis(20),
                next_pts: 0,
            };
            let mut sink = RecordingSink {
                stall_on_first: Some(Duration::from_millis(50)),
                ..Default::default()
            };
            let result = run_video_capture(&mut source, &mut sink);
            (result, sink)
        });

        thread::sleep(Duration::from_millis(250));
        cancel.cancel();
        let (result, sink) = handle.join().unwrap();

        assert!(result.is_ok());
        assert_eq!(sink.flushes, 1);
        // The stall costs two intervals; the backlog catch-up means we
        // still produce at least one frame per interval overall
        assert!(sink.written.len() >= 10, "wrote {}", sink.written.len());
        for pair in sink.written.windows(2) {
            assert!(pair[0] < pair[1], "pts must be strictly monotonic");
        }
    }

    #[test]
    fn cancellation_flushes_and_reports_success() {
        let timer = Arc::new(StickyCancelTimer::new());
        timer.cancel();

        let mut source = TickSource {
            timer,
            interval: Duration::from_millis(5),
            next_pts: 0,
        };
        let mut sink = RecordingSink::default();

        assert!(run_video_capture(&mut source, &mut sink).is_ok());
        assert_eq!(sink.flushes, 1);
        // The first pipeline run happens before any timer wait
        assert_eq!(sink.written, vec![0]);
    }
}
