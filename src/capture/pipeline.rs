use std::time::{Duration, Instant};

use crate::capture::{CaptureSink, CaptureSource};
use crate::types::error::Result;

/// How long each stage of a single frame's trip took.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTiming {
    pub capture: Duration,
    pub write: Duration,
}

/// One source→sink hand-off: obtain a slot from the sink, let the source
/// fill it, then hand it back for encoding. A failure at either stage
/// short-circuits without touching the other stage; dropping the slot on
/// the error path releases its frame.
pub fn capture_frame<Src, Sink>(source: &mut Src, sink: &mut Sink) -> Result<StageTiming>
where
    Src: CaptureSource,
    Sink: CaptureSink<Input = Src::Input>,
{
    let mut input = sink.prepare()?;

    let capture_start = Instant::now();
    source.capture(&mut input)?;
    let capture = capture_start.elapsed();

    let write_start = Instant::now();
    sink.write(input)?;

    Ok(StageTiming {
        capture,
        write: write_start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::error::Error;

    struct CountingSource {
        captures: usize,
        fail: bool,
    }

    impl CaptureSource for CountingSource {
        type Input = u32;

        fn name(&self) -> &'static str {
            "counting-source"
        }

        fn capture(&mut self, input: &mut u32) -> Result<()> {
            if self.fail {
                return Err(Error::Capture("grab failed".into()));
            }
            self.captures += 1;
            *input += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        prepared: usize,
        written: Vec<u32>,
        fail_prepare: bool,
    }

    impl CaptureSink for CountingSink {
        type Input = u32;

        fn prepare(&mut self) -> Result<u32> {
            if self.fail_prepare {
                return Err(Error::Encoder("no frames left".into()));
            }
            self.prepared += 1;
            Ok(0)
        }

        fn write(&mut self, input: u32) -> Result<()> {
            self.written.push(input);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn runs_prepare_capture_write_in_order() {
        let mut source = CountingSource {
            captures: 0,
            fail: false,
        };
        let mut sink = CountingSink::default();
        capture_frame(&mut source, &mut sink).unwrap();
        assert_eq!(sink.prepared, 1);
        assert_eq!(source.captures, 1);
        assert_eq!(sink.written, vec![1]);
    }

    #[test]
    fn source_failure_skips_the_sink_write() {
        let mut source = CountingSource {
            captures: 0,
            fail: true,
        };
        let mut sink = CountingSink::default();
        assert!(capture_frame(&mut source, &mut sink).is_err());
        assert_eq!(sink.prepared, 1);
        assert!(sink.written.is_empty());
    }

    #[test]
    fn prepare_failure_never_reaches_the_source() {
        let mut source = CountingSource {
            captures: 0,
            fail: false,
        };
        let mut sink = CountingSink {
            fail_prepare: true,
            ..Default::default()
        };
        assert!(capture_frame(&mut source, &mut sink).is_err());
        assert_eq!(source.captures, 0);
    }
}
