use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use crate::types::error::Result;

pub const CATEGORY_VIDEO: u32 = 1;
pub const CATEGORY_AUDIO: u32 = 2;

/// Appends per-frame timing rows to a CSV sidecar next to the media file.
/// Columns: `category,id,timestamp_ns,nanoseconds,frame_size,frame_count`.
pub struct MetricsWriter {
    output: Mutex<BufWriter<File>>,
    started: Instant,
}

impl MetricsWriter {
    pub fn new(media_output_file: &Path) -> Result<Self> {
        let mut path = media_output_file.as_os_str().to_owned();
        path.push(".metrics");
        let file = File::create(path)?;

        Ok(Self {
            output: Mutex::new(BufWriter::new(file)),
            started: Instant::now(),
        })
    }

    pub fn post(&self, category: u32, id: u64, nanoseconds: u64, frame_size: u64, frame_count: u64) {
        let timestamp_ns = self.started.elapsed().as_nanos() as u64;
        let mut output = self.output.lock().unwrap();
        if let Err(err) = writeln!(
            output,
            "{category},{id},{timestamp_ns},{nanoseconds},{frame_size},{frame_count}"
        ) {
            log::error!("Failed to write metrics row: {err}");
        }
    }
}

impl Drop for MetricsWriter {
    fn drop(&mut self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_land_in_the_sidecar_file() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("out.mp4");

        let writer = MetricsWriter::new(&media).unwrap();
        writer.post(CATEGORY_VIDEO, 3, 1_000, 2_048, 1);
        writer.post(CATEGORY_AUDIO, 4, 2_000, 512, 2);
        drop(writer);

        let contents = std::fs::read_to_string(dir.path().join("out.mp4.metrics")).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("1,3,"));
        assert!(rows[0].ends_with(",1000,2048,1"));
        assert!(rows[1].starts_with("2,4,"));
    }
}
