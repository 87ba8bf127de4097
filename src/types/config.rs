use std::path::PathBuf;

use crate::types::error::{Error, Result};
use crate::utils::FrameTime;

/// Dimensions of the encoded output, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoOutputSize {
    pub width: u32,
    pub height: u32,
}

impl VideoOutputSize {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "invalid resolution {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }

    /// Parses a `WxH` string, e.g. `1920x1080`.
    pub fn parse(value: &str) -> Result<Self> {
        let (w, h) = value
            .split_once(['x', 'X'])
            .ok_or_else(|| Error::Config(format!("malformed resolution: {value}")))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::Config(format!("malformed resolution: {value}")))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::Config(format!("malformed resolution: {value}")))?;
        Self::new(width, height)
    }
}

/// Width/height factors applied by the colour converter when the capture is
/// scaled to a different output resolution.
#[derive(Debug, Clone, Copy)]
pub struct VideoOutputScale {
    pub width: f32,
    pub height: f32,
}

impl Default for VideoOutputScale {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
        }
    }
}

/// Coarse quality tiers derived from the 1..=10 quality setting. The audio
/// encoder selects its bit rate from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureQuality {
    Minimum,
    Low,
    Medium,
}

impl CaptureQuality {
    pub fn from_level(level: u32) -> Self {
        match level {
            0..=2 => CaptureQuality::Minimum,
            3..=4 => CaptureQuality::Low,
            _ => CaptureQuality::Medium,
        }
    }
}

/// Everything the session needs to know about one recording.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub output_file: PathBuf,
    pub frame_time: FrameTime,
    pub video_encoder: String,
    pub audio_encoder: String,
    pub sample_rate: u32,
    /// Bits per second. Zero selects constant-quality mode.
    pub bitrate: u64,
    /// 1..=10, only consulted when `bitrate` is zero.
    pub quality: u32,
    pub resolution: Option<VideoOutputSize>,
    pub enable_metrics: bool,
}

impl Parameters {
    pub fn audio_quality(&self) -> CaptureQuality {
        CaptureQuality::from_level(self.quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_resolution() {
        let size = VideoOutputSize::parse("1920x1080").unwrap();
        assert_eq!(size.width, 1920);
        assert_eq!(size.height, 1080);
    }

    #[test]
    fn rejects_zero_and_malformed_resolutions() {
        assert!(VideoOutputSize::parse("0x1080").is_err());
        assert!(VideoOutputSize::parse("1920").is_err());
        assert!(VideoOutputSize::parse("axb").is_err());
    }

    #[test]
    fn quality_levels_map_onto_audio_tiers() {
        assert_eq!(CaptureQuality::from_level(1), CaptureQuality::Minimum);
        assert_eq!(CaptureQuality::from_level(3), CaptureQuality::Low);
        assert_eq!(CaptureQuality::from_level(8), CaptureQuality::Medium);
    }
}
