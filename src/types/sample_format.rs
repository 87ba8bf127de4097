use ffmpeg_next::format::sample::Type as SampleType;
use ffmpeg_next::format::Sample as AvSample;
use pipewire::spa::param::audio::AudioFormat as SpaAudioFormat;

use crate::types::error::{Error, Result};

/// Recognised PCM layouts, tagged by planarity. Planar formats occupy one
/// buffer per channel; interleaved formats pack every channel into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8Interleaved,
    S16Interleaved,
    S32Interleaved,
    FloatInterleaved,
    DoubleInterleaved,
    S64Interleaved,
    U8Planar,
    S16Planar,
    S32Planar,
    FloatPlanar,
    DoublePlanar,
    S64Planar,
}

impl SampleFormat {
    pub fn is_interleaved(&self) -> bool {
        matches!(
            self,
            SampleFormat::U8Interleaved
                | SampleFormat::S16Interleaved
                | SampleFormat::S32Interleaved
                | SampleFormat::FloatInterleaved
                | SampleFormat::DoubleInterleaved
                | SampleFormat::S64Interleaved
        )
    }

    pub fn is_planar(&self) -> bool {
        !self.is_interleaved()
    }

    /// Size of one sample of one channel, in bytes.
    pub fn sample_size(&self) -> usize {
        match self {
            SampleFormat::U8Interleaved | SampleFormat::U8Planar => 1,
            SampleFormat::S16Interleaved | SampleFormat::S16Planar => 2,
            SampleFormat::S32Interleaved
            | SampleFormat::S32Planar
            | SampleFormat::FloatInterleaved
            | SampleFormat::FloatPlanar => 4,
            SampleFormat::DoubleInterleaved
            | SampleFormat::DoublePlanar
            | SampleFormat::S64Interleaved
            | SampleFormat::S64Planar => 8,
        }
    }

    pub fn to_libav(&self) -> AvSample {
        match self {
            SampleFormat::U8Interleaved => AvSample::U8(SampleType::Packed),
            SampleFormat::S16Interleaved => AvSample::I16(SampleType::Packed),
            SampleFormat::S32Interleaved => AvSample::I32(SampleType::Packed),
            SampleFormat::FloatInterleaved => AvSample::F32(SampleType::Packed),
            SampleFormat::DoubleInterleaved => AvSample::F64(SampleType::Packed),
            SampleFormat::S64Interleaved => AvSample::I64(SampleType::Packed),
            SampleFormat::U8Planar => AvSample::U8(SampleType::Planar),
            SampleFormat::S16Planar => AvSample::I16(SampleType::Planar),
            SampleFormat::S32Planar => AvSample::I32(SampleType::Planar),
            SampleFormat::FloatPlanar => AvSample::F32(SampleType::Planar),
            SampleFormat::DoublePlanar => AvSample::F64(SampleType::Planar),
            SampleFormat::S64Planar => AvSample::I64(SampleType::Planar),
        }
    }

    pub fn from_libav(format: AvSample) -> Option<Self> {
        match format {
            AvSample::U8(SampleType::Packed) => Some(SampleFormat::U8Interleaved),
            AvSample::I16(SampleType::Packed) => Some(SampleFormat::S16Interleaved),
            AvSample::I32(SampleType::Packed) => Some(SampleFormat::S32Interleaved),
            AvSample::F32(SampleType::Packed) => Some(SampleFormat::FloatInterleaved),
            AvSample::F64(SampleType::Packed) => Some(SampleFormat::DoubleInterleaved),
            AvSample::I64(SampleType::Packed) => Some(SampleFormat::S64Interleaved),
            AvSample::U8(SampleType::Planar) => Some(SampleFormat::U8Planar),
            AvSample::I16(SampleType::Planar) => Some(SampleFormat::S16Planar),
            AvSample::I32(SampleType::Planar) => Some(SampleFormat::S32Planar),
            AvSample::F32(SampleType::Planar) => Some(SampleFormat::FloatPlanar),
            AvSample::F64(SampleType::Planar) => Some(SampleFormat::DoublePlanar),
            AvSample::I64(SampleType::Planar) => Some(SampleFormat::S64Planar),
            AvSample::None => None,
        }
    }

    /// The matching PipeWire SPA raw format. S64 has no SPA counterpart.
    pub fn to_spa(&self) -> Result<SpaAudioFormat> {
        match self {
            SampleFormat::U8Interleaved => Ok(SpaAudioFormat::U8),
            SampleFormat::S16Interleaved => Ok(SpaAudioFormat::S16LE),
            SampleFormat::S32Interleaved => Ok(SpaAudioFormat::S32LE),
            SampleFormat::FloatInterleaved => Ok(SpaAudioFormat::F32LE),
            SampleFormat::DoubleInterleaved => Ok(SpaAudioFormat::F64LE),
            SampleFormat::U8Planar => Ok(SpaAudioFormat::U8P),
            SampleFormat::S16Planar => Ok(SpaAudioFormat::S16P),
            SampleFormat::S32Planar => Ok(SpaAudioFormat::S32P),
            SampleFormat::FloatPlanar => Ok(SpaAudioFormat::F32P),
            SampleFormat::DoublePlanar => Ok(SpaAudioFormat::F64P),
            SampleFormat::S64Interleaved | SampleFormat::S64Planar => Err(Error::Config(
                "no PipeWire representation for 64-bit integer samples".into(),
            )),
        }
    }
}

/// Formats the codec advertises that we also recognise, in the codec's
/// preference order. Empty when the codec lists nothing we can use.
pub fn find_supported_formats(codec: &ffmpeg_next::codec::Audio) -> Vec<SampleFormat> {
    codec
        .formats()
        .map(|formats| formats.filter_map(SampleFormat::from_libav).collect())
        .unwrap_or_default()
}

pub fn is_sample_rate_supported(codec: &ffmpeg_next::codec::Audio, requested: u32) -> bool {
    match codec.rates() {
        // No advertised list means the codec accepts any rate
        None => true,
        Some(mut rates) => rates.any(|rate| rate == requested as i32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planarity_determines_buffer_layout() {
        assert!(SampleFormat::FloatPlanar.is_planar());
        assert!(SampleFormat::FloatInterleaved.is_interleaved());
        assert!(!SampleFormat::S16Planar.is_interleaved());
    }

    #[test]
    fn sample_sizes_match_their_width() {
        assert_eq!(SampleFormat::U8Planar.sample_size(), 1);
        assert_eq!(SampleFormat::S16Interleaved.sample_size(), 2);
        assert_eq!(SampleFormat::FloatPlanar.sample_size(), 4);
        assert_eq!(SampleFormat::S64Planar.sample_size(), 8);
    }

    #[test]
    fn libav_conversion_round_trips() {
        let fmt = SampleFormat::FloatPlanar;
        assert_eq!(SampleFormat::from_libav(fmt.to_libav()), Some(fmt));
    }

    #[test]
    fn s64_has_no_pipewire_format() {
        assert!(SampleFormat::S64Planar.to_spa().is_err());
        assert!(SampleFormat::FloatPlanar.to_spa().is_ok());
    }
}
