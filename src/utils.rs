use ffmpeg_next::Rational;

pub const TIME_UNIT_NS: u64 = 1_000_000_000;

const NS_PER_MS: u64 = 1_000_000;

/// Target inter-frame interval in nanoseconds. Non-zero by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTime(u64);

impl FrameTime {
    pub fn new(nanoseconds: u64) -> Self {
        debug_assert!(nanoseconds > 0);
        Self(nanoseconds)
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(TIME_UNIT_NS / u64::from(fps))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Interval in whole milliseconds, rounded to nearest.
    pub fn value_in_milliseconds(&self) -> u64 {
        (self.0 + NS_PER_MS / 2) / NS_PER_MS
    }

    pub fn fps(&self) -> f32 {
        TIME_UNIT_NS as f32 / self.0 as f32
    }

    /// Frames-per-second as a rational, suitable for the encoder context.
    pub fn fps_rational(&self) -> Rational {
        Rational::new((TIME_UNIT_NS / self.0) as i32, 1)
    }

    /// Drops the sub-millisecond component. Timer slack makes anything finer
    /// unreachable in practice, so this is the default unless the user asked
    /// for strict frame timing.
    pub fn truncate_to_millisecond(&self) -> Self {
        Self::new((self.0 / NS_PER_MS).max(1) * NS_PER_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixty_fps_is_a_sixtieth_of_a_second() {
        let ft = FrameTime::from_fps(60);
        assert_eq!(ft.value(), 16_666_666);
        assert_eq!(ft.fps_rational(), Rational::new(60, 1));
    }

    #[test]
    fn truncation_drops_sub_millisecond_precision() {
        let ft = FrameTime::from_fps(60).truncate_to_millisecond();
        assert_eq!(ft.value(), 16_000_000);
        assert_eq!(ft.value_in_milliseconds(), 16);
    }

    #[test]
    fn rounds_milliseconds_to_nearest() {
        assert_eq!(FrameTime::new(16_666_666).value_in_milliseconds(), 17);
        assert_eq!(FrameTime::new(16_400_000).value_in_milliseconds(), 16);
    }
}
