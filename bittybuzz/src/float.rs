use std::fmt;

use half::f16;

/// 16-bit script float.
///
/// Arithmetic is never done in this representation: operands are widened to
/// `f32`, computed, then narrowed back through [`Float16::from_f32`].
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Default, PartialEq, PartialOrd)]
pub struct Float16(f16);

impl Float16 {
    pub const ZERO: Self = Self(f16::ZERO);

    #[inline]
    pub fn from_f32(value: f32) -> Self {
        Self(f16::from_f32(value))
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        self.0.to_f32()
    }

    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Self(f16::from_bits(bits))
    }

    #[inline]
    pub const fn to_bits(self) -> u16 {
        self.0.to_bits()
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.to_f32() == 0.0
    }
}

impl From<f32> for Float16 {
    fn from(value: f32) -> Self {
        Self::from_f32(value)
    }
}

impl From<Float16> for f32 {
    fn from(value: Float16) -> Self {
        value.to_f32()
    }
}

impl fmt::Display for Float16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f32())
    }
}

/// Narrow a host float into its 16-bit encoding.
#[inline]
pub fn fromfloat(value: f32) -> u16 {
    Float16::from_f32(value).to_bits()
}

/// Widen a 16-bit encoding into a host float.
#[inline]
pub fn tofloat(bits: u16) -> f32 {
    Float16::from_bits(bits).to_f32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_integers_survive_round_trip() {
        for i in 0..10 {
            let scaled = i as f32 * 1.0;
            assert_eq!(tofloat(fromfloat(scaled)), scaled);
        }
    }

    #[test]
    fn precision_is_lost_past_eleven_bits() {
        // 2049 is not representable with a 10-bit mantissa
        assert_eq!(tofloat(fromfloat(2049.0)), 2048.0);
    }

    #[test]
    fn zero_detection_covers_negative_zero() {
        assert!(Float16::from_f32(-0.0).is_zero());
        assert!(!Float16::from_f32(0.5).is_zero());
    }
}
