/*!
    Time base arithmetic.
*/

use std::fmt;

pub const MICROS_PER_SECOND: i64 = 1_000_000;

/**
    A rational number, used for stream time bases and frame rates.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /**
        Returns the value as a float, or 0.0 for an undefined rational.
    */
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /**
        Convert a timestamp expressed in this time base to microseconds.

        Uses 128-bit intermediates with round-half-away-from-zero, so large
        timestamps in fine time bases do not overflow or drift.
    */
    pub fn rescale_to_micros(self, ts: i64) -> i64 {
        if self.den == 0 {
            return 0;
        }
        let num = ts as i128 * self.num as i128 * MICROS_PER_SECOND as i128;
        let den = self.den as i128;
        let half = den.abs() / 2;
        let rounded = if (num < 0) == (den < 0) {
            (num.abs() + half) / den.abs()
        } else {
            -((num.abs() + half) / den.abs())
        };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}
