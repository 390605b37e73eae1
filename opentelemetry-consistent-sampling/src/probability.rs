//! Decomposition of a sampling probability into power-of-two sampling rates.

use crate::tracestate::MAX_RANDOMNESS_VALUE;

/// Probabilities below this value cannot be expressed with a threshold
/// exponent in `[0, 62]` and collapse to the never-sample split.
const MIN_PROBABILITY: f64 = 2.168_404_344_971_009e-19; // 2^-62

/// A sampling probability decomposed into the two adjacent power-of-two
/// sampling rates that bracket it.
///
/// A decision made with threshold exponent `p` keeps the `2^-p` fraction of
/// traces whose randomness value is at least `p`. Arbitrary probabilities are
/// reached by mixing the two bracketing exponents: each decision uses
/// [`p_ceil`](Self::p_ceil) with probability
/// [`p_ceil_probability`](Self::p_ceil_probability) and
/// [`p_floor`](Self::p_floor) otherwise, so the long-run sampling rate equals
/// the configured probability while every individual decision still uses a
/// power-of-two rate that downstream samplers can reason about.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplitProbability {
    /// Exponent of the bracketing rate that keeps fewer spans. 63 when the
    /// probability is too small to represent.
    pub p_floor: u8,
    /// Exponent of the bracketing rate that keeps more spans. `-1` when the
    /// probability is exactly one.
    pub p_ceil: i8,
    /// Chance of a decision using `p_ceil` rather than `p_floor`.
    pub p_ceil_probability: f64,
}

impl SplitProbability {
    /// Decompose `probability` into its bracketing exponents.
    ///
    /// The caller is responsible for ensuring `probability` lies in
    /// `[0.0, 1.0]`.
    pub fn new(probability: f64) -> Self {
        if probability < MIN_PROBABILITY {
            return SplitProbability {
                p_floor: 63,
                p_ceil: 0,
                p_ceil_probability: 0.0,
            };
        }

        // binary exponent e with probability = m * 2^e and m in [0.5, 1)
        let e = ((probability.to_bits() >> 52) & 0x7ff) as i32 - 1022;
        let p_floor = (1 - e) as u8;
        let p_ceil = p_floor as i8 - 1;
        let floor = 2f64.powi(-(p_floor as i32));
        let ceil = 2f64.powi(-(p_ceil as i32));
        SplitProbability {
            p_floor,
            p_ceil,
            p_ceil_probability: (probability - floor) / (ceil - floor),
        }
    }

    /// True when no trace can ever pass this split, whatever its randomness
    /// value.
    pub fn never_samples(&self) -> bool {
        self.p_floor > MAX_RANDOMNESS_VALUE
    }

    /// Threshold exponent selected by a uniform draw from `[0.0, 1.0)`.
    pub fn exponent(&self, draw: f64) -> u8 {
        if self.p_ceil >= 0 && draw < self.p_ceil_probability {
            self.p_ceil as u8
        } else {
            self.p_floor
        }
    }
}
