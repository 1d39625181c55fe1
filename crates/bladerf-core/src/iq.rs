//! # SC16 Q11 Sample Conversion
//!
//! The transceiver moves samples as signed 16-bit integers with 11
//! fractional bits. A full-scale value of 2048 maps to 1.0.
//!
//! ```text
//! interleaved:  [I0, Q0, I1, Q1, ...]   i16, little-endian on the wire
//! complex:      I + jQ                  f32, I/2048 + jQ/2048
//! ```
//!
//! Conversion to float is left to callers; the transfer engines only deal in
//! raw integers.

use crate::types::Sc16;
use num_complex::Complex32;

/// Q11 full scale.
pub const SC16_SCALE: f32 = 2048.0;

/// Largest representable Q11 magnitude on the positive side.
const SC16_MAX: f32 = 2047.0;
const SC16_MIN: f32 = -2048.0;

#[inline]
fn to_q11(value: f32) -> i16 {
    if value.is_nan() {
        return 0;
    }
    (value * SC16_SCALE).round().clamp(SC16_MIN, SC16_MAX) as i16
}

/// Convert one sample to a normalized complex value.
#[inline]
pub fn sc16_to_complex(sample: Sc16) -> Complex32 {
    Complex32::new(sample.re as f32 / SC16_SCALE, sample.im as f32 / SC16_SCALE)
}

/// Convert a normalized complex value to SC16 Q11, rounding and saturating.
#[inline]
pub fn complex_to_sc16(value: Complex32) -> Sc16 {
    Sc16::new(to_q11(value.re), to_q11(value.im))
}

/// Convert an interleaved I/Q slice to complex values. A trailing odd entry
/// is ignored.
pub fn int16_to_complex(raw: &[i16]) -> Vec<Complex32> {
    raw.chunks_exact(2)
        .map(|pair| Complex32::new(pair[0] as f32 / SC16_SCALE, pair[1] as f32 / SC16_SCALE))
        .collect()
}

/// Convert complex values to an interleaved I/Q vector.
pub fn complex_to_int16(samples: &[Complex32]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.push(to_q11(s.re));
        out.push(to_q11(s.im));
    }
    out
}

/// Flatten samples into `[I0, Q0, I1, Q1, ...]`.
pub fn interleave(samples: &[Sc16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.push(s.re);
        out.push(s.im);
    }
    out
}

/// Pair up an interleaved slice. A trailing odd entry is ignored.
pub fn deinterleave(raw: &[i16]) -> Vec<Sc16> {
    raw.chunks_exact(2).map(|pair| Sc16::new(pair[0], pair[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scale() {
        let c = sc16_to_complex(Sc16::new(2048, -2048));
        assert!((c.re - 1.0).abs() < 1e-6);
        assert!((c.im + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_round_trip_within_one_lsb() {
        let step = 1.0 / SC16_SCALE;
        let mut x = -1.0f32;
        while x < 1.0 - step {
            let value = Complex32::new(x, -x * 0.5);
            let back = int16_to_complex(&complex_to_int16(&[value]));
            assert_eq!(back.len(), 1);
            assert!((back[0].re - value.re).abs() <= step, "re {} -> {}", value.re, back[0].re);
            assert!((back[0].im - value.im).abs() <= step, "im {} -> {}", value.im, back[0].im);
            x += 0.0137;
        }
    }

    #[test]
    fn test_saturation() {
        let s = complex_to_sc16(Complex32::new(3.0, -3.0));
        assert_eq!(s, Sc16::new(2047, -2048));
        let s = complex_to_sc16(Complex32::new(f32::NAN, 0.5));
        assert_eq!(s, Sc16::new(0, 1024));
    }

    #[test]
    fn test_interleave_order() {
        let samples = [Sc16::new(1, 2), Sc16::new(3, 4)];
        let raw = interleave(&samples);
        assert_eq!(raw, vec![1, 2, 3, 4]);
        assert_eq!(deinterleave(&raw), samples.to_vec());
        assert_eq!(deinterleave(&[5, 6, 7]), vec![Sc16::new(5, 6)]);
    }
}
