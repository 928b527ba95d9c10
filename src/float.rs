//! Float trait abstraction for f32/f64 support.
//!
//! The element precision of a run is chosen once, through the type parameter of the
//! estimator. Every numeric module is generic over [`DeconvFloat`].

use ndarray::ScalarOperand;
use num_traits::{Float, FromPrimitive, NumAssign};
use rustfft::FftNum;
use std::fmt::{Debug, Display};
use std::iter::Sum;

/// Floating point types the deconvolution engine can run in.
///
/// Combines the bounds needed by the transform backend (`FftNum`), ndarray scalar
/// arithmetic and the data-parallel kernels.
pub trait DeconvFloat:
    Float
    + FftNum
    + FromPrimitive
    + NumAssign
    + ScalarOperand
    + Sum
    + Default
    + Debug
    + Display
    + Send
    + Sync
    + 'static
{
    /// Default epsilon guard for denominators and the noise floor.
    const DEFAULT_EPSILON: Self;

    /// Create a value from an f64 constant.
    fn from_f64_c(val: f64) -> Self;

    /// Create a value from a usize constant.
    fn usize_as(val: usize) -> Self;

    /// Widen to f64, for logging and metrics.
    fn as_f64(self) -> f64;
}

impl DeconvFloat for f32 {
    const DEFAULT_EPSILON: Self = 1e-4;

    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val as f32
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl DeconvFloat for f64 {
    const DEFAULT_EPSILON: Self = 1e-4;

    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f64
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_conversions() {
        let val: f32 = DeconvFloat::from_f64_c(0.25);
        assert_eq!(val, 0.25f32);
        assert_eq!(<f32 as DeconvFloat>::usize_as(42), 42.0f32);
        assert_eq!(1.5f32.as_f64(), 1.5f64);
    }

    #[test]
    fn test_f64_conversions() {
        let val: f64 = DeconvFloat::from_f64_c(std::f64::consts::PI);
        assert_eq!(val, std::f64::consts::PI);
        assert_eq!(<f64 as DeconvFloat>::usize_as(7), 7.0);
    }

    #[test]
    fn test_default_epsilon() {
        assert_eq!(f32::DEFAULT_EPSILON, 1e-4f32);
        assert_eq!(f64::DEFAULT_EPSILON, 1e-4f64);
    }
}
