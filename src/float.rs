//! Floating-point element types supported by the embedding engine.
//!
//! Every component is generic over [`TsneFloat`], which is implemented for
//! `f32` and `f64`. The precision is chosen by the caller through the element
//! type of the input matrix.

use crate::distance::{simd_squared_euclidean_f32, simd_squared_euclidean_f64};
use ndarray::NdFloat;
use std::cmp::Ordering;
use std::iter::Sum;

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Element type used for coordinates, affinities and gradients.
///
/// Sealed: implemented for `f32` and `f64` only.
pub trait TsneFloat: NdFloat + Sum + private::Sealed {
    /// Converts an `f64` constant, rounding to the nearest representable value.
    fn cast(value: f64) -> Self;

    /// Widens to `f64` without loss.
    fn widen(self) -> f64;

    /// Narrows to `f32`, as used by the approximate neighbor index.
    fn narrow(self) -> f32;

    /// IEEE 754 total ordering.
    fn total_order(&self, other: &Self) -> Ordering;

    /// Squared Euclidean distance between two equal-length slices.
    fn squared_distance(a: &[Self], b: &[Self]) -> Self;

    /// Converts a count, as used when averaging.
    #[allow(clippy::cast_precision_loss)]
    fn from_usize(value: usize) -> Self {
        Self::cast(value as f64)
    }
}

impl TsneFloat for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn cast(value: f64) -> Self {
        value as f32
    }

    fn widen(self) -> f64 {
        f64::from(self)
    }

    fn narrow(self) -> f32 {
        self
    }

    fn total_order(&self, other: &Self) -> Ordering {
        f32::total_cmp(self, other)
    }

    fn squared_distance(a: &[Self], b: &[Self]) -> Self {
        simd_squared_euclidean_f32(a, b)
    }
}

impl TsneFloat for f64 {
    fn cast(value: f64) -> Self {
        value
    }

    fn widen(self) -> f64 {
        self
    }

    #[allow(clippy::cast_possible_truncation)]
    fn narrow(self) -> f32 {
        self as f32
    }

    fn total_order(&self, other: &Self) -> Ordering {
        f64::total_cmp(self, other)
    }

    fn squared_distance(a: &[Self], b: &[Self]) -> Self {
        simd_squared_euclidean_f64(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::TsneFloat;
    use std::cmp::Ordering;

    #[test]
    fn test_cast_round_trips_constants() {
        assert_eq!(<f32 as TsneFloat>::cast(0.5), 0.5_f32);
        assert_eq!(<f64 as TsneFloat>::cast(0.8), 0.8_f64);
        assert_eq!(<f32 as TsneFloat>::from_usize(12), 12.0_f32);
        assert_eq!(0.25_f32.widen(), 0.25_f64);
    }

    #[test]
    fn test_total_order_puts_nan_last() {
        assert_eq!(TsneFloat::total_order(&1.0_f64, &f64::NAN), Ordering::Less);
        assert_eq!(TsneFloat::total_order(&2.0_f32, &1.0_f32), Ordering::Greater);
    }
}
