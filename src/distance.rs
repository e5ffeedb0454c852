//! Squared Euclidean distance kernels for t-SNE.
//!
//! Affinities are calibrated on squared distances and the Student-t kernel
//! in the embedding works on squared distances too, so no square roots are
//! taken here. This module provides:
//!
//! - SIMD kernels for `f32` (8 lanes) and `f64` (4 lanes)
//! - A view-based entry point handling non-contiguous rows

use crate::float::TsneFloat;
use ndarray::ArrayView1;
use tracing::warn;
use wide::{f32x8, f64x4};

/// Computes the squared Euclidean distance between `f32` slices using SIMD.
///
/// Processes vectors in chunks of 8 elements and handles the remainder
/// sequentially.
///
/// # Panics
/// * In debug builds, if the slices have different lengths
pub fn simd_squared_euclidean_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(8);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(8);
    let b_remainder = b_chunks.remainder();

    let mut sum_sq = f32x8::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        let diff = f32x8::from(a_chunk) - f32x8::from(b_chunk);
        sum_sq += diff * diff;
    }

    let mut total_sum_sq: f32 = sum_sq.as_array_ref().iter().sum();
    for (a, b) in a_remainder.iter().zip(b_remainder) {
        let diff = a - b;
        total_sum_sq += diff * diff;
    }

    total_sum_sq
}

/// Computes the squared Euclidean distance between `f64` slices using SIMD.
///
/// Processes vectors in chunks of 4 elements and handles the remainder
/// sequentially.
///
/// # Panics
/// * In debug builds, if the slices have different lengths
pub fn simd_squared_euclidean_f64(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(4);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(4);
    let b_remainder = b_chunks.remainder();

    let mut sum_sq = f64x4::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        let a_lanes = f64x4::new([a_chunk[0], a_chunk[1], a_chunk[2], a_chunk[3]]);
        let b_lanes = f64x4::new([b_chunk[0], b_chunk[1], b_chunk[2], b_chunk[3]]);
        let diff = a_lanes - b_lanes;
        sum_sq += diff * diff;
    }

    let mut total_sum_sq: f64 = sum_sq.as_array_ref().iter().sum();
    for (a, b) in a_remainder.iter().zip(b_remainder) {
        let diff = a - b;
        total_sum_sq += diff * diff;
    }

    total_sum_sq
}

/// Computes the squared Euclidean distance between array views, using the
/// SIMD path when both views are contiguous.
///
/// Non-contiguous views are copied first, with a warning.
pub fn array_squared_distance<T: TsneFloat>(a: ArrayView1<T>, b: ArrayView1<T>) -> T {
    match (a.as_slice(), b.as_slice()) {
        (Some(a), Some(b)) => T::squared_distance(a, b),
        (Some(a), None) => {
            warn!("b is non-contiguous, requiring allocation to compute distance");
            T::squared_distance(a, &b.to_vec())
        }
        (None, Some(b)) => {
            warn!("a is non-contiguous, requiring allocation to compute distance");
            T::squared_distance(&a.to_vec(), b)
        }
        (None, None) => {
            warn!("both a and b are non-contiguous, requiring allocation to compute distance");
            T::squared_distance(&a.to_vec(), &b.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{array_squared_distance, simd_squared_euclidean_f32, simd_squared_euclidean_f64};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use quickcheck::{Arbitrary, Gen, TestResult};
    use quickcheck_macros::quickcheck;

    /// Pair of equal-length vectors with bounded, finite components.
    #[derive(Clone, Debug)]
    struct VecPair(Vec<f64>, Vec<f64>);

    impl Arbitrary for VecPair {
        fn arbitrary(g: &mut Gen) -> VecPair {
            let len = u8::arbitrary(g) as usize;
            let component = |g: &mut Gen| f64::from(i16::arbitrary(g)) / 64.0;
            let a: Vec<_> = (0..len).map(|_| component(g)).collect();
            let b: Vec<_> = (0..len).map(|_| component(g)).collect();
            VecPair(a, b)
        }
    }

    fn standard_squared_euclidean(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(a_i, b_i)| (a_i - b_i).powi(2)).sum()
    }

    #[test]
    fn test_known_distance() {
        let a = [1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let b = [0.0_f32; 9];
        assert_abs_diff_eq!(simd_squared_euclidean_f32(&a, &b), 285.0);
        let a64: Vec<f64> = a.iter().map(|&v| f64::from(v)).collect();
        assert_abs_diff_eq!(simd_squared_euclidean_f64(&a64, &[0.0; 9]), 285.0);
    }

    #[test]
    fn test_non_contiguous_views() {
        let m = array![[0.0_f64, 3.0], [4.0, 0.0]];
        // Columns of a row-major matrix are strided.
        let d = array_squared_distance(m.column(0), m.column(1));
        assert_abs_diff_eq!(d, 25.0);
    }

    #[quickcheck]
    fn non_negative(pair: VecPair) -> bool {
        let VecPair(a, b) = pair;
        simd_squared_euclidean_f64(&a, &b) >= 0.0
    }

    #[quickcheck]
    fn zero_when_equal(pair: VecPair) -> bool {
        let VecPair(a, _) = pair;
        simd_squared_euclidean_f64(&a, &a) == 0.0
    }

    #[quickcheck]
    fn correctness(pair: VecPair) -> TestResult {
        let VecPair(a, b) = pair;
        let simd_result = simd_squared_euclidean_f64(&a, &b);
        let standard_result = standard_squared_euclidean(&a, &b);
        let difference = (simd_result - standard_result).abs();

        if difference > 1e-9 * standard_result.max(1.0) {
            TestResult::error(format!("difference is {difference}"))
        } else {
            TestResult::passed()
        }
    }
}
