//! Input-space affinities for t-SNE.
//!
//! For every point a Gaussian kernel over its nearest neighbors is calibrated
//! so that the Shannon entropy of the resulting conditional distribution
//! equals `log2(perplexity)`. The conditional distributions are then
//! symmetrized into a sparse joint distribution P that sums to one.
//!
//! The bandwidth search is independent per point and runs in parallel. A
//! point whose search does not converge keeps the last bandwidth tried; its
//! index is reported so callers can treat it as a data-quality signal.

use crate::float::TsneFloat;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use std::f64::consts::LN_2;
use tracing::{debug, warn};

/// Maximum number of bandwidth candidates tried per point.
pub const MAX_SEARCH_STEPS: usize = 50;

/// Entropy tolerance, in bits.
pub const ENTROPY_TOLERANCE: f64 = 1e-5;

/// Outcome of the bandwidth search for one point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bandwidth<T> {
    /// Kernel precision (inverse of twice the variance)
    pub beta: T,

    /// Entropy of the calibrated conditional distribution, in bits
    pub entropy: T,

    /// Whether the entropy reached the target within tolerance
    pub converged: bool,
}

/// Calibrates one point's Gaussian kernel to the target entropy.
///
/// `sq_distances` are squared distances to the point's neighbors. On return,
/// `probabilities` holds the conditional distribution `p(j|i)` over those
/// neighbors, summing to one.
///
/// Distances are shifted by their minimum before exponentiation. The entropy
/// is invariant to the shift and the largest kernel value becomes exactly
/// one, so the normalizer never underflows.
///
/// # Panics
/// * In debug builds, if the slices have different lengths
pub fn calibrate_bandwidth<T: TsneFloat>(
    sq_distances: &[T],
    target_entropy: T,
    probabilities: &mut [T],
) -> Bandwidth<T> {
    debug_assert_eq!(sq_distances.len(), probabilities.len());

    if sq_distances.is_empty() {
        return Bandwidth {
            beta: T::one(),
            entropy: T::zero(),
            converged: target_entropy.abs() < T::cast(ENTROPY_TOLERANCE),
        };
    }

    let min_distance = sq_distances
        .iter()
        .copied()
        .fold(T::infinity(), |acc, d| acc.min(d));
    let mean_shifted = sq_distances
        .iter()
        .fold(T::zero(), |acc, &d| acc + (d - min_distance))
        / T::from_usize(sq_distances.len());

    let tolerance = T::cast(ENTROPY_TOLERANCE);
    let two = T::cast(2.0);
    // Subnormal distances overflow the reciprocal; β stays finite so that
    // `β · 0` is never NaN.
    let max_beta = T::max_value();
    let mut beta = if mean_shifted > T::zero() {
        mean_shifted.recip().min(max_beta)
    } else {
        T::one()
    };
    let mut beta_min: Option<T> = None;
    let mut beta_max: Option<T> = None;
    let mut converged = false;

    for _ in 0..MAX_SEARCH_STEPS {
        let entropy = kernel_entropy(sq_distances, min_distance, beta, probabilities);
        let difference = entropy - target_entropy;

        if difference.abs() < tolerance {
            converged = true;
            break;
        }

        // Entropy falls as beta grows.
        if difference > T::zero() {
            if beta >= max_beta {
                break;
            }
            beta_min = Some(beta);
            beta = beta_max.map_or((beta * two).min(max_beta), |hi| beta + (hi - beta) / two);
        } else {
            beta_max = Some(beta);
            beta = beta_min.map_or(beta / two, |lo| lo + (beta - lo) / two);
        }
    }

    let entropy = kernel_entropy(sq_distances, min_distance, beta, probabilities);
    Bandwidth {
        beta,
        entropy,
        converged,
    }
}

/// Fills `probabilities` with the normalized kernel at `beta` and returns the
/// entropy in bits.
fn kernel_entropy<T: TsneFloat>(
    sq_distances: &[T],
    min_distance: T,
    beta: T,
    probabilities: &mut [T],
) -> T {
    let mut sum = T::zero();
    let mut weighted = T::zero();
    for (p, &d) in probabilities.iter_mut().zip(sq_distances) {
        let shifted = d - min_distance;
        *p = (-beta * shifted).exp();
        sum += *p;
        weighted += shifted * *p;
    }

    for p in probabilities.iter_mut() {
        *p /= sum;
    }

    (sum.ln() + beta * weighted / sum) / T::cast(LN_2)
}

/// Per-point conditional distributions over nearest neighbors.
#[derive(Clone, Debug)]
pub struct ConditionalAffinities<T> {
    /// Neighbor indices, one row per point
    pub neighbors: Array2<u32>,

    /// `p(j|i)` for each neighbor; every row sums to one
    pub probabilities: Array2<T>,

    /// Calibrated kernel precision per point
    pub betas: Vec<T>,

    /// Points whose bandwidth search did not reach the target entropy
    pub unconverged: Vec<usize>,
}

/// Computes conditional affinities `p(j|i)` from k-nearest-neighbor results.
///
/// # Arguments
/// * `neighbors` - `(n, k)` neighbor indices
/// * `sq_distances` - `(n, k)` squared distances matching `neighbors`
/// * `perplexity` - Target perplexity
pub fn conditional_affinities<T: TsneFloat>(
    neighbors: Array2<u32>,
    sq_distances: ArrayView2<T>,
    perplexity: T,
) -> ConditionalAffinities<T> {
    let target_entropy = perplexity.log2();
    let mut probabilities = Array2::<T>::zeros(sq_distances.dim());
    let sq_distances = sq_distances.as_standard_layout();

    let bandwidths: Vec<Bandwidth<T>> = probabilities
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(sq_distances.axis_iter(Axis(0)))
        .map(|(mut row, distances)| {
            let distances = distances.to_vec();
            let mut buffer = vec![T::zero(); distances.len()];
            let bandwidth = calibrate_bandwidth(&distances, target_entropy, &mut buffer);
            for (p, value) in row.iter_mut().zip(buffer) {
                *p = value;
            }
            bandwidth
        })
        .collect();

    let unconverged: Vec<usize> = bandwidths
        .iter()
        .enumerate()
        .filter_map(|(i, b)| (!b.converged).then_some(i))
        .collect();

    if !unconverged.is_empty() {
        warn!(
            "Bandwidth search did not reach perplexity {} for {} of {} points; using best-effort bandwidths",
            perplexity,
            unconverged.len(),
            bandwidths.len()
        );
    }

    let n = bandwidths.len().max(1);
    let mean_sigma = bandwidths
        .iter()
        .map(|b| (T::one() / b.beta).sqrt())
        .fold(T::zero(), |acc, s| acc + s)
        / T::from_usize(n);
    debug!("Mean kernel width: {}", mean_sigma);

    ConditionalAffinities {
        neighbors,
        probabilities,
        betas: bandwidths.iter().map(|b| b.beta).collect(),
        unconverged,
    }
}

/// Symmetric joint distribution P in compressed sparse row form.
///
/// Invariants: symmetric, zero diagonal, strictly positive stored values,
/// total sum one.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseAffinities<T> {
    offsets: Vec<usize>,
    columns: Vec<u32>,
    values: Vec<T>,
}

impl<T: TsneFloat> SparseAffinities<T> {
    /// Symmetrizes conditional affinities: `P_ij = (p(j|i) + p(i|j)) / 2N`.
    ///
    /// The result is renormalized by its total so it sums to one up to
    /// rounding.
    pub fn symmetrize(conditional: &ConditionalAffinities<T>) -> Self {
        let n = conditional.neighbors.nrows();
        let mut triplets: Vec<(u32, u32, T)> =
            Vec::with_capacity(2 * conditional.neighbors.len());

        for (((i, _), &j), &p) in conditional
            .neighbors
            .indexed_iter()
            .zip(conditional.probabilities.iter())
        {
            let i = i as u32;
            if i == j || p <= T::zero() {
                continue;
            }
            triplets.push((i, j, p));
            triplets.push((j, i, p));
        }

        triplets.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut offsets = vec![0; n + 1];
        let mut columns = Vec::with_capacity(triplets.len());
        let mut values: Vec<T> = Vec::with_capacity(triplets.len());
        let mut last: Option<(u32, u32)> = None;

        for (i, j, p) in triplets {
            match (last, values.last_mut()) {
                (Some(key), Some(value)) if key == (i, j) => *value += p,
                _ => {
                    columns.push(j);
                    values.push(p);
                    offsets[i as usize + 1] += 1;
                    last = Some((i, j));
                }
            }
        }

        for i in 0..n {
            offsets[i + 1] += offsets[i];
        }

        let total = values.iter().fold(T::zero(), |acc, &v| acc + v);
        if total > T::zero() {
            for value in &mut values {
                *value /= total;
            }
        }

        Self {
            offsets,
            columns,
            values,
        }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Whether the distribution covers no points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored (nonzero) entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Iterates over `(j, P_ij)` for row `i`.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let range = self.offsets[i]..self.offsets[i + 1];
        self.columns[range.clone()]
            .iter()
            .zip(&self.values[range])
            .map(|(&j, &p)| (j as usize, p))
    }

    /// Looks up `P_ij`, returning zero for entries that are not stored.
    pub fn get(&self, i: usize, j: usize) -> T {
        let range = self.offsets[i]..self.offsets[i + 1];
        self.columns[range.clone()]
            .binary_search(&(j as u32))
            .map_or(T::zero(), |position| self.values[range.start + position])
    }

    /// Sum of all stored entries.
    pub fn total(&self) -> T {
        self.values.iter().fold(T::zero(), |acc, &v| acc + v)
    }

    /// Expands to a dense `N × N` matrix.
    pub fn to_dense(&self) -> Array2<T> {
        let n = self.len();
        let mut dense = Array2::zeros((n, n));
        for i in 0..n {
            for (j, p) in self.row(i) {
                dense[[i, j]] = p;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knn::find_k_nearest_neighbors;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::{array, Array2};
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn affinities_for(data: &Array2<f64>, k: usize, perplexity: f64) -> SparseAffinities<f64> {
        let (neighbors, distances) = find_k_nearest_neighbors(data.view(), k);
        let conditional = conditional_affinities(neighbors, distances.view(), perplexity);
        SparseAffinities::symmetrize(&conditional)
    }

    #[test]
    fn test_bandwidth_reaches_target_entropy() {
        let distances = [0.5_f64, 1.0, 2.0, 4.0, 8.0, 9.0, 12.0];
        let mut p = [0.0; 7];
        let bandwidth = calibrate_bandwidth(&distances, 2.0_f64.log2() * 1.5, &mut p);

        assert!(bandwidth.converged);
        assert_abs_diff_eq!(bandwidth.entropy, 1.5, epsilon = 1e-5);
        assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(p.windows(2).all(|w| w[0] >= w[1]), "closer neighbors weigh more");
    }

    #[test]
    fn test_bandwidth_survives_large_distances() {
        // exp(-d) underflows for these without the shift.
        let distances = [1.0e4_f32, 1.0e4 + 1.0, 1.0e4 + 2.0, 1.0e4 + 5.0];
        let mut p = [0.0_f32; 4];
        let bandwidth = calibrate_bandwidth(&distances, 1.0, &mut p);
        assert!(bandwidth.converged);
        assert!(p.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(p.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_unreachable_entropy_falls_back() {
        // Equal distances give a uniform distribution at every bandwidth, so
        // one bit of entropy is unreachable with four neighbors.
        let distances = [3.0_f64; 4];
        let mut p = [0.0; 4];
        let bandwidth = calibrate_bandwidth(&distances, 1.0, &mut p);
        assert!(!bandwidth.converged);
        assert!(bandwidth.beta.is_finite());
        for &v in &p {
            assert_relative_eq!(v, 0.25);
        }
    }

    #[test]
    fn test_subnormal_distances_keep_finite_bandwidth() {
        let distances = [0.0_f64, 1e-320, 4e-320, 9e-320];
        let mut p = [0.0; 4];
        let bandwidth = calibrate_bandwidth(&distances, 1.0, &mut p);
        assert!(bandwidth.beta.is_finite());
        assert!(bandwidth.entropy.is_finite());
        assert!(p.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_near_duplicate_points_are_finite() {
        let data = array![[0.0, 0.0], [1e-160, 0.0], [2e-160, 0.0], [3e-160, 0.0], [4e-160, 0.0]];
        let p = affinities_for(&data, 4, 2.0);
        assert!(p.to_dense().iter().all(|v| v.is_finite() && *v >= 0.0));
        assert_abs_diff_eq!(p.total(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_conditional_rows_sum_to_one() {
        let data = Array2::from_shape_fn((40, 5), |(i, j)| ((i * 7 + j * 3) % 11) as f64 * 0.3);
        let (neighbors, distances) = find_k_nearest_neighbors(data.view(), 15);
        let conditional = conditional_affinities(neighbors, distances.view(), 5.0);
        for row in conditional.probabilities.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_joint_distribution_invariants() {
        let data = array![
            [0.0, 0.0, 0.0],
            [0.1, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [10.1, 0.0, 0.0]
        ];
        let p = affinities_for(&data, 3, 2.0);
        let dense = p.to_dense();

        assert_abs_diff_eq!(p.total(), 1.0, epsilon = 1e-12);
        for i in 0..4 {
            assert_eq!(dense[[i, i]], 0.0);
            for j in 0..4 {
                assert_abs_diff_eq!(dense[[i, j]], dense[[j, i]], epsilon = 1e-15);
            }
        }
        assert!(p.get(0, 1) > p.get(0, 2), "pair members are more similar");
        assert!(p.get(2, 3) > p.get(1, 3));
    }

    #[test]
    fn test_symmetrize_merges_mutual_neighbors() {
        let conditional = ConditionalAffinities {
            neighbors: array![[1_u32], [0], [0]],
            probabilities: array![[1.0_f64], [1.0], [1.0]],
            betas: vec![1.0; 3],
            unconverged: Vec::new(),
        };
        let p = SparseAffinities::symmetrize(&conditional);

        assert_eq!(p.nnz(), 4);
        assert_relative_eq!(p.get(0, 1), 2.0 / 6.0);
        assert_relative_eq!(p.get(0, 2), 1.0 / 6.0);
        assert_relative_eq!(p.get(2, 0), 1.0 / 6.0);
        assert_eq!(p.get(1, 2), 0.0);
    }

    #[test]
    fn test_repeated_runs_are_bit_identical() {
        let data = Array2::from_shape_fn((60, 4), |(i, j)| ((i * 13 + j * 5) % 17) as f64 / 3.0);
        let first = affinities_for(&data, 20, 6.0);
        let second = affinities_for(&data, 20, 6.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_points_are_finite() {
        let data = array![[1.0, 1.0], [1.0, 1.0], [0.0, 2.0], [3.0, 0.5], [2.0, 2.0]];
        let p = affinities_for(&data, 4, 1.5);
        assert!(p.to_dense().iter().all(|v| v.is_finite() && *v >= 0.0));
        assert_abs_diff_eq!(p.total(), 1.0, epsilon = 1e-12);
    }

    /// A small random point cloud with bounded coordinates.
    #[derive(Clone, Debug)]
    struct Cloud(Array2<f64>);

    impl Arbitrary for Cloud {
        fn arbitrary(g: &mut Gen) -> Cloud {
            let n = 5 + usize::arbitrary(g) % 30;
            let d = 1 + usize::arbitrary(g) % 4;
            Cloud(Array2::from_shape_fn((n, d), |_| {
                f64::from(i8::arbitrary(g)) / 16.0
            }))
        }
    }

    #[quickcheck]
    fn joint_is_symmetric_and_normalized(cloud: Cloud) -> bool {
        let Cloud(data) = cloud;
        let n = data.nrows();
        let p = affinities_for(&data, n - 1, 1.5);
        let dense = p.to_dense();

        let symmetric = (0..n).all(|i| (0..n).all(|j| (dense[[i, j]] - dense[[j, i]]).abs() < 1e-12));
        let diagonal_free = (0..n).all(|i| dense[[i, i]] == 0.0);
        symmetric && diagonal_free && (p.total() - 1.0).abs() < 1e-9
    }
}
