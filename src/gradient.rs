//! t-SNE gradient and cost.
//!
//! The gradient of KL(P‖Q) with respect to point `y_i` is
//! `4 Σ_j (P_ij − Q_ij) w_ij (y_i − y_j)` with `w_ij = (1 + ‖y_i − y_j‖²)⁻¹`
//! and `Q_ij = w_ij / Z`. It splits into an attractive part over the sparse
//! nonzero entries of P, computed exactly here, and a repulsive part
//! `F_i / Z` supplied by the Barnes-Hut approximation. The constant factor 4
//! is folded into the learning rate.

use crate::affinity::SparseAffinities;
use crate::barnes_hut::student_t;
use crate::distance::array_squared_distance;
use crate::float::TsneFloat;
use ndarray::{ArrayView2, ArrayViewMut1, ArrayViewMut2, Zip};

/// Probability floor used when evaluating logarithms in the cost.
const MIN_PROBABILITY: f64 = 1e-12;

/// Assembles the gradient for every point.
///
/// Computes `exaggeration · Σ_j P_ij w_ij (y_i − y_j) − F_i / Z` per row, in
/// parallel over points.
///
/// # Arguments
/// * `affinities` - Joint distribution P
/// * `embedding` - Current coordinates
/// * `repulsion` - Repulsive numerators `F_i`, one per row
/// * `z` - Global normalizer; must be positive
/// * `exaggeration` - Multiplier applied to P
/// * `gradient` - Output, same shape as `embedding`
pub fn compute_gradient<T: TsneFloat>(
    affinities: &SparseAffinities<T>,
    embedding: ArrayView2<T>,
    repulsion: ArrayView2<T>,
    z: T,
    exaggeration: T,
    mut gradient: ArrayViewMut2<T>,
) {
    let z_inv = z.recip();

    Zip::indexed(gradient.rows_mut())
        .and(repulsion.rows())
        .par_for_each(|i, mut grad, force| {
            let point = embedding.row(i);
            grad.fill(T::zero());

            for (j, p) in affinities.row(i) {
                let other = embedding.row(j);
                let w = student_t(array_squared_distance(point, other));
                let scale = exaggeration * p * w;
                Zip::from(&mut grad)
                    .and(point)
                    .and(other)
                    .for_each(|g, &a, &b| *g += scale * (a - b));
            }

            Zip::from(&mut grad)
                .and(force)
                .for_each(|g, &f| *g -= f * z_inv);
        });
}

/// Evaluates KL(P‖Q) using the un-exaggerated P.
///
/// Only nonzero entries of P contribute. Per-row sums are written to
/// `row_cost` in parallel and then added sequentially.
///
/// # Returns
/// The total cost
pub fn kl_divergence<T: TsneFloat>(
    affinities: &SparseAffinities<T>,
    embedding: ArrayView2<T>,
    z: T,
    mut row_cost: ArrayViewMut1<T>,
) -> T {
    let floor = T::cast(MIN_PROBABILITY);
    let z_inv = z.recip();

    Zip::indexed(&mut row_cost).par_for_each(|i, cost| {
        let point = embedding.row(i);
        *cost = affinities.row(i).fold(T::zero(), |acc, (j, p)| {
            let q = (student_t(array_squared_distance(point, embedding.row(j))) * z_inv).max(floor);
            acc + p * (p.max(floor) / q).ln()
        });
    });

    row_cost.iter().fold(T::zero(), |acc, &c| acc + c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::{conditional_affinities, ConditionalAffinities};
    use crate::barnes_hut::exact_repulsion;
    use crate::knn::find_k_nearest_neighbors;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array2};

    fn pair_affinities() -> SparseAffinities<f64> {
        SparseAffinities::symmetrize(&ConditionalAffinities {
            neighbors: array![[1_u32], [0]],
            probabilities: array![[1.0], [1.0]],
            betas: vec![1.0; 2],
            unconverged: Vec::new(),
        })
    }

    fn exact_cost(affinities: &SparseAffinities<f64>, embedding: &Array2<f64>) -> f64 {
        let n = embedding.nrows();
        let mut repulsion = Array2::zeros(embedding.dim());
        let mut partial_z = Array1::zeros(n);
        let z = exact_repulsion(embedding.view(), repulsion.view_mut(), partial_z.view_mut());
        kl_divergence(affinities, embedding.view(), z, Array1::zeros(n).view_mut())
    }

    #[test]
    fn test_attraction_scales_with_exaggeration() {
        let p = pair_affinities();
        let embedding = array![[0.0, 0.0], [1.0, 0.0]];
        let repulsion = Array2::zeros((2, 2));

        let mut gradient = Array2::zeros((2, 2));
        compute_gradient(&p, embedding.view(), repulsion.view(), 1.0, 1.0, gradient.view_mut());
        assert_abs_diff_eq!(gradient[[0, 0]], -0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(gradient[[1, 0]], 0.25, epsilon = 1e-12);

        compute_gradient(&p, embedding.view(), repulsion.view(), 1.0, 12.0, gradient.view_mut());
        assert_abs_diff_eq!(gradient[[0, 0]], -3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(gradient[[0, 1]], 0.0);
    }

    #[test]
    fn test_balanced_pair_has_zero_gradient_and_cost() {
        // With two points Q is 1/2 on each pair at any separation, matching P.
        let p = pair_affinities();
        let embedding = array![[0.3, -1.0], [2.0, 0.5]];
        let mut repulsion = Array2::zeros((2, 2));
        let mut partial_z = Array1::zeros(2);
        let z = exact_repulsion(embedding.view(), repulsion.view_mut(), partial_z.view_mut());

        let mut gradient = Array2::zeros((2, 2));
        compute_gradient(&p, embedding.view(), repulsion.view(), z, 1.0, gradient.view_mut());
        for &g in &gradient {
            assert_abs_diff_eq!(g, 0.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(exact_cost(&p, &embedding), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let data = array![
            [0.0, 0.0, 1.0],
            [0.5, 0.1, 0.9],
            [3.0, 1.0, 0.0],
            [2.5, 1.2, 0.3],
            [-1.0, 2.0, 2.0],
            [0.2, -0.4, 1.5]
        ];
        let (neighbors, distances) = find_k_nearest_neighbors(data.view(), 5);
        let p = SparseAffinities::symmetrize(&conditional_affinities(
            neighbors,
            distances.view(),
            2.0,
        ));
        let embedding = array![
            [0.1, 0.2],
            [-0.3, 0.4],
            [1.0, -0.5],
            [0.7, 0.9],
            [-1.2, -0.8],
            [0.4, 0.0]
        ];

        let mut repulsion = Array2::zeros((6, 2));
        let mut partial_z = Array1::zeros(6);
        let z = exact_repulsion(embedding.view(), repulsion.view_mut(), partial_z.view_mut());
        let mut gradient = Array2::zeros((6, 2));
        compute_gradient(&p, embedding.view(), repulsion.view(), z, 1.0, gradient.view_mut());

        let h = 1e-6;
        for i in 0..6 {
            for k in 0..2 {
                let mut forward = embedding.clone();
                forward[[i, k]] += h;
                let mut backward = embedding.clone();
                backward[[i, k]] -= h;
                let numeric = (exact_cost(&p, &forward) - exact_cost(&p, &backward)) / (2.0 * h);
                assert_abs_diff_eq!(4.0 * gradient[[i, k]], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_cost_is_finite_for_coincident_points() {
        let p = pair_affinities();
        let embedding = array![[1.0, 1.0], [1.0, 1.0]];
        let cost = exact_cost(&p, &embedding);
        assert!(cost.is_finite());
        assert_abs_diff_eq!(cost, 0.0, epsilon = 1e-9);
    }
}
