//! Barnes-Hut approximation of the t-SNE repulsive forces.
//!
//! For every point `i` the repulsive numerator
//! `F_i = Σ_j w_ij² (y_i − y_j)` and the partial normalizer
//! `Z_i = Σ_j w_ij`, with `w_ij = (1 + ‖y_i − y_j‖²)⁻¹`, are estimated by a
//! depth-first walk of the [`SpatialTree`]. A cell is summarized by its
//! center of mass when it is a leaf or when its largest half-width is small
//! relative to its distance from the query point.
//!
//! Cells on the query point's own insertion path contain the point itself;
//! its mass is removed from their summary before use, so self-interaction
//! never contributes.

use crate::float::TsneFloat;
use crate::tree::{NodeId, SpatialTree};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Zip};

/// Largest supported embedding dimensionality.
pub const MAX_DIMENSIONS: usize = 8;

/// Floor applied to squared embedding distances.
const MIN_SQUARED_DISTANCE: f64 = 1e-12;

/// Student-t kernel `(1 + d²)⁻¹` on a floored squared distance.
#[inline]
pub fn student_t<T: TsneFloat>(sq_distance: T) -> T {
    (T::one() + sq_distance.max(T::cast(MIN_SQUARED_DISTANCE))).recip()
}

/// Approximates the repulsive forces for all points.
///
/// Each point's traversal is independent and runs in parallel. Per-point
/// normalizers are written to `partial_z` and summed sequentially, so the
/// result does not depend on thread scheduling.
///
/// # Arguments
/// * `tree` - Tree built over `embedding`
/// * `embedding` - Current coordinates, one point per row
/// * `theta` - Acceptance threshold; zero visits every leaf
/// * `repulsion` - Output forces `F_i`, same shape as `embedding`
/// * `partial_z` - Output per-point normalizers `Z_i`
///
/// # Returns
/// The global normalizer `Z = Σ_i Z_i`
pub fn compute_repulsion<T: TsneFloat>(
    tree: &SpatialTree<T>,
    embedding: ArrayView2<T>,
    theta: T,
    mut repulsion: ArrayViewMut2<T>,
    mut partial_z: ArrayViewMut1<T>,
) -> T {
    let theta_sq = theta * theta;

    Zip::from(repulsion.rows_mut())
        .and(&mut partial_z)
        .and(embedding.rows())
        .par_for_each(|mut force, z, point| {
            force.fill(T::zero());
            *z = accumulate(tree, NodeId::ROOT, point, true, theta_sq, &mut force);
        });

    partial_z.iter().fold(T::zero(), |acc, &z| acc + z)
}

/// Walks the subtree at `node` and adds its contribution to `force`.
///
/// Returns the node's contribution to the point's normalizer.
fn accumulate<T: TsneFloat>(
    tree: &SpatialTree<T>,
    node: NodeId,
    point: ArrayView1<T>,
    contains_self: bool,
    theta_sq: T,
    force: &mut ArrayViewMut1<T>,
) -> T {
    let count = tree.count(node);
    if count == 0 || (contains_self && count == 1) {
        return T::zero();
    }

    let dims = tree.dims();
    let center = tree.center_of_mass(node);
    let mut diff = [T::zero(); MAX_DIMENSIONS];
    let mass = if contains_self {
        let total = T::from_usize(count);
        let rest = T::from_usize(count - 1);
        for k in 0..dims {
            diff[k] = point[k] - (center[k] * total - point[k]) / rest;
        }
        rest
    } else {
        for k in 0..dims {
            diff[k] = point[k] - center[k];
        }
        T::from_usize(count)
    };
    let sq_distance = diff[..dims].iter().fold(T::zero(), |acc, &v| acc + v * v);

    let half_width = tree.max_half_width(node);
    if tree.is_leaf(node) || half_width * half_width < theta_sq * sq_distance {
        let q = student_t(sq_distance);
        let weight = mass * q;
        let scale = weight * q;
        for k in 0..dims {
            force[k] += scale * diff[k];
        }
        return weight;
    }

    let own_slot = contains_self.then(|| tree.child_slot(node, point));
    let mut z = T::zero();
    for (slot, child) in tree.children(node).into_iter().flatten().enumerate() {
        z += accumulate(
            tree,
            child,
            point,
            own_slot == Some(slot),
            theta_sq,
            force,
        );
    }
    z
}

/// Computes the repulsive forces exactly in `O(N²)`.
///
/// Reference for [`compute_repulsion`]; same outputs, same conventions.
pub fn exact_repulsion<T: TsneFloat>(
    embedding: ArrayView2<T>,
    mut repulsion: ArrayViewMut2<T>,
    mut partial_z: ArrayViewMut1<T>,
) -> T {
    Zip::indexed(repulsion.rows_mut())
        .and(&mut partial_z)
        .par_for_each(|i, mut force, z| {
            force.fill(T::zero());
            let point = embedding.row(i);
            let mut sum = T::zero();
            for (j, other) in embedding.rows().into_iter().enumerate() {
                if i == j {
                    continue;
                }
                let diff = &point - &other;
                let q = student_t(diff.dot(&diff));
                sum += q;
                force.scaled_add(q * q, &diff);
            }
            *z = sum;
        });

    partial_z.iter().fold(T::zero(), |acc, &z| acc + z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array2};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_pcg::Pcg64Mcg;

    fn approximate(embedding: &Array2<f64>, theta: f64) -> (Array2<f64>, f64) {
        let tree = SpatialTree::from_points(embedding.view());
        let mut repulsion = Array2::zeros(embedding.dim());
        let mut partial_z = Array1::zeros(embedding.nrows());
        let z = compute_repulsion(
            &tree,
            embedding.view(),
            theta,
            repulsion.view_mut(),
            partial_z.view_mut(),
        );
        (repulsion, z)
    }

    fn exact(embedding: &Array2<f64>) -> (Array2<f64>, f64) {
        let mut repulsion = Array2::zeros(embedding.dim());
        let mut partial_z = Array1::zeros(embedding.nrows());
        let z = exact_repulsion(embedding.view(), repulsion.view_mut(), partial_z.view_mut());
        (repulsion, z)
    }

    fn random_embedding(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        Array2::random_using((n, d), Uniform::new(-5.0, 5.0), &mut rng)
    }

    /// Mean relative error of the approximate forces.
    fn mean_force_error(embedding: &Array2<f64>, theta: f64) -> f64 {
        let (reference, _) = exact(embedding);
        let (estimate, _) = approximate(embedding, theta);
        let total: f64 = reference
            .rows()
            .into_iter()
            .zip(estimate.rows())
            .map(|(r, e)| {
                let diff = &r - &e;
                diff.dot(&diff).sqrt() / r.dot(&r).sqrt().max(1e-12)
            })
            .sum();
        total / embedding.nrows() as f64
    }

    #[test]
    fn test_two_points() {
        let embedding = array![[0.0, 0.0], [1.0, 0.0]];
        let (repulsion, z) = approximate(&embedding, 0.5);
        assert_abs_diff_eq!(z, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(repulsion[[0, 0]], -0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(repulsion[[1, 0]], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(repulsion[[0, 1]], 0.0);
    }

    #[test]
    fn test_theta_zero_matches_exact() {
        for &(d, seed) in &[(2, 1_u64), (3, 2), (4, 3)] {
            let embedding = random_embedding(200, d, seed);
            let (reference, reference_z) = exact(&embedding);
            let (estimate, z) = approximate(&embedding, 0.0);

            assert_abs_diff_eq!(z, reference_z, epsilon = 1e-9 * reference_z);
            for (a, b) in estimate.iter().zip(reference.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_error_grows_with_theta() {
        let embedding = random_embedding(400, 2, 11);
        let exact = mean_force_error(&embedding, 0.0);
        let tight = mean_force_error(&embedding, 0.2);
        let loose = mean_force_error(&embedding, 0.9);
        assert!(exact < 1e-9, "theta 0 error {exact}");
        assert!(exact <= tight, "{exact} > {tight}");
        assert!(tight <= loose, "{tight} > {loose}");
    }

    #[test]
    fn test_coincident_points() {
        let embedding = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [4.0, -2.0], [0.0, 3.0]];
        let (reference, reference_z) = exact(&embedding);
        let (estimate, z) = approximate(&embedding, 0.0);

        assert!(z.is_finite());
        assert_abs_diff_eq!(z, reference_z, epsilon = 1e-9);
        for (a, b) in estimate.iter().zip(reference.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }

        let (estimate, z) = approximate(&embedding, 0.8);
        assert!(z.is_finite() && z > 0.0);
        assert!(estimate.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_f32_precision() {
        let embedding = random_embedding(100, 2, 5).mapv(|v| v as f32);
        let tree = SpatialTree::from_points(embedding.view());
        let mut repulsion = Array2::zeros(embedding.dim());
        let mut partial_z = Array1::zeros(embedding.nrows());
        let z = compute_repulsion(
            &tree,
            embedding.view(),
            0.5,
            repulsion.view_mut(),
            partial_z.view_mut(),
        );
        assert!(z.is_finite() && z > 0.0);
        assert!(repulsion.iter().all(|v| v.is_finite()));
    }
}
