//! K-nearest neighbor search for sparse t-SNE affinities.
//!
//! Each point's conditional distribution is restricted to its k nearest
//! neighbors in the input space. Small inputs use an exact parallel search
//! with SIMD distances; large inputs use an approximate HNSW index from
//! `usearch`. Both return squared Euclidean distances, which is what the
//! Gaussian kernels are calibrated on.

use crate::distance::array_squared_distance;
use crate::float::TsneFloat;
use ndarray::{Array2, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use std::cmp::min;
use thiserror::Error;
use tracing::debug;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// Errors raised by the approximate neighbor index.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KnnError {
    /// The underlying index reported an error
    #[error("Approximate neighbor index failed: {0}")]
    Index(String),

    /// A query returned fewer neighbors than requested
    #[error("Neighbor search for point {point} returned {found} of {expected} neighbors")]
    Incomplete {
        /// Query point index
        point: usize,
        /// Number of neighbors found, excluding the point itself
        found: usize,
        /// Number of neighbors requested
        expected: usize,
    },
}

/// Finds the k nearest neighbors of every point by exhaustive search.
///
/// Each row is processed in parallel: distances to all other points are
/// computed, the k smallest are selected and then sorted. Ties are broken by
/// index so the result is fully deterministic.
///
/// # Arguments
/// * `data` - Input data matrix where each row is a point
/// * `k` - Number of nearest neighbors to find per point
///
/// # Returns
/// A tuple containing:
/// - `neighbor_array`: `(n, min(k, n-1))` neighbor indices, nearest first
/// - `distance_array`: `(n, min(k, n-1))` squared distances to those neighbors
pub fn find_k_nearest_neighbors<T: TsneFloat>(
    data: ArrayView2<T>,
    k: usize,
) -> (Array2<u32>, Array2<T>) {
    let n = data.nrows();
    if n == 0 {
        return (Array2::zeros((0, 0)), Array2::zeros((0, 0)));
    }

    let k = min(k, n - 1);
    let data = data.as_standard_layout();
    let mut neighbor_array = Array2::<u32>::zeros((n, k));
    let mut distance_array = Array2::<T>::zeros((n, k));

    if k == 0 {
        return (neighbor_array, distance_array);
    }

    Zip::indexed(neighbor_array.rows_mut())
        .and(distance_array.rows_mut())
        .par_for_each(|i, mut neighbors, mut distances| {
            let row_i = data.row(i);
            let mut candidates: Vec<(T, u32)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (array_squared_distance(row_i, data.row(j)), j as u32))
                .collect();

            let order = |a: &(T, u32), b: &(T, u32)| a.0.total_order(&b.0).then(a.1.cmp(&b.1));
            if k < candidates.len() {
                candidates.select_nth_unstable_by(k - 1, order);
                candidates.truncate(k);
            }
            candidates.sort_unstable_by(order);

            for (slot, (distance, j)) in candidates.into_iter().enumerate() {
                neighbors[slot] = j;
                distances[slot] = distance;
            }
        });

    (neighbor_array, distance_array)
}

/// Finds approximate k nearest neighbors using an HNSW index.
///
/// Vectors are indexed as `f32` with the squared L2 metric. Each query asks
/// for `k + 1` results so the point itself can be discarded.
///
/// # Errors
/// * `KnnError::Index` if the index cannot be created, grown, or queried
/// * `KnnError::Incomplete` if a query returns fewer than `k` other points
pub fn find_k_nearest_neighbors_approx<T: TsneFloat>(
    data: ArrayView2<T>,
    k: usize,
) -> Result<(Array2<u32>, Array2<T>), KnnError> {
    let (n, dim) = data.dim();
    if n == 0 {
        return Ok((Array2::zeros((0, 0)), Array2::zeros((0, 0))));
    }

    let k = min(k, n - 1);
    let options = IndexOptions {
        dimensions: dim,
        metric: MetricKind::L2sq,
        quantization: ScalarKind::F32,
        ..Default::default()
    };

    let index = Index::new(&options).map_err(|e| KnnError::Index(e.to_string()))?;
    index
        .reserve(n)
        .map_err(|e| KnnError::Index(e.to_string()))?;

    let vectors: Vec<Vec<f32>> = data
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|&v| v.narrow()).collect())
        .collect();

    for (key, vector) in vectors.iter().enumerate() {
        index
            .add(key as u64, vector.as_slice())
            .map_err(|e| KnnError::Index(e.to_string()))?;
    }
    debug!("Built approximate neighbor index over {n} points");

    let mut neighbor_array = Array2::<u32>::zeros((n, k));
    let mut distance_array = Array2::<T>::zeros((n, k));
    neighbor_array
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(distance_array.axis_iter_mut(Axis(0)))
        .enumerate()
        .try_for_each(|(i, (mut neighbors, mut distances))| {
            let matches = index
                .search(vectors[i].as_slice(), k + 1)
                .map_err(|e| KnnError::Index(e.to_string()))?;

            let mut found = 0;
            for (&key, &distance) in matches.keys.iter().zip(matches.distances.iter()) {
                if key as usize == i || found == k {
                    continue;
                }
                neighbors[found] = key as u32;
                distances[found] = T::cast(f64::from(distance));
                found += 1;
            }

            if found < k {
                return Err(KnnError::Incomplete {
                    point: i,
                    found,
                    expected: k,
                });
            }
            Ok(())
        })?;

    Ok((neighbor_array, distance_array))
}
