//! Input preparation and embedding initialization.
//!
//! Before affinities are computed the input can be normalized (columns
//! centered, then scaled by the largest absolute value) and reduced with PCA.
//! PCA runs in `f64` regardless of the working precision.

use crate::float::TsneFloat;
use crate::{Initialization, TsneError};
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use petal_decomposition::{Pca, RandomizedPca, RandomizedPcaBuilder};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, warn};

/// Standard deviation of the initial embedding.
pub const INITIAL_SCALE: f64 = 1e-4;

/// Centers each column and divides by the largest absolute value.
///
/// Data with zero spread is only centered.
///
/// # Errors
/// * `TsneError::EmptyArrayMean` if `x` has no rows
pub fn normalize<T: TsneFloat>(x: ArrayView2<T>) -> Result<Array2<T>, TsneError> {
    if x.nrows() == 0 {
        return Err(TsneError::EmptyArrayMean);
    }

    let mean = x.sum_axis(Axis(0)) / T::from_usize(x.nrows());
    let mut x_out = &x - &mean;

    let max_abs = x_out.iter().fold(T::zero(), |acc, v| acc.max(v.abs()));
    if max_abs > T::zero() {
        x_out.mapv_inplace(|v| v / max_abs);
    }

    debug!("x is normalized");
    Ok(x_out)
}

/// Projects `x` onto its leading principal components with randomized PCA.
///
/// # Arguments
/// * `x` - Input data matrix
/// * `n_components` - Target dimensionality
/// * `maybe_seed` - Optional random seed for reproducibility
///
/// # Errors
/// * `TsneError::Pca` if the decomposition fails
pub fn reduce_dimensions<T: TsneFloat>(
    x: ArrayView2<T>,
    n_components: usize,
    maybe_seed: Option<u64>,
) -> Result<Array2<T>, TsneError> {
    let x64 = x.mapv(T::widen);
    let reduced = match maybe_seed {
        None => {
            let mut pca = RandomizedPca::new(n_components);
            pca.fit_transform(&x64)?
        }
        Some(seed) => {
            let mut pca =
                RandomizedPcaBuilder::with_rng(SmallRng::seed_from_u64(seed), n_components)
                    .build();
            pca.fit_transform(&x64)?
        }
    };

    debug!("Applied PCA, the dimensionality becomes {n_components}");
    Ok(reduced.mapv(T::cast))
}

/// Produces the initial `n × dims` embedding.
///
/// # Arguments
/// * `x` - Preprocessed input, used by PCA initialization
/// * `initialization` - Initialization strategy
/// * `dims` - Embedding dimensionality
///
/// PCA initialization falls back to random initialization, with a warning,
/// when the input has fewer features or rows than `dims` or when the leading
/// component has no spread.
///
/// # Errors
/// * `TsneError::Normal` if the normal distribution cannot be created
/// * `TsneError::Pca` if the PCA decomposition fails
pub fn initialize<T: TsneFloat>(
    x: ArrayView2<T>,
    initialization: &Initialization,
    dims: usize,
) -> Result<Array2<T>, TsneError> {
    let n = x.nrows();
    match initialization {
        Initialization::Random(maybe_seed) => random_embedding(n, dims, *maybe_seed),
        Initialization::Value(value) => Ok(value.mapv(T::cast)),
        Initialization::Pca => {
            if x.ncols() < dims || n < dims {
                warn!(
                    "Cannot initialize {dims} dimensions with PCA from {n} x {} input; using random initialization",
                    x.ncols()
                );
                return random_embedding(n, dims, None);
            }

            let x64 = x.mapv(T::widen);
            let mut pca = Pca::new(dims);
            let projected = pca.fit_transform(&x64)?;
            let std = projected.column(0).std(0.0);
            if !(std > 0.0 && std.is_finite()) {
                warn!("Leading principal component has no spread; using random initialization");
                return random_embedding(n, dims, None);
            }

            Ok(projected.mapv(|v| T::cast(v * INITIAL_SCALE / std)))
        }
    }
}

/// Draws coordinates from `N(0, INITIAL_SCALE²)`.
fn random_embedding<T: TsneFloat>(
    n: usize,
    dims: usize,
    maybe_seed: Option<u64>,
) -> Result<Array2<T>, TsneError> {
    let normal = Normal::new(0.0, INITIAL_SCALE)?;
    let y = match maybe_seed {
        None => Array2::random((n, dims), normal),
        Some(seed) => Array2::random_using((n, dims), normal, &mut SmallRng::seed_from_u64(seed)),
    };
    Ok(y.mapv(T::cast))
}
