#![allow(clippy::multiple_crate_versions)]

//! # Barnes-Hut t-SNE
//!
//! This crate provides a Rust implementation of t-distributed Stochastic
//! Neighbor Embedding (t-SNE) accelerated with the Barnes-Hut approximation.
//! It embeds high-dimensional points into two or more dimensions such that
//! points that are similar in the input stay close in the embedding.
//!
//! t-SNE minimizes the Kullback-Leibler divergence between two distributions
//! over point pairs: P, built from Gaussian kernels in the input space, and
//! Q, built from a heavy-tailed Student-t kernel in the embedding. The exact
//! gradient costs `O(N²)` per iteration; the Barnes-Hut tree reduces the
//! repulsive part to `O(N log N)`.
//!
//! ## Key Features
//!
//! - Perplexity-calibrated affinities over k nearest neighbors, with exact
//!   search for small inputs and HNSW search for large ones
//! - A space-partitioning tree in an index-addressed arena, rebuilt every
//!   iteration without reallocating
//! - Momentum gradient descent with adaptive gains and early exaggeration
//! - Generic over `f32` and `f64`
//! - Per-point work parallelized with rayon; results are reproducible
//! - Optional snapshots of intermediate embeddings
//!
//! ## Examples
//!
//! Basic usage with default parameters:
//! ```rust,no_run
//! use ndarray::Array2;
//! use bhtsne::{Configuration, fit_transform};
//!
//! let data: Array2<f32> = // ... load your high-dimensional data
//! # Array2::zeros((100, 50));
//! let config = Configuration::default();
//! let (embedding, _) = fit_transform(data.view(), config).unwrap();
//! ```
//!
//! Customized embedding:
//! ```rust,no_run
//! use bhtsne::{Configuration, Initialization};
//!
//! let config = Configuration::builder()
//!     .embedding_dimensions(3)
//!     .perplexity(20.0)
//!     .theta(0.3)
//!     .initialization(Initialization::Random(Some(42)))
//!     .max_iterations(500)
//!     .build();
//! ```
//!
//! Stepping a run manually:
//! ```rust,no_run
//! use ndarray::Array2;
//! use bhtsne::{Configuration, Tsne, WorkspacePool};
//!
//! # let data = Array2::<f64>::zeros((100, 10));
//! let mut tsne = Tsne::new(data.view(), Configuration::default()).unwrap();
//! let pool = WorkspacePool::new();
//! let mut workspace = pool.acquire(100, 2);
//! for _ in 0..100 {
//!     tsne.step(&mut workspace).unwrap();
//! }
//! println!("cost: {:?}", tsne.state().cost);
//! ```
//!
//! ## Configuration
//!
//! Core parameters:
//! - `embedding_dimensions`: Output dimensionality, 2 to 8 (default: 2)
//! - `perplexity`: Effective number of neighbors (default: 30)
//! - `theta`: Barnes-Hut accuracy threshold in `[0, 1]`; 0 is exact
//!   (default: 0.5)
//! - `max_iterations`: Iteration budget (default: 1000)
//! - `learning_rate`: Base step size (default: `N / early_exaggeration`)
//! - `adaptive_gains`: Per-coordinate gains (default: true)
//! - `normalize_input`: Center and scale the input first (default: false)
//! - `initialization`: How to initialize coordinates:
//!   - `Random(seed)` - Small Gaussian noise with optional seed (default)
//!   - `Pca` - Scaled projection onto the leading principal components
//!   - `Value(array)` - Use provided coordinates
//!
//! Schedule parameters:
//! - `early_exaggeration` and `exaggeration_iterations` (default: 12, and
//!   250 capped at a quarter of `max_iterations`)
//! - `initial_momentum`, `final_momentum` and `momentum_switch_iteration`
//!   (default: 0.5, 0.8, and the same cap as the exaggeration window)
//! - `convergence`: Optional early stop on a stalled cost
//! - `snapshots`: Optional iterations at which to save the embedding
//!
//! Neighbor parameters:
//! - `override_neighbors`: Neighbors per point (default: `3 · perplexity`)
//! - `pca_dimensions`: Optional PCA reduction of the input
//! - `approx_threshold`: Number of points from which approximate neighbor
//!   search is used
//! - `seed`: Optional random seed for randomized PCA
//!
//! ## References
//!
//! [Accelerating t-SNE using Tree-Based Algorithms](https://jmlr.org/papers/v15/vandermaaten14a.html).
//! van der Maaten, L. (2014).
//! Journal of Machine Learning Research, 15(93), 3221-3245.

// Submodule imports
pub mod affinity;
pub mod barnes_hut;
mod distance;
pub mod export;
mod float;
mod gradient;
pub mod knn;
mod momentum;
mod optimizer;
mod preprocess;
mod schedule;
mod state;
pub mod tree;
pub mod workspace;


use bon::Builder;
use ndarray::{Array2, Array3, ArrayView2};
use ndarray_rand::rand_distr::NormalError;
use petal_decomposition::DecompositionError;
use std::cmp::{max, min};
use thiserror::Error;

use crate::barnes_hut::MAX_DIMENSIONS;
use crate::knn::KnnError;

pub use crate::float::TsneFloat;
pub use crate::optimizer::{Progress, Tsne};
pub use crate::state::{EmbeddingState, OptimizationState};
pub use crate::workspace::{Workspace, WorkspaceGuard, WorkspacePool};

/// Schedule window length used when `max_iterations` is large enough.
pub const DEFAULT_WINDOW: usize = 250;

/// Configuration options for a t-SNE run.
///
/// Controls the affinity calibration, the Barnes-Hut approximation, the
/// optimization schedule, initialization, and snapshot capture. Validated
/// once, before any computation, by [`Configuration::validate`].
#[derive(Builder, Clone, Debug)]
pub struct Configuration {
    /// Number of dimensions in the output embedding space, typically 2 or 3
    #[builder(default = 2)]
    pub embedding_dimensions: usize,

    /// Target perplexity of each point's conditional distribution
    #[builder(default = 30.0)]
    pub perplexity: f64,

    /// Barnes-Hut acceptance threshold; 0 computes repulsion exactly
    #[builder(default = 0.5)]
    pub theta: f64,

    /// Total number of optimization iterations
    #[builder(default = 1000)]
    pub max_iterations: usize,

    /// Base step size of the gradient descent; `N / early_exaggeration`
    /// when unset
    pub learning_rate: Option<f64>,

    /// Whether per-coordinate gains adapt to the gradient history
    #[builder(default = true)]
    pub adaptive_gains: bool,

    /// Whether to center and scale the input before computing affinities
    #[builder(default = false)]
    pub normalize_input: bool,

    /// Method for initializing the embedding coordinates
    #[builder(default)]
    pub initialization: Initialization,

    /// Multiplier applied to P during the early exaggeration window
    #[builder(default = 12.0)]
    pub early_exaggeration: f64,

    /// Length of the early exaggeration window; see
    /// [`Configuration::exaggeration_window`] when unset
    pub exaggeration_iterations: Option<usize>,

    /// Momentum before the switch
    #[builder(default = 0.5)]
    pub initial_momentum: f64,

    /// Momentum from the switch on
    #[builder(default = 0.8)]
    pub final_momentum: f64,

    /// Iteration at which the momentum switches; see
    /// [`Configuration::momentum_switch`] when unset
    pub momentum_switch_iteration: Option<usize>,

    /// Optional fixed neighbor count override
    pub override_neighbors: Option<usize>,

    /// Optional number of principal components to reduce the input to
    pub pca_dimensions: Option<usize>,

    /// Optional random seed for reproducible dimensionality reduction
    pub seed: Option<u64>,

    /// Number of points from which approximate neighbor search is used
    #[builder(default = 8_000)]
    pub approx_threshold: usize,

    /// Optional early stopping rule
    pub convergence: Option<Convergence>,

    /// Optional iteration counts at which to save embedding states; 0 is the
    /// initial embedding
    pub snapshots: Option<Vec<usize>>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            embedding_dimensions: 2,
            perplexity: 30.0,
            theta: 0.5,
            max_iterations: 1000,
            learning_rate: None,
            adaptive_gains: true,
            normalize_input: false,
            initialization: Initialization::default(),
            early_exaggeration: 12.0,
            exaggeration_iterations: None,
            initial_momentum: 0.5,
            final_momentum: 0.8,
            momentum_switch_iteration: None,
            override_neighbors: None,
            pca_dimensions: None,
            seed: None,
            approx_threshold: 8_000,
            convergence: None,
            snapshots: None,
        }
    }
}

impl Configuration {
    /// Checks the configuration against the input matrix.
    ///
    /// # Errors
    /// The first [`ConfigurationError`] found.
    #[allow(clippy::cast_precision_loss)]
    pub fn validate<T: TsneFloat>(&self, x: ArrayView2<T>) -> Result<(), ConfigurationError> {
        let n = x.nrows();
        if n <= 1 {
            return Err(ConfigurationError::SampleSize);
        }

        if !(2..=MAX_DIMENSIONS).contains(&self.embedding_dimensions) {
            return Err(ConfigurationError::Dimensions(self.embedding_dimensions));
        }

        let perplexity = self.perplexity;
        if !perplexity.is_finite()
            || perplexity <= 0.0
            || 3.0 * (perplexity - 1.0) > (n - 1) as f64
        {
            return Err(ConfigurationError::Perplexity {
                perplexity,
                samples: n,
            });
        }

        if !(0.0..=1.0).contains(&self.theta) {
            return Err(ConfigurationError::Theta(self.theta));
        }

        if let Some(learning_rate) = self.learning_rate {
            if !(learning_rate.is_finite() && learning_rate > 0.0) {
                return Err(ConfigurationError::LearningRate(learning_rate));
            }
        }

        if self.max_iterations == 0 {
            return Err(ConfigurationError::Iterations);
        }

        if !(self.early_exaggeration.is_finite() && self.early_exaggeration >= 1.0) {
            return Err(ConfigurationError::Exaggeration(self.early_exaggeration));
        }

        for momentum in [self.initial_momentum, self.final_momentum] {
            if !(0.0..1.0).contains(&momentum) {
                return Err(ConfigurationError::Momentum(momentum));
            }
        }

        if self.override_neighbors == Some(0) {
            return Err(ConfigurationError::NeighborCount);
        }

        if self.pca_dimensions == Some(0) {
            return Err(ConfigurationError::PcaDimensions);
        }

        if let Some(convergence) = &self.convergence {
            let tolerance = convergence.min_relative_improvement;
            if convergence.window == 0 || !(tolerance.is_finite() && tolerance >= 0.0) {
                return Err(ConfigurationError::Convergence);
            }
        }

        if let Initialization::Value(value) = &self.initialization {
            let expected = [n, self.embedding_dimensions];
            if value.shape() != expected {
                return Err(ConfigurationError::InitializationShape {
                    expected,
                    actual: value.shape().to_vec(),
                });
            }
            if value.iter().any(|v| !v.is_finite()) {
                return Err(ConfigurationError::NonFiniteInitialization);
            }
        }

        if let Some(row) = x
            .rows()
            .into_iter()
            .position(|row| row.iter().any(|v| !v.is_finite()))
        {
            return Err(ConfigurationError::NonFiniteInput { row });
        }

        Ok(())
    }

    /// Step size for a run over `n` points.
    ///
    /// Defaults to `n / early_exaggeration`, so the exaggerated attraction
    /// moves small and large inputs by a comparable amount.
    #[allow(clippy::cast_precision_loss)]
    pub fn learning_rate_for(&self, n: usize) -> f64 {
        self.learning_rate.unwrap_or_else(|| n as f64 / self.early_exaggeration)
    }

    /// Length of the early exaggeration window.
    ///
    /// Defaults to [`DEFAULT_WINDOW`] iterations, capped at a quarter of
    /// `max_iterations`.
    pub fn exaggeration_window(&self) -> usize {
        self.exaggeration_iterations.unwrap_or_else(|| self.default_window())
    }

    /// Iteration at which the momentum switches; same default as
    /// [`Configuration::exaggeration_window`].
    pub fn momentum_switch(&self) -> usize {
        self.momentum_switch_iteration.unwrap_or_else(|| self.default_window())
    }

    fn default_window(&self) -> usize {
        min(DEFAULT_WINDOW, self.max_iterations / 4)
    }

    /// Number of neighbors per point used for the sparse affinities.
    ///
    /// Defaults to `⌊3 · perplexity⌋`, clipped to `n − 1`.
    pub fn neighbor_count(&self, n: usize) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let k = self
            .override_neighbors
            .unwrap_or_else(|| (3.0 * self.perplexity).floor() as usize);
        max(min(k, n.saturating_sub(1)), 1)
    }
}

/// Methods for initializing the embedding coordinates.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Initialization {
    /// Project data using PCA, scaled to a small standard deviation
    Pca,

    /// Use provided coordinate values
    Value(Array2<f64>),

    /// Initialize randomly with optional seed
    Random(Option<u64>),
}

impl Default for Initialization {
    fn default() -> Self {
        Self::Random(None)
    }
}

/// Early stopping rule.
///
/// Once early exaggeration has ended, the run stops when the cost has
/// improved by less than `min_relative_improvement` over the last `window`
/// iterations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Convergence {
    /// Number of iterations to look back
    pub window: usize,

    /// Relative cost decrease below which the run stops
    pub min_relative_improvement: f64,
}

/// Reduces dimensionality of input data using Barnes-Hut t-SNE.
///
/// # Arguments
/// * `x` - Input data matrix where each row is a sample
/// * `config` - Configuration options controlling the embedding process
///
/// # Returns
/// A tuple containing:
/// * Final embedding coordinates as a matrix
/// * Optional array of intermediate embedding states if snapshots were
///   requested
///
/// # Errors
/// * `TsneError::Configuration` - Invalid configuration for this input,
///   reported before any computation
/// * `TsneError::NumericInstability` - Non-finite values during optimization;
///   carries the last good embedding
/// * `TsneError::EmptyArrayMean` - Mean cannot be calculated for
///   normalization
/// * `TsneError::Pca` - PCA decomposition fails
/// * `TsneError::Normal` - Random initialization fails
/// * `TsneError::Neighbors` - Approximate neighbor search fails
pub fn fit_transform<T: TsneFloat>(
    x: ArrayView2<T>,
    config: Configuration,
) -> Result<(Array2<T>, Option<Array3<T>>), TsneError> {
    let mut tsne = Tsne::new(x, config)?;
    tsne.run()?;
    let snapshots = tsne.take_snapshots();
    Ok((tsne.into_embedding(), snapshots))
}

/// Invalid configuration for a given input.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Input data has 1 or fewer samples
    #[error("Sample size must be larger than one")]
    SampleSize,

    /// Output dimensionality outside the supported range
    #[error("Embedding dimensions must be between 2 and 8, got {0}")]
    Dimensions(usize),

    /// Perplexity is not positive or too large for the number of samples
    #[error("Perplexity {perplexity} is invalid for {samples} samples; 3 * (perplexity - 1) must not exceed samples - 1")]
    Perplexity {
        /// Requested perplexity
        perplexity: f64,
        /// Number of input rows
        samples: usize,
    },

    /// Theta outside `[0, 1]`
    #[error("Theta must be in [0, 1], got {0}")]
    Theta(f64),

    /// Learning rate not positive
    #[error("Learning rate must be positive, got {0}")]
    LearningRate(f64),

    /// Zero iterations requested
    #[error("The number of iterations must be positive")]
    Iterations,

    /// Early exaggeration below one
    #[error("Early exaggeration must be at least 1, got {0}")]
    Exaggeration(f64),

    /// Momentum outside `[0, 1)`
    #[error("Momentum must be in [0, 1), got {0}")]
    Momentum(f64),

    /// Neighbor count override of zero
    #[error("The number of nearest neighbors can't be less than 1")]
    NeighborCount,

    /// PCA target dimensionality of zero
    #[error("The number of PCA dimensions can't be less than 1")]
    PcaDimensions,

    /// Provided initial coordinates have the wrong shape
    #[error("Invalid shape for initial coordinates. Expected {expected:?}, got {actual:?}")]
    InitializationShape {
        /// Expected shape: [`n_samples`, `embedding_dimensions`]
        expected: [usize; 2],
        /// Actual shape of provided matrix
        actual: Vec<usize>,
    },

    /// Provided initial coordinates contain NaN or infinity
    #[error("Initial coordinates must be finite")]
    NonFiniteInitialization,

    /// Input contains NaN or infinity
    #[error("Input row {row} contains a non-finite value")]
    NonFiniteInput {
        /// First offending row
        row: usize,
    },

    /// Convergence window of zero or invalid tolerance
    #[error("Convergence requires a positive window and a non-negative tolerance")]
    Convergence,
}

/// Diagnostic state of a run aborted by non-finite values.
#[derive(Debug, Clone)]
pub struct Instability {
    /// Iteration (0-based) during which the failure was detected
    pub iteration: usize,

    /// Offending point, when one can be identified
    pub point: Option<usize>,

    /// Last good embedding, widened to `f64`
    pub embedding: Array2<f64>,
}

/// Errors that can occur during t-SNE embedding.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TsneError {
    /// Configuration is invalid for this input
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// NaN or infinity appeared in the gradient, the update, or the cost
    #[error("Numeric instability at iteration {} (point {:?})", .0.iteration, .0.point)]
    NumericInstability(Box<Instability>),

    /// Mean calculation failed due to empty array
    #[error("Failed to calculate mean axis: the array is empty")]
    EmptyArrayMean,

    /// Normal distribution creation failed
    #[error(transparent)]
    Normal(#[from] NormalError),

    /// PCA decomposition failed
    #[error(transparent)]
    Pca(#[from] DecompositionError),

    /// K-nearest neighbors error
    #[error(transparent)]
    Neighbors(#[from] KnnError),
}
