//! The t-SNE run object and its iteration loop.
//!
//! [`Tsne::new`] validates the configuration, prepares the input, computes
//! the joint affinities and initializes the embedding. Each call to
//! [`Tsne::step`] then performs one full iteration:
//!
//! 1. Look up momentum and exaggeration for the iteration
//! 2. Rebuild the space-partitioning tree over the current embedding
//! 3. Approximate repulsive forces and the normalizer Z
//! 4. Assemble the gradient and evaluate the cost
//! 5. Stage the momentum update, validate it, and commit it
//! 6. Re-center the embedding
//!
//! Any non-finite intermediate aborts the step before the embedding is
//! touched, so the run object always holds the result of a completed
//! iteration.

use crate::affinity::{conditional_affinities, SparseAffinities};
use crate::barnes_hut::compute_repulsion;
use crate::float::TsneFloat;
use crate::gradient::{compute_gradient, kl_divergence};
use crate::knn::{find_k_nearest_neighbors, find_k_nearest_neighbors_approx};
use crate::momentum::stage_update;
use crate::preprocess::{initialize, normalize, reduce_dimensions};
use crate::schedule::find_schedule;
use crate::state::{EmbeddingState, OptimizationState};
use crate::workspace::{Workspace, WorkspacePool};
use crate::{Configuration, Instability, TsneError};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator};
use std::time::Instant;
use tracing::debug;

/// Interval, in iterations, between progress log lines.
const LOG_INTERVAL: usize = 50;

/// Where a run stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Iterations remain
    Running,

    /// Stopped early by the convergence rule
    Converged,

    /// The iteration budget is spent
    Completed,
}

/// A t-SNE run over one input matrix.
#[derive(Debug)]
pub struct Tsne<T: TsneFloat> {
    config: Configuration,
    theta: T,
    affinities: SparseAffinities<T>,
    unconverged: Vec<usize>,
    embedding: EmbeddingState<T>,
    state: OptimizationState<T>,
    snapshots: Option<Snapshots<T>>,
    converged: bool,
}

impl<T: TsneFloat> Tsne<T> {
    /// Prepares a run.
    ///
    /// # Arguments
    /// * `x` - Input data matrix where each row is a sample
    /// * `config` - Configuration options controlling the embedding process
    ///
    /// # Errors
    /// * `TsneError::Configuration` if the configuration is invalid for `x`
    /// * `TsneError::EmptyArrayMean` if normalization fails
    /// * `TsneError::Pca` if PCA reduction or initialization fails
    /// * `TsneError::Normal` if random initialization fails
    /// * `TsneError::Neighbors` if approximate neighbor search fails
    pub fn new(x: ArrayView2<T>, config: Configuration) -> Result<Self, TsneError> {
        let start_time = Instant::now();
        config.validate(x)?;
        let n = x.nrows();
        let dims = config.embedding_dimensions;

        let mut data = if config.normalize_input {
            normalize(x)?
        } else {
            x.to_owned()
        };

        if let Some(components) = config.pca_dimensions {
            if components < data.ncols() {
                data = reduce_dimensions(data.view(), components, config.seed)?;
            }
        }

        let k = config.neighbor_count(n);
        let (neighbors, distances) = if n >= config.approx_threshold {
            debug!("Using approximate neighbor search, k = {k}");
            find_k_nearest_neighbors_approx(data.view(), k)?
        } else {
            debug!("Using exact neighbor search, k = {k}");
            find_k_nearest_neighbors(data.view(), k)
        };

        let conditional =
            conditional_affinities(neighbors, distances.view(), T::cast(config.perplexity));
        let affinities = SparseAffinities::symmetrize(&conditional);
        debug!(
            "Affinities computed: {} nonzero entries in {:.2?}",
            affinities.nnz(),
            start_time.elapsed()
        );

        let coordinates = initialize(data.view(), &config.initialization, dims)?;
        let embedding = EmbeddingState::new(coordinates);

        let schedule = find_schedule(0, &config, n);
        let state = OptimizationState::new(
            schedule.learning_rate,
            schedule.momentum,
            schedule.exaggeration,
        );

        let mut snapshots = Snapshots::from(dims, n, config.snapshots.as_deref());
        if let Some(snapshots) = &mut snapshots {
            snapshots.record(0, embedding.coordinates.view());
        }

        Ok(Self {
            theta: T::cast(config.theta),
            config,
            affinities,
            unconverged: conditional.unconverged,
            embedding,
            state,
            snapshots,
            converged: false,
        })
    }

    /// Runs until the iteration budget is spent or the cost converges.
    ///
    /// # Errors
    /// * `TsneError::NumericInstability` if an iteration produces non-finite
    ///   values; the run keeps the last good embedding
    pub fn run(&mut self) -> Result<(), TsneError> {
        let pool = WorkspacePool::new();
        self.run_with(&pool)
    }

    /// Like [`Tsne::run`], borrowing scratch memory from `pool`.
    ///
    /// The workspace goes back to the pool on every exit path.
    ///
    /// # Errors
    /// * `TsneError::NumericInstability` if an iteration produces non-finite
    ///   values
    pub fn run_with(&mut self, pool: &WorkspacePool<T>) -> Result<(), TsneError> {
        let start_time = Instant::now();
        let (n, dims) = self.embedding.coordinates.dim();
        let mut workspace = pool.acquire(n, dims);

        while self.progress() == Progress::Running {
            self.step(&mut workspace)?;

            if self.has_converged() {
                self.converged = true;
                debug!("Converged at iteration {}", self.state.iteration);
            }
        }

        debug!("Elapsed time: {:.2?}", start_time.elapsed());
        Ok(())
    }

    /// Performs one iteration.
    ///
    /// `workspace` is resized if it does not match the embedding.
    ///
    /// # Errors
    /// * `TsneError::NumericInstability` if Z, the gradient, the cost, or
    ///   the update is not finite; the embedding is left unchanged
    pub fn step(&mut self, workspace: &mut Workspace<T>) -> Result<(), TsneError> {
        let itr = self.state.iteration;
        let (n, dims) = self.embedding.coordinates.dim();
        let schedule = find_schedule::<T>(itr, &self.config, n);
        workspace.fit(n, dims);

        let Workspace {
            tree,
            repulsion,
            partial_z,
            gradient,
            row_cost,
            next_velocity,
            next_gains,
        } = workspace;
        let y = self.embedding.coordinates.view();

        tree.rebuild(y);
        let z = compute_repulsion(tree, y, self.theta, repulsion.view_mut(), partial_z.view_mut());
        if !(z > T::zero() && z.is_finite()) {
            let point = partial_z.iter().position(|z| !z.is_finite());
            return Err(self.instability(itr, point));
        }

        compute_gradient(
            &self.affinities,
            y,
            repulsion.view(),
            z,
            schedule.exaggeration,
            gradient.view_mut(),
        );
        if let Some(point) = first_non_finite_row(gradient.view()) {
            return Err(self.instability(itr, Some(point)));
        }

        let cost = kl_divergence(&self.affinities, y, z, row_cost.view_mut());
        if !cost.is_finite() {
            let point = row_cost.iter().position(|c| !c.is_finite());
            return Err(self.instability(itr, point));
        }

        stage_update(
            gradient.view(),
            self.embedding.velocity.view(),
            self.embedding.gains.view(),
            next_velocity.view_mut(),
            next_gains.view_mut(),
            schedule.momentum,
            schedule.learning_rate,
            self.config.adaptive_gains,
        );
        if let Some(point) = first_unstable_update(y, next_velocity.view()) {
            return Err(self.instability(itr, Some(point)));
        }

        self.embedding.commit(next_velocity, next_gains);
        self.embedding.recenter();

        self.state.learning_rate = schedule.learning_rate;
        self.state.momentum = schedule.momentum;
        self.state.exaggeration = schedule.exaggeration;
        self.state.record(cost);

        let completed = self.state.iteration;
        if itr == 0 {
            debug!("Initial Loss: {}", cost);
        }
        if completed % LOG_INTERVAL == 0 {
            debug!("Iteration: {:4}, Loss: {}", completed, cost);
        }

        if let Some(snapshots) = &mut self.snapshots {
            snapshots.record(completed, self.embedding.coordinates.view());
        }

        Ok(())
    }

    /// Whether the convergence rule says to stop.
    ///
    /// Only costs recorded after early exaggeration are compared.
    fn has_converged(&self) -> bool {
        let Some(convergence) = self.config.convergence else {
            return false;
        };
        let first_comparable = self.config.exaggeration_window() + convergence.window + 1;
        if self.state.iteration < first_comparable {
            return false;
        }
        self.state
            .relative_improvement(convergence.window)
            .is_some_and(|improvement| improvement.widen() < convergence.min_relative_improvement)
    }

    fn instability(&self, iteration: usize, point: Option<usize>) -> TsneError {
        TsneError::NumericInstability(Box::new(Instability {
            iteration,
            point,
            embedding: self.embedding.coordinates.mapv(T::widen),
        }))
    }

    /// Current coordinates.
    pub fn embedding(&self) -> ArrayView2<'_, T> {
        self.embedding.coordinates.view()
    }

    /// Coordinates with velocities and gains.
    pub fn embedding_state(&self) -> &EmbeddingState<T> {
        &self.embedding
    }

    /// Consumes the run and returns the coordinates.
    pub fn into_embedding(self) -> Array2<T> {
        self.embedding.coordinates
    }

    /// Iteration counters, parameters, and cost history.
    pub fn state(&self) -> &OptimizationState<T> {
        &self.state
    }

    /// Whether the run can continue.
    pub fn progress(&self) -> Progress {
        if self.converged {
            Progress::Converged
        } else if self.state.iteration >= self.config.max_iterations {
            Progress::Completed
        } else {
            Progress::Running
        }
    }

    /// Joint distribution P.
    pub fn affinities(&self) -> &SparseAffinities<T> {
        &self.affinities
    }

    /// Points whose bandwidth search did not reach the target perplexity.
    pub fn unconverged_points(&self) -> &[usize] {
        &self.unconverged
    }

    /// Configuration the run was created with.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Takes the snapshots recorded so far, if any were requested.
    pub fn take_snapshots(&mut self) -> Option<Array3<T>> {
        self.snapshots.take().map(|s| s.states)
    }
}

/// First row containing NaN or infinity.
fn first_non_finite_row<T: TsneFloat>(a: ArrayView2<T>) -> Option<usize> {
    a.axis_iter(Axis(0))
        .into_par_iter()
        .position_first(|row| row.iter().any(|v| !v.is_finite()))
}

/// First row whose velocity is not finite, or whose moved position would
/// overflow when squared.
fn first_unstable_update<T: TsneFloat>(
    coordinates: ArrayView2<T>,
    velocity: ArrayView2<T>,
) -> Option<usize> {
    coordinates
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(velocity.axis_iter(Axis(0)))
        .position_first(|(y, v)| {
            y.iter().zip(v.iter()).any(|(&y, &v)| {
                let moved = y + v;
                !(v.is_finite() && (moved * moved).is_finite())
            })
        })
}

/// Embedding states recorded at requested iterations.
#[derive(Debug)]
struct Snapshots<T> {
    /// Stored embedding states
    states: Array3<T>,

    /// Iteration counts at which to take snapshots
    indices: Vec<usize>,
}

impl<T: TsneFloat> Snapshots<T> {
    /// Creates new snapshot storage if indices are provided.
    ///
    /// # Arguments
    /// * `n_dims` - Dimensionality of embedding
    /// * `n` - Number of samples
    /// * `maybe_snapshots` - Optional snapshot indices
    fn from(n_dims: usize, n: usize, maybe_snapshots: Option<&[usize]>) -> Option<Self> {
        let snapshots = maybe_snapshots?;
        Some(Self {
            states: Array3::zeros((snapshots.len(), n, n_dims)),
            indices: snapshots.to_vec(),
        })
    }

    /// Stores `y` in every slot requested for `iteration`.
    fn record(&mut self, iteration: usize, y: ArrayView2<T>) {
        for (slot, _) in self
            .indices
            .iter()
            .enumerate()
            .filter(|&(_, &index)| index == iteration)
        {
            self.states.slice_mut(s![slot, .., ..]).assign(&y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Convergence, Initialization};
    use ndarray::array;

    fn two_pairs() -> Array2<f64> {
        array![
            [0.0, 0.0, 0.0],
            [0.1, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [10.1, 0.0, 0.0]
        ]
    }

    fn small_config() -> Configuration {
        Configuration::builder()
            .perplexity(2.0)
            .theta(0.0)
            .max_iterations(20)
            .learning_rate(5.0)
            .early_exaggeration(1.0)
            .initialization(Initialization::Random(Some(3)))
            .build()
    }

    #[test]
    fn test_step_advances_state() {
        let data = two_pairs();
        let mut tsne = Tsne::new(data.view(), small_config()).unwrap();
        let mut workspace = Workspace::new(4, 2);

        assert_eq!(tsne.progress(), Progress::Running);
        assert_eq!(tsne.state().cost, None);
        tsne.step(&mut workspace).unwrap();

        assert_eq!(tsne.state().iteration, 1);
        assert!(tsne.state().cost.is_some_and(f64::is_finite));
        let mean = tsne.embedding().sum_axis(Axis(0));
        assert!(mean.iter().all(|m| m.abs() < 1e-12));
    }

    #[test]
    fn test_run_spends_budget() {
        let data = two_pairs();
        let mut tsne = Tsne::new(data.view(), small_config()).unwrap();
        tsne.run().unwrap();
        assert_eq!(tsne.progress(), Progress::Completed);
        assert_eq!(tsne.state().history.len(), 20);
    }

    #[test]
    fn test_workspace_returns_to_pool() {
        let data = two_pairs();
        let pool = WorkspacePool::new();
        let mut tsne = Tsne::new(data.view(), small_config()).unwrap();
        tsne.run_with(&pool).unwrap();
        assert_eq!(pool.available(), 1);

        let mut config = small_config();
        config.learning_rate = Some(f64::MAX);
        let mut tsne = Tsne::new(data.view(), config).unwrap();
        assert!(tsne.run_with(&pool).is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_instability_keeps_last_good_embedding() {
        let data = two_pairs();
        let mut config = small_config();
        config.learning_rate = Some(f64::MAX);
        let mut tsne = Tsne::new(data.view(), config).unwrap();
        let before = tsne.embedding().to_owned();

        let error = tsne.run().unwrap_err();
        assert!(
            matches!(
                &error,
                TsneError::NumericInstability(instability)
                    if instability.iteration == 0
                        && instability.point.is_some()
                        && instability.embedding == before
            ),
            "unexpected error: {error:?}"
        );
        assert_eq!(tsne.embedding(), before.view());
        assert_eq!(tsne.state().iteration, 0);
    }

    #[test]
    fn test_convergence_stops_early() {
        let data = two_pairs();
        let config = Configuration {
            max_iterations: 500,
            exaggeration_iterations: Some(10),
            convergence: Some(Convergence {
                window: 5,
                min_relative_improvement: 1.0,
            }),
            ..small_config()
        };
        let mut tsne = Tsne::new(data.view(), config).unwrap();
        tsne.run().unwrap();
        assert_eq!(tsne.progress(), Progress::Converged);
        assert_eq!(tsne.state().iteration, 16);
    }

    #[test]
    fn test_snapshots() {
        let data = two_pairs();
        let config = Configuration {
            snapshots: Some(vec![0, 5, 20]),
            ..small_config()
        };
        let mut tsne = Tsne::new(data.view(), config).unwrap();
        let initial = tsne.embedding().to_owned();
        tsne.run().unwrap();

        let snapshots = tsne.take_snapshots().unwrap();
        assert_eq!(snapshots.dim(), (3, 4, 2));
        assert_eq!(snapshots.slice(s![0, .., ..]), initial);
        assert_eq!(snapshots.slice(s![2, .., ..]), tsne.embedding());
        assert!(tsne.take_snapshots().is_none());
    }

    #[test]
    fn test_unconverged_points_reported() {
        // Every point sees identical distances, so no bandwidth yields
        // perplexity 2 over three neighbors.
        let simplex = array![
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0]
        ];
        let mut tsne = Tsne::new(simplex.view(), small_config()).unwrap();
        assert_eq!(tsne.unconverged_points(), &[0, 1, 2, 3]);
        assert!(tsne.run().is_ok());
    }
}
