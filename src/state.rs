//! Mutable state of an embedding run.

use crate::float::TsneFloat;
use ndarray::{Array2, Axis, Zip};
use std::mem;

/// Live coordinates with their velocities and adaptive gains.
///
/// All three matrices are `N × d` and indexed like the input rows.
#[derive(Clone, Debug)]
pub struct EmbeddingState<T> {
    /// Current coordinates
    pub coordinates: Array2<T>,

    /// Momentum velocities
    pub velocity: Array2<T>,

    /// Per-coordinate gains
    pub gains: Array2<T>,
}

impl<T: TsneFloat> EmbeddingState<T> {
    /// Wraps initial coordinates with zero velocity and unit gains.
    pub fn new(coordinates: Array2<T>) -> Self {
        let dim = coordinates.dim();
        Self {
            coordinates,
            velocity: Array2::zeros(dim),
            gains: Array2::ones(dim),
        }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.coordinates.nrows()
    }

    /// Whether the embedding has no points.
    pub fn is_empty(&self) -> bool {
        self.coordinates.nrows() == 0
    }

    /// Embedding dimensionality.
    pub fn dims(&self) -> usize {
        self.coordinates.ncols()
    }

    /// Commits a staged update.
    ///
    /// The staged buffers are swapped in and the previous velocity and gains
    /// are handed back through the same arguments for reuse. Coordinates then
    /// move by the new velocity.
    pub fn commit(&mut self, next_velocity: &mut Array2<T>, next_gains: &mut Array2<T>) {
        mem::swap(&mut self.velocity, next_velocity);
        mem::swap(&mut self.gains, next_gains);
        Zip::from(&mut self.coordinates)
            .and(&self.velocity)
            .par_for_each(|y, &v| *y += v);
    }

    /// Shifts the coordinates to zero mean per dimension.
    pub fn recenter(&mut self) {
        if self.is_empty() {
            return;
        }
        let mean = self.coordinates.sum_axis(Axis(0)) / T::from_usize(self.len());
        self.coordinates -= &mean;
    }
}

/// Iteration counters and scalar parameters of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationState<T> {
    /// Number of completed iterations
    pub iteration: usize,

    /// Learning rate used by the last iteration
    pub learning_rate: T,

    /// Momentum used by the last iteration
    pub momentum: T,

    /// Exaggeration used by the last iteration
    pub exaggeration: T,

    /// KL divergence evaluated during the last iteration
    pub cost: Option<T>,

    /// Cost after every completed iteration
    pub history: Vec<T>,
}

impl<T: TsneFloat> OptimizationState<T> {
    /// State before the first iteration.
    pub fn new(learning_rate: T, momentum: T, exaggeration: T) -> Self {
        Self {
            iteration: 0,
            learning_rate,
            momentum,
            exaggeration,
            cost: None,
            history: Vec::new(),
        }
    }

    /// Records a completed iteration.
    pub fn record(&mut self, cost: T) {
        self.iteration += 1;
        self.cost = Some(cost);
        self.history.push(cost);
    }

    /// Relative cost decrease over the last `window` iterations.
    ///
    /// `None` until `window + 1` costs are recorded.
    pub fn relative_improvement(&self, window: usize) -> Option<T> {
        let last = *self.history.last()?;
        let earlier = *self
            .history
            .len()
            .checked_sub(window + 1)
            .and_then(|i| self.history.get(i))?;
        let scale = earlier.abs().max(T::min_positive_value());
        Some((earlier - last) / scale)
    }
}
