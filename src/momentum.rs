//! Momentum gradient descent with per-dimension adaptive gains.
//!
//! Each coordinate keeps a velocity and a gain. The gain grows additively
//! while the gradient keeps pushing in the direction the coordinate is already
//! moving, and shrinks multiplicatively when the direction flips.
//!
//! Updates are staged: new velocities and gains are written to separate
//! buffers so the caller can validate them before committing.

use crate::float::TsneFloat;
use ndarray::{ArrayView2, ArrayViewMut2, Zip};

/// Additive gain increase.
pub const GAIN_STEP: f64 = 0.2;

/// Multiplicative gain decrease.
pub const GAIN_DECAY: f64 = 0.8;

/// Lower bound on any gain.
pub const MIN_GAIN: f64 = 0.01;

/// Stages one momentum step.
///
/// # Arguments
/// * `gradient` - Gradient for this iteration
/// * `velocity` - Current velocities
/// * `gains` - Current gains
/// * `next_velocity` - Output velocities
/// * `next_gains` - Output gains
/// * `momentum` - Velocity decay coefficient
/// * `learning_rate` - Base step size
/// * `adaptive` - Whether gains adapt; when off, every gain stays at one
///
/// # Implementation Notes
/// - Gain rises by [`GAIN_STEP`] when `sign(gradient) != sign(velocity)`,
///   which means the descent direction agrees with the current motion
/// - Otherwise gain is multiplied by [`GAIN_DECAY`], never going below
///   [`MIN_GAIN`]
/// - `velocity' = momentum · velocity − learning_rate · gain' · gradient`
#[allow(clippy::too_many_arguments)]
pub fn stage_update<T: TsneFloat>(
    gradient: ArrayView2<T>,
    velocity: ArrayView2<T>,
    gains: ArrayView2<T>,
    next_velocity: ArrayViewMut2<T>,
    next_gains: ArrayViewMut2<T>,
    momentum: T,
    learning_rate: T,
    adaptive: bool,
) {
    let step = T::cast(GAIN_STEP);
    let decay = T::cast(GAIN_DECAY);
    let min_gain = T::cast(MIN_GAIN);

    Zip::from(next_velocity)
        .and(next_gains)
        .and(gradient)
        .and(velocity)
        .and(gains)
        .par_for_each(|next_v, next_g, &grad, &v, &g| {
            *next_g = if !adaptive {
                T::one()
            } else if (grad > T::zero()) != (v > T::zero()) {
                g + step
            } else {
                (g * decay).max(min_gain)
            };
            *next_v = momentum * v - learning_rate * *next_g * grad;
        });
}
