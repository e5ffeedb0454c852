//! Per-iteration optimization parameters.
//!
//! Two breakpoints shape the run:
//! 1. Early exaggeration: P is multiplied by `early_exaggeration` for the
//!    first `exaggeration_window()` iterations, then the multiplier drops to
//!    one at once
//! 2. Momentum switch: `initial_momentum` is used before `momentum_switch()`,
//!    `final_momentum` from then on
//!
//! The learning rate stays constant for a given point count; adaptive gains
//! handle per-coordinate step sizes.

use crate::float::TsneFloat;
use crate::Configuration;

/// Optimization parameters in effect for one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule<T> {
    /// Velocity decay coefficient
    pub momentum: T,

    /// Multiplier applied to P in the attractive term
    pub exaggeration: T,

    /// Base step size
    pub learning_rate: T,
}

/// Calculates the optimization parameters for iteration `itr` (0-based) of a
/// run over `n` points.
pub fn find_schedule<T: TsneFloat>(itr: usize, config: &Configuration, n: usize) -> Schedule<T> {
    let momentum = if itr < config.momentum_switch() {
        config.initial_momentum
    } else {
        config.final_momentum
    };

    let exaggeration = if itr < config.exaggeration_window() {
        config.early_exaggeration
    } else {
        1.0
    };

    Schedule {
        momentum: T::cast(momentum),
        exaggeration: T::cast(exaggeration),
        learning_rate: T::cast(config.learning_rate_for(n)),
    }
}
