//! Scratch buffers for the optimization loop.
//!
//! A [`Workspace`] holds every per-iteration buffer: the tree arena, the
//! repulsive forces, per-point normalizers, the gradient, per-row costs, and
//! the staged velocity and gains. Buffers are overwritten in place each
//! iteration.
//!
//! [`WorkspacePool`] lends workspaces out through [`WorkspaceGuard`], which
//! returns its workspace to the pool when dropped. Runs that share a pool
//! reuse allocations, and the workspace comes back on every exit path,
//! including early returns with an error.

use crate::float::TsneFloat;
use crate::tree::SpatialTree;
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use std::mem;
use std::ops::{Deref, DerefMut};
use tracing::debug;

/// Per-iteration scratch memory sized for `N` points in `d` dimensions.
#[derive(Debug)]
pub struct Workspace<T> {
    /// Space-partitioning tree over the current embedding
    pub tree: SpatialTree<T>,

    /// Repulsive force numerators
    pub repulsion: Array2<T>,

    /// Per-point contributions to the normalizer Z
    pub partial_z: Array1<T>,

    /// Gradient of the current iteration
    pub gradient: Array2<T>,

    /// Per-row contributions to the cost
    pub row_cost: Array1<T>,

    /// Staged velocities
    pub next_velocity: Array2<T>,

    /// Staged gains
    pub next_gains: Array2<T>,
}

impl<T: TsneFloat> Workspace<T> {
    /// Allocates a workspace for `n` points in `dims` dimensions.
    pub fn new(n: usize, dims: usize) -> Self {
        Self {
            tree: SpatialTree::new(dims),
            repulsion: Array2::zeros((n, dims)),
            partial_z: Array1::zeros(n),
            gradient: Array2::zeros((n, dims)),
            row_cost: Array1::zeros(n),
            next_velocity: Array2::zeros((n, dims)),
            next_gains: Array2::zeros((n, dims)),
        }
    }

    /// Shape `(n, dims)` the buffers are sized for.
    pub fn shape(&self) -> (usize, usize) {
        self.repulsion.dim()
    }

    /// Resizes the buffers if the shape differs, otherwise leaves them as is.
    pub fn fit(&mut self, n: usize, dims: usize) {
        if self.shape() != (n, dims) || self.tree.dims() != dims {
            *self = Self::new(n, dims);
        }
    }
}

/// Pool of reusable workspaces.
#[derive(Debug, Default)]
pub struct WorkspacePool<T> {
    free: Mutex<Vec<Workspace<T>>>,
}

impl<T: TsneFloat> WorkspacePool<T> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Lends out a workspace for `n` points in `dims` dimensions.
    ///
    /// Reuses a pooled workspace of the same shape when one is available.
    pub fn acquire(&self, n: usize, dims: usize) -> WorkspaceGuard<'_, T> {
        let pooled = {
            let mut free = self.free.lock();
            match free.iter().position(|w| w.shape() == (n, dims)) {
                Some(i) => Some(free.swap_remove(i)),
                None => free.pop(),
            }
        };

        let workspace = match pooled {
            Some(mut workspace) => {
                workspace.fit(n, dims);
                workspace
            }
            None => {
                debug!("Allocating workspace for {n} points in {dims} dimensions");
                Workspace::new(n, dims)
            }
        };

        WorkspaceGuard {
            pool: self,
            workspace,
        }
    }

    /// Number of workspaces currently available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// A workspace on loan from a [`WorkspacePool`].
#[derive(Debug)]
pub struct WorkspaceGuard<'a, T: TsneFloat> {
    pool: &'a WorkspacePool<T>,
    workspace: Workspace<T>,
}

impl<T: TsneFloat> Deref for WorkspaceGuard<'_, T> {
    type Target = Workspace<T>;

    fn deref(&self) -> &Self::Target {
        &self.workspace
    }
}

impl<T: TsneFloat> DerefMut for WorkspaceGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.workspace
    }
}

impl<T: TsneFloat> Drop for WorkspaceGuard<'_, T> {
    fn drop(&mut self) {
        // An empty workspace owns no heap memory.
        let workspace = mem::replace(&mut self.workspace, Workspace::new(0, 0));
        self.pool.free.lock().push(workspace);
    }
}
