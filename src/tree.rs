//! Arena-based space-partitioning tree over the embedding.
//!
//! A quad-tree in two dimensions, an oct-tree in three, and a 2^d-ary tree in
//! general. Nodes live contiguously in a `Vec` and refer to their children by
//! index; the `2^d` children of a node are allocated as one consecutive block,
//! so a node only stores the index of its first child.
//!
//! The tree is rebuilt from scratch every iteration. [`SpatialTree::rebuild`]
//! clears the arena but keeps its capacity, so steady-state iterations do not
//! allocate.
//!
//! Each node aggregates the number of points in its subtree and their center
//! of mass, updated incrementally as points are inserted. Leaves hold at most
//! one distinct position: a point landing on an occupied leaf splits it,
//! unless the two positions coincide or the leaf is at [`MAX_DEPTH`], in which
//! case the leaf simply aggregates the extra mass.

use crate::float::TsneFloat;
use ndarray::{ArrayView1, ArrayView2, Axis};

/// Depth at which leaves stop splitting and aggregate further points.
pub const MAX_DEPTH: u16 = 32;

/// Relative padding applied to the root cell.
const ROOT_PADDING: f64 = 1e-3;

/// Minimum root half-width, for point sets with zero extent.
const MIN_HALF_WIDTH: f64 = 1e-5;

/// Index into the node arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId(u32);

impl NodeId {
    /// Sentinel for "no node".
    pub const NONE: NodeId = NodeId(u32::MAX);

    /// The root is always the first node in the arena.
    pub const ROOT: NodeId = NodeId(0);

    fn new(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize, "NodeId overflow");
        NodeId(index as u32)
    }

    /// Position of the node in the arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// Per-node bookkeeping. Coordinates are kept in flat side buffers.
#[derive(Clone, Copy, Debug)]
struct Node {
    count: u32,
    first_child: NodeId,
    point: u32,
    depth: u16,
}

impl Node {
    const NO_POINT: u32 = u32::MAX;

    fn empty(depth: u16) -> Self {
        Self {
            count: 0,
            first_child: NodeId::NONE,
            point: Self::NO_POINT,
            depth,
        }
    }
}

/// Space-partitioning tree over a set of low-dimensional points.
#[derive(Clone, Debug)]
pub struct SpatialTree<T> {
    dims: usize,
    fanout: usize,
    nodes: Vec<Node>,
    centers: Vec<T>,
    half_widths: Vec<T>,
    mass_centers: Vec<T>,
    scratch: Vec<T>,
}

impl<T: TsneFloat> SpatialTree<T> {
    /// Creates an empty tree for points of the given dimensionality.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            fanout: 1 << dims,
            nodes: Vec::new(),
            centers: Vec::new(),
            half_widths: Vec::new(),
            mass_centers: Vec::new(),
            scratch: vec![T::zero(); dims],
        }
    }

    /// Builds a tree over `points` (one point per row).
    pub fn from_points(points: ArrayView2<T>) -> Self {
        let mut tree = Self::new(points.ncols());
        tree.rebuild(points);
        tree
    }

    /// Discards the current contents and inserts `points` afresh.
    ///
    /// The root cell is the padded bounding box of the points.
    ///
    /// # Panics
    /// * In debug builds, if the column count differs from the tree's
    ///   dimensionality
    pub fn rebuild(&mut self, points: ArrayView2<T>) {
        debug_assert_eq!(points.ncols(), self.dims, "dimension mismatch");
        self.nodes.clear();
        self.centers.clear();
        self.half_widths.clear();
        self.mass_centers.clear();

        let padding = T::cast(ROOT_PADDING);
        let min_half_width = T::cast(MIN_HALF_WIDTH);
        let two = T::cast(2.0);

        self.nodes.push(Node::empty(0));
        for column in points.axis_iter(Axis(1)) {
            let (lo, hi) = column
                .iter()
                .fold((T::infinity(), T::neg_infinity()), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let (center, half_width) = if lo <= hi {
                let half_range = (hi - lo) / two;
                (
                    lo + half_range,
                    half_range + (half_range * padding).max(min_half_width),
                )
            } else {
                (T::zero(), min_half_width)
            };
            self.centers.push(center);
            self.half_widths.push(half_width);
            self.mass_centers.push(T::zero());
        }

        for (index, point) in points.rows().into_iter().enumerate() {
            self.insert(index, point);
        }
    }

    /// Inserts one point, updating count and center of mass along the path.
    fn insert(&mut self, index: usize, point: ArrayView1<T>) {
        let dims = self.dims;
        let mut node = NodeId::ROOT;

        loop {
            let slot = node.index();
            let offset = slot * dims;
            self.scratch
                .copy_from_slice(&self.mass_centers[offset..offset + dims]);
            let previous_count = self.nodes[slot].count;
            let count = previous_count + 1;
            self.nodes[slot].count = count;

            let weight = T::from_usize(count as usize);
            for (k, com) in self.mass_centers[offset..offset + dims].iter_mut().enumerate() {
                *com = if previous_count == 0 {
                    point[k]
                } else {
                    *com + (point[k] - *com) / weight
                };
            }

            let current = self.nodes[slot];
            if !current.first_child.is_none() {
                node = self.child_containing(node, point);
                continue;
            }

            if previous_count == 0 {
                self.nodes[slot].point = index as u32;
                return;
            }

            // Occupied leaf: aggregate coincident points and depth-guarded
            // leaves, otherwise split and push the previous occupant down.
            #[allow(clippy::float_cmp)]
            let coincident = (0..dims).all(|k| self.scratch[k] == point[k]);
            if coincident || current.depth >= MAX_DEPTH {
                return;
            }

            self.split(node);
            let first = self.nodes[slot].first_child;
            let occupant = NodeId::new(first.index() + self.slot_by(node, |k| self.scratch[k]));
            let occupant_slot = occupant.index();
            self.nodes[occupant_slot].count = previous_count;
            self.nodes[occupant_slot].point = current.point;
            self.mass_centers[occupant_slot * dims..(occupant_slot + 1) * dims]
                .copy_from_slice(&self.scratch);
            self.nodes[slot].point = Node::NO_POINT;

            node = self.child_containing(node, point);
        }
    }

    /// Allocates the `2^d` children of a leaf as one block.
    fn split(&mut self, node: NodeId) {
        let dims = self.dims;
        let slot = node.index();
        let first = NodeId::new(self.nodes.len());
        let depth = self.nodes[slot].depth + 1;
        let two = T::cast(2.0);

        for child in 0..self.fanout {
            self.nodes.push(Node::empty(depth));
            for k in 0..dims {
                let quarter = self.half_widths[slot * dims + k] / two;
                let parent_center = self.centers[slot * dims + k];
                let center = if child & (1 << k) != 0 {
                    parent_center + quarter
                } else {
                    parent_center - quarter
                };
                self.centers.push(center);
                self.half_widths.push(quarter);
                self.mass_centers.push(T::zero());
            }
        }

        self.nodes[slot].first_child = first;
    }

    /// Index of the child cell (`0..2^d`) of `node` that `point` falls into.
    ///
    /// Bit k is set when the point lies strictly above the cell center along
    /// dimension k.
    pub fn child_slot(&self, node: NodeId, point: ArrayView1<T>) -> usize {
        self.slot_by(node, |k| point[k])
    }

    fn slot_by<F: Fn(usize) -> T>(&self, node: NodeId, coordinate: F) -> usize {
        let offset = node.index() * self.dims;
        (0..self.dims).fold(0, |slot, k| {
            slot | (usize::from(coordinate(k) > self.centers[offset + k]) << k)
        })
    }

    fn child_containing(&self, node: NodeId, point: ArrayView1<T>) -> NodeId {
        let first = self.nodes[node.index()].first_child;
        NodeId::new(first.index() + self.child_slot(node, point))
    }

    /// Dimensionality of the indexed points.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no nodes (never built).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of points in the subtree rooted at `node`.
    pub fn count(&self, node: NodeId) -> usize {
        self.nodes[node.index()].count as usize
    }

    /// Whether `node` has no children.
    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.nodes[node.index()].first_child.is_none()
    }

    /// Depth of `node`; the root has depth zero.
    pub fn depth(&self, node: NodeId) -> u16 {
        self.nodes[node.index()].depth
    }

    /// Index of the first point stored in a leaf, if any.
    pub fn point(&self, node: NodeId) -> Option<usize> {
        let point = self.nodes[node.index()].point;
        (point != Node::NO_POINT).then_some(point as usize)
    }

    /// Center of mass of the subtree rooted at `node`.
    pub fn center_of_mass(&self, node: NodeId) -> &[T] {
        let offset = node.index() * self.dims;
        &self.mass_centers[offset..offset + self.dims]
    }

    /// Geometric center of the cell.
    pub fn center(&self, node: NodeId) -> &[T] {
        let offset = node.index() * self.dims;
        &self.centers[offset..offset + self.dims]
    }

    /// Per-dimension half-widths of the cell.
    pub fn half_widths(&self, node: NodeId) -> &[T] {
        let offset = node.index() * self.dims;
        &self.half_widths[offset..offset + self.dims]
    }

    /// Largest half-width of the cell.
    pub fn max_half_width(&self, node: NodeId) -> T {
        self.half_widths(node)
            .iter()
            .fold(T::zero(), |acc, &w| acc.max(w))
    }

    /// Children of `node`, or `None` for a leaf.
    pub fn children(&self, node: NodeId) -> Option<impl Iterator<Item = NodeId>> {
        let first = self.nodes[node.index()].first_child;
        (!first.is_none()).then(|| (0..self.fanout).map(move |c| NodeId::new(first.index() + c)))
    }
}
