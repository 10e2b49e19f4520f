//! Partition trees: the spatial index that maps points and boxes to owning workers.

use crate::bounds::BoundingBox;
use crate::comm::Communicator;
use crate::error::BalanceError;
use crate::points::PointSet;
use crate::Real;

pub mod radix;
pub mod rcb;

pub use radix::{RadixTree, Segment};
pub use rcb::{Leaf, RcbTree};

/// Largest accepted radix cutoff (leading key bits of the histogram buckets).
pub const MAX_RADIX_BITS: usize = 24;
/// Largest accepted RCB cutoff (tree depth).
pub const MAX_RCB_DEPTH: usize = 24;
/// Smallest default radix cutoff.
pub const DEFAULT_RADIX_BITS: usize = 15;

/// Algorithm used to build the partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Partitioning {
    /// Contiguous ranges of Morton-key space.
    Radix,
    /// Recursive coordinate bisection at weighted medians.
    #[default]
    Rcb,
}

impl Partitioning {
    /// Cutoff used when the configuration asks for the default (`0`).
    pub fn default_cutoff(self, ntasks: usize) -> usize {
        match self {
            Partitioning::Radix => (ceil_log2(ntasks) + 6).clamp(DEFAULT_RADIX_BITS, MAX_RADIX_BITS),
            Partitioning::Rcb => ceil_log2(ntasks).min(MAX_RCB_DEPTH),
        }
    }

    pub fn max_cutoff(self) -> usize {
        match self {
            Partitioning::Radix => MAX_RADIX_BITS,
            Partitioning::Rcb => MAX_RCB_DEPTH,
        }
    }
}

/// Read-only ownership queries shared by both partition shapes.
pub trait RankIndex {
    /// Number of tasks the partition was built for; every owner is below it.
    fn ntasks(&self) -> usize;

    /// Global bounding box the partition covers.
    fn bounds(&self) -> &BoundingBox;

    /// Owner of `point`. Points outside the bounds are clamped onto them first.
    fn point_assign(&self, point: [Real; 3]) -> usize;

    /// Calls `visitor` with the owner of every region intersecting the closed box `[lo, hi]`.
    ///
    /// `lo <= hi` on every axis. An owner may be reported more than once.
    fn visit_box<F>(&self, lo: [Real; 3], hi: [Real; 3], visitor: F)
    where
        F: FnMut(usize);
}

/// A built partition: one of the two tree shapes, immutable until replaced.
#[derive(Clone, Debug, PartialEq)]
pub enum Partition {
    Radix(RadixTree),
    Rcb(RcbTree),
}

impl Partition {
    /// Builds a partition of `bounds` for `ntasks` tasks from every worker's local points.
    ///
    /// Collective: all workers call this with the same `bounds`, `ntasks` and `cutoff`.
    pub fn build<C: Communicator>(
        kind: Partitioning,
        points: &PointSet,
        bounds: BoundingBox,
        ntasks: usize,
        cutoff: usize,
        comm: &C,
    ) -> Result<Partition, BalanceError> {
        let partition = match kind {
            Partitioning::Radix => Partition::Radix(RadixTree::build(points, bounds, ntasks, cutoff as u32, comm)?),
            Partitioning::Rcb => Partition::Rcb(RcbTree::build(points, bounds, ntasks, cutoff, comm)?),
        };
        Ok(partition)
    }

    pub fn kind(&self) -> Partitioning {
        match self {
            Partition::Radix(_) => Partitioning::Radix,
            Partition::Rcb(_) => Partitioning::Rcb,
        }
    }

    pub fn ntasks(&self) -> usize {
        match self {
            Partition::Radix(tree) => tree.ntasks(),
            Partition::Rcb(tree) => tree.ntasks(),
        }
    }

    pub fn bounds(&self) -> &BoundingBox {
        match self {
            Partition::Radix(tree) => tree.bounds(),
            Partition::Rcb(tree) => tree.bounds(),
        }
    }

    pub fn point_assign(&self, point: [Real; 3]) -> usize {
        match self {
            Partition::Radix(tree) => tree.point_assign(point),
            Partition::Rcb(tree) => tree.point_assign(point),
        }
    }

    /// Distinct owners of the regions intersecting the closed box spanned by `lo` and `hi`,
    /// in ascending order.
    ///
    /// Components given in the wrong order are swapped. A box that misses the global bounds
    /// has no owners, and a box collapsed to a single point has exactly the owner
    /// [`Partition::point_assign`] reports for it.
    pub fn box_ranks(&self, lo: [Real; 3], hi: [Real; 3]) -> Vec<usize> {
        let mut query = BoundingBox::new(lo, hi);
        for a in 0..3 {
            if query.min[a] > query.max[a] {
                std::mem::swap(&mut query.min[a], &mut query.max[a]);
            }
        }
        if !self.bounds().intersects(&query) {
            return Vec::new();
        }
        if query.min == query.max {
            return vec![self.point_assign(query.min)];
        }

        let mut seen = vec![false; self.ntasks()];
        let mut mark = |rank: usize| seen[rank] = true;
        match self {
            Partition::Radix(tree) => tree.visit_box(query.min, query.max, &mut mark),
            Partition::Rcb(tree) => tree.visit_box(query.min, query.max, &mut mark),
        }
        seen.iter()
            .enumerate()
            .filter_map(|(rank, &hit)| hit.then_some(rank))
            .collect()
    }

    /// Writes the owners found by [`Partition::box_ranks`] into `ranks` and returns their number.
    ///
    /// `ranks` must hold at least [`Partition::ntasks`] entries.
    pub fn box_assign(&self, lo: [Real; 3], hi: [Real; 3], ranks: &mut [usize]) -> Result<usize, BalanceError> {
        if ranks.len() < self.ntasks() {
            return Err(BalanceError::BufferTooSmall { needed: self.ntasks(), len: ranks.len() });
        }
        let owners = self.box_ranks(lo, hi);
        ranks[..owners.len()].copy_from_slice(&owners);
        Ok(owners.len())
    }
}

pub(crate) fn ceil_log2(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
    }

    #[test]
    fn test_default_cutoffs() {
        assert_eq!(Partitioning::Radix.default_cutoff(4), DEFAULT_RADIX_BITS);
        assert_eq!(Partitioning::Radix.default_cutoff(1 << 12), 18);
        assert_eq!(Partitioning::Rcb.default_cutoff(5), 3);
        assert_eq!(Partitioning::Rcb.default_cutoff(1), 0);
    }
}
