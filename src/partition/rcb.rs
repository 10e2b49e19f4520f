use crate::bounds::BoundingBox;
use crate::comm::{Communicator, ReduceOp};
use crate::error::BalanceError;
use crate::partition::{ceil_log2, RankIndex};
use crate::points::PointSet;
use crate::Real;
use log::{debug, trace};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::ops::Range;

// Split candidates evaluated per collective round of the median search.
const PROBES: usize = 7;
const MAX_ROUNDS: usize = 48;

#[derive(Clone, Copy, Debug, PartialEq)]
enum RcbNode {
    Split {
        axis: u8,
        coord: Real,
        lower: u32,
        upper: u32,
    },
    Leaf {
        bounds: BoundingBox,
        rank: usize,
        surplus: bool,
    },
}

/// A leaf region of an [`RcbTree`] and the task owning it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Leaf {
    pub bounds: BoundingBox,
    pub rank: usize,
    /// Zero-width leaf of slots beyond `ntasks`; it owns no points and no box reaches it.
    pub surplus: bool,
}

/// Recursive coordinate bisection of the global bounding box.
///
/// The tree is complete: it has `2^d` leaves for `d = min(cutoff, ceil(log2(ntasks)))`.
/// Leaf slot `i` is owned by task `i`. Every split divides the points of a region in
/// proportion to the tasks below each side, so with a non-power-of-two task count the
/// surplus slots at the end weigh nothing: their split lies on the region's upper face and
/// they become zero-width leaves owned by the last task. Points exactly on a split plane
/// belong to the lower side, so surplus leaves own no points and box queries skip them.
#[derive(Clone, Debug, PartialEq)]
pub struct RcbTree {
    nodes: Vec<RcbNode>,
    root: u32,
    bounds: BoundingBox,
    ntasks: usize,
    depth: usize,
}

struct Builder<'a, C> {
    points: &'a PointSet,
    comm: &'a C,
    ntasks: usize,
    nodes: Vec<RcbNode>,
}

impl RcbTree {
    /// Bisects `bounds` over every worker's local points (collective).
    pub fn build<C: Communicator>(
        points: &PointSet,
        bounds: BoundingBox,
        ntasks: usize,
        cutoff: usize,
        comm: &C,
    ) -> Result<Self, BalanceError> {
        let full_depth = ceil_log2(ntasks);
        let depth = cutoff.min(full_depth);

        let mut nodes = Vec::new();
        nodes.try_reserve_exact((1usize << depth) * 2 - 1)?;

        let mut total = [points.len() as u64];
        comm.all_reduce_count(&mut total, ReduceOp::Sum);

        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut builder = Builder { points, comm, ntasks, nodes };
        let root = builder.node(bounds, 0..(1 << full_depth), depth, total[0], &mut indices);
        debug!(
            "rcb partition: {} points, {} tasks, depth {}, {} nodes",
            total[0],
            ntasks,
            depth,
            builder.nodes.len()
        );

        Ok(Self {
            nodes: builder.nodes,
            root,
            bounds,
            ntasks,
            depth,
        })
    }

    /// Depth of every leaf.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Leaves in ascending slot order.
    pub fn leaves(&self) -> impl Iterator<Item = Leaf> + '_ {
        self.nodes.iter().filter_map(|node| match *node {
            RcbNode::Leaf { bounds, rank, surplus } => Some(Leaf { bounds, rank, surplus }),
            RcbNode::Split { .. } => None,
        })
    }

    fn visit<F>(&self, node: u32, query: &BoundingBox, visitor: &mut F)
    where
        F: FnMut(usize),
    {
        match self.nodes[node as usize] {
            RcbNode::Split { axis, coord, lower, upper } => {
                let axis = axis as usize;
                if query.min[axis] <= coord {
                    self.visit(lower, query, visitor);
                }
                if query.max[axis] >= coord {
                    self.visit(upper, query, visitor);
                }
            }
            RcbNode::Leaf { bounds, rank, surplus } => {
                if !surplus && bounds.intersects(query) {
                    visitor(rank);
                }
            }
        }
    }
}

impl RankIndex for RcbTree {
    fn ntasks(&self) -> usize {
        self.ntasks
    }

    fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    fn point_assign(&self, point: [Real; 3]) -> usize {
        let p = self.bounds.clamp(point);
        let mut node = self.root;
        loop {
            match self.nodes[node as usize] {
                RcbNode::Split { axis, coord, lower, upper } => {
                    node = if p[axis as usize] <= coord { lower } else { upper };
                }
                RcbNode::Leaf { rank, .. } => return rank,
            }
        }
    }

    fn visit_box<F>(&self, lo: [Real; 3], hi: [Real; 3], mut visitor: F)
    where
        F: FnMut(usize),
    {
        self.visit(self.root, &BoundingBox::new(lo, hi), &mut visitor);
    }
}

impl<C: Communicator> Builder<'_, C> {
    // Children are pushed before their parent, so the root is the last node.
    fn node(&mut self, region: BoundingBox, slots: Range<usize>, levels: usize, total: u64, indices: &mut [usize]) -> u32 {
        if levels == 0 {
            let rank = slots.start.min(self.ntasks - 1);
            let surplus = self.tasks_in(&slots) == 0;
            return self.push(RcbNode::Leaf { bounds: region, rank, surplus });
        }

        let mid = slots.start + slots.len() / 2;
        let lower_slots = slots.start..mid;
        let upper_slots = mid..slots.end;
        let lower_tasks = self.tasks_in(&lower_slots);
        let upper_tasks = self.tasks_in(&upper_slots);

        let axis = region.longest_axis();
        let (coord, lower_total) = if upper_tasks == 0 {
            (region.max[axis], total)
        } else {
            let weight = (lower_tasks + upper_tasks) as u128;
            let target = ((total as u128 * lower_tasks as u128 + weight / 2) / weight) as u64;
            let fraction = lower_tasks as Real / (lower_tasks + upper_tasks) as Real;
            self.find_split(indices, axis, region.min[axis], region.max[axis], target, total, fraction)
        };

        let coords = self.points.axis(axis);
        let mut split = 0;
        for j in 0..indices.len() {
            if coords[indices[j]] <= coord {
                indices.swap(split, j);
                split += 1;
            }
        }
        let (lower_indices, upper_indices) = indices.split_at_mut(split);
        let (lower_region, upper_region) = region.split(axis, coord);

        let lower = self.node(lower_region, lower_slots, levels - 1, lower_total, lower_indices);
        let upper = self.node(upper_region, upper_slots, levels - 1, total - lower_total, upper_indices);
        self.push(RcbNode::Split { axis: axis as u8, coord, lower, upper })
    }

    fn push(&mut self, node: RcbNode) -> u32 {
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn tasks_in(&self, slots: &Range<usize>) -> usize {
        slots.end.min(self.ntasks).saturating_sub(slots.start)
    }

    /// Finds a coordinate along `axis` in `[lo, hi]` with about `target` of the region's
    /// `total` points at or below it, and returns it with the exact global count there.
    ///
    /// Each round counts the points below `PROBES` evenly spaced candidates with one
    /// collective reduction and narrows the bracket around the target, until a candidate is
    /// within one point of it or the bracket reaches rounding precision. An empty region is
    /// cut geometrically at `fraction` of its extent.
    #[allow(clippy::too_many_arguments)]
    fn find_split(
        &self,
        indices: &[usize],
        axis: usize,
        lo: Real,
        hi: Real,
        target: u64,
        total: u64,
        fraction: Real,
    ) -> (Real, u64) {
        if total == 0 {
            return (lo + (hi - lo) * fraction, 0);
        }
        if target >= total || hi <= lo {
            return (hi, total);
        }

        let coords = self.points.axis(axis);
        let mut sorted: Vec<Real> = indices.iter().map(|&i| coords[i]).collect();
        sorted.par_sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let tolerance = (hi - lo) * Real::EPSILON * 4.0;
        let (mut a, mut count_a) = (lo, None);
        let (mut b, mut count_b) = (hi, total);
        for round in 0..MAX_ROUNDS {
            let probes: Vec<Real> = (1..=PROBES)
                .map(|k| a + (b - a) * (k as Real / (PROBES + 1) as Real))
                .collect();
            let counts = self.comm.count_at_most(&sorted, &probes);
            trace!("rcb median round {}: bracket [{}, {}], counts {:?}, target {}", round, a, b, counts, target);

            let hit = counts
                .iter()
                .enumerate()
                .filter(|&(_, &c)| c.abs_diff(target) <= 1)
                .min_by_key(|&(_, &c)| c.abs_diff(target));
            if let Some((k, &c)) = hit {
                return (probes[k], c);
            }

            let above = counts.partition_point(|&c| c < target);
            if above > 0 {
                a = probes[above - 1];
                count_a = Some(counts[above - 1]);
            }
            if above < PROBES {
                b = probes[above];
                count_b = counts[above];
            }
            if b - a <= tolerance {
                break;
            }
        }

        match count_a {
            Some(c) if target - c < count_b - target => (a, c),
            _ => (b, count_b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;
    use crate::partition::Partition;

    fn line(count: usize) -> PointSet {
        let mut points = PointSet::default();
        for i in 0..count {
            points.push([i as Real + 0.5, 0.5, 0.5]);
        }
        points
    }

    #[test]
    fn test_power_of_two_split() {
        let points = line(100);
        let bounds = BoundingBox::new([0.0; 3], [100.0, 1.0, 1.0]);
        let tree = RcbTree::build(&points, bounds, 4, 2, &SelfComm).unwrap();

        let mut loads = [0usize; 4];
        for p in points.iter() {
            loads[tree.point_assign(p)] += 1;
        }
        for load in loads {
            assert!((24..=26).contains(&load), "loads {:?}", loads);
        }
        assert_eq!(tree.leaves().count(), 4);
    }

    #[test]
    fn test_surplus_leaves_are_empty_and_last() {
        let points = line(90);
        let bounds = BoundingBox::new([0.0; 3], [90.0, 1.0, 1.0]);
        let tree = RcbTree::build(&points, bounds, 3, 2, &SelfComm).unwrap();

        let leaves: Vec<Leaf> = tree.leaves().collect();
        assert_eq!(leaves.len(), 4);
        let ranks: Vec<usize> = leaves.iter().map(|l| l.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2, 2]);
        let flags: Vec<bool> = leaves.iter().map(|l| l.surplus).collect();
        assert_eq!(flags, vec![false, false, false, true]);
        let surplus = leaves[3].bounds;
        assert_eq!(surplus.extent(0), 0.0);
        assert_eq!(surplus.min[0], 90.0);

        let mut loads = [0usize; 3];
        for p in points.iter() {
            loads[tree.point_assign(p)] += 1;
        }
        for load in loads {
            assert!((29..=31).contains(&load), "loads {:?}", loads);
        }
    }

    #[test]
    fn test_touching_box_reports_both_sides() {
        let points = line(100);
        let bounds = BoundingBox::new([0.0; 3], [100.0, 1.0, 1.0]);
        let tree = RcbTree::build(&points, bounds, 2, 1, &SelfComm).unwrap();
        let c = tree.leaves().next().unwrap().bounds.max[0];
        let partition = Partition::Rcb(tree);

        assert_eq!(partition.box_ranks([c, 0.2, 0.2], [c + 5.0, 0.8, 0.8]), vec![0, 1]);
        assert_eq!(partition.box_ranks([c - 5.0, 0.2, 0.2], [c, 0.8, 0.8]), vec![0, 1]);
        assert_eq!(partition.box_ranks([c - 5.0, 0.2, 0.2], [c - 1.0, 0.8, 0.8]), vec![0]);
        assert_eq!(partition.box_ranks([c + 1.0, 0.2, 0.2], [c + 5.0, 0.8, 0.8]), vec![1]);
    }

    #[test]
    fn test_surplus_face_is_not_reported() {
        // A 24 x 5 grid: the surplus split lies on x = 24, while the last two real tasks
        // divide their slab along y.
        let mut points = PointSet::default();
        for i in 0..24 {
            for j in 0..5 {
                points.push([i as Real + 0.5, j as Real + 0.5, 0.5]);
            }
        }
        let bounds = BoundingBox::new([0.0; 3], [24.0, 5.0, 1.0]);
        let tree = RcbTree::build(&points, bounds, 12, 4, &SelfComm).unwrap();
        assert_eq!(tree.leaves().filter(|l| l.surplus).count(), 4);
        assert!(tree.leaves().filter(|l| l.surplus).all(|l| l.bounds.extent(0) == 0.0));

        let partition = Partition::Rcb(tree);
        assert_eq!(partition.point_assign([24.0, 0.75, 0.5]), 10);
        assert_eq!(partition.point_assign([24.0, 4.25, 0.5]), 11);
        assert_eq!(partition.box_ranks([23.5, 0.5, 0.2], [24.5, 1.0, 0.8]), vec![10]);
        assert_eq!(partition.box_ranks([23.5, 4.0, 0.2], [24.5, 4.5, 0.8]), vec![11]);
    }

    #[test]
    fn test_coincident_points() {
        let mut points = PointSet::default();
        for _ in 0..50 {
            points.push([2.0, 2.0, 2.0]);
        }
        let bounds = BoundingBox::new([2.0; 3], [2.0; 3]);
        let tree = RcbTree::build(&points, bounds, 4, 2, &SelfComm).unwrap();
        assert_eq!(tree.leaves().count(), 4);
        let rank = tree.point_assign([2.0, 2.0, 2.0]);
        assert!(rank < 4);
    }

    #[test]
    fn test_empty_region_splits_geometrically() {
        let bounds = BoundingBox::new([0.0; 3], [8.0, 1.0, 1.0]);
        let tree = RcbTree::build(&PointSet::default(), bounds, 4, 2, &SelfComm).unwrap();
        assert_eq!(tree.point_assign([1.0, 0.5, 0.5]), 0);
        assert_eq!(tree.point_assign([3.0, 0.5, 0.5]), 1);
        assert_eq!(tree.point_assign([5.0, 0.5, 0.5]), 2);
        assert_eq!(tree.point_assign([7.0, 0.5, 0.5]), 3);
    }

    #[test]
    fn test_capped_depth_leaves_tasks_unowned() {
        let points = line(64);
        let bounds = BoundingBox::new([0.0; 3], [64.0, 1.0, 1.0]);
        let tree = RcbTree::build(&points, bounds, 8, 1, &SelfComm).unwrap();
        let ranks: Vec<usize> = tree.leaves().map(|l| l.rank).collect();
        assert_eq!(ranks, vec![0, 4]);
    }
}
