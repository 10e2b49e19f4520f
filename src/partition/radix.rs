use crate::bounds::BoundingBox;
use crate::comm::{Communicator, ReduceOp};
use crate::error::BalanceError;
use crate::morton::{bucket, prefix_cell, prefix_range, MortonEncoder, KEY_BITS, KEY_END};
use crate::partition::RankIndex;
use crate::points::PointSet;
use crate::Real;
use log::{debug, warn};
use rayon::prelude::*;

// Key bits resolved per collective round of `select_cuts`.
const DIGIT_BITS: u32 = 9;

/// A partition of Morton-key space into one contiguous range per task.
///
/// Range boundaries sit on multiples of the histogram bucket width, i.e. they are
/// `bits`-bit key prefixes. A range may be empty, in which case its task owns no space.
#[derive(Clone, Debug, PartialEq)]
pub struct RadixTree {
    encoder: MortonEncoder,
    bits: u32,
    // boundaries[r]..boundaries[r + 1] is the key range of task r.
    boundaries: Vec<u64>,
}

/// The key range `[start, end)` owned by one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub rank: usize,
}

impl Segment {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, key: u64) -> bool {
        self.start <= key && key < self.end
    }
}

impl RadixTree {
    /// Builds the segments from the global histogram of `bits`-bit key prefixes (collective).
    pub fn build<C: Communicator>(
        points: &PointSet,
        bounds: BoundingBox,
        ntasks: usize,
        bits: u32,
        comm: &C,
    ) -> Result<Self, BalanceError> {
        let encoder = MortonEncoder::new(bounds);
        let buckets = 1usize << bits;

        let mut histogram: Vec<u64> = Vec::new();
        histogram.try_reserve_exact(buckets)?;
        histogram.resize(buckets, 0);

        let local: Vec<u64> = (0..points.len())
            .into_par_iter()
            .map(|i| bucket(encoder.encode(points.point(i)), bits))
            .collect();
        for b in local {
            histogram[b as usize] += 1;
        }
        comm.global_histogram(&mut histogram);

        let shift = KEY_BITS - bits;
        let boundaries: Vec<u64> = split_histogram(&histogram, ntasks)
            .into_iter()
            .map(|cut| (cut as u64) << shift)
            .collect();

        let tree = Self { encoder, bits, boundaries };
        let occupied = tree.segments().filter(|s| !s.is_empty()).count();
        let total: u64 = histogram.iter().sum();
        debug!("radix partition: {} points, {} buckets, {} of {} segments occupied", total, buckets, occupied, ntasks);
        if occupied < ntasks && total > 0 {
            warn!(
                "radix cutoff of {} bits leaves {} of {} tasks without key space",
                bits,
                ntasks - occupied,
                ntasks
            );
        }
        Ok(tree)
    }

    /// Number of leading key bits the segment boundaries are aligned to.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn encoder(&self) -> &MortonEncoder {
        &self.encoder
    }

    /// Segments in key order; segment `r` is owned by task `r`.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        self.boundaries
            .windows(2)
            .enumerate()
            .map(|(rank, w)| Segment { start: w[0], end: w[1], rank })
    }

    // Index of the last segment starting at or before `key`; never an empty one.
    fn segment_of(&self, key: u64) -> usize {
        self.boundaries.partition_point(|&b| b <= key) - 1
    }

    fn visit_cell<F>(&self, prefix: u64, depth: u32, lo: &[u32; 3], hi: &[u32; 3], visitor: &mut F)
    where
        F: FnMut(usize),
    {
        let (cell_lo, cell_hi) = prefix_cell(prefix, depth);
        if (0..3).any(|a| cell_hi[a] < lo[a] || cell_lo[a] > hi[a]) {
            return;
        }

        let (start, end) = prefix_range(prefix, depth);
        let first = self.segment_of(start);
        let last = self.boundaries.partition_point(|&b| b < end) - 1;
        if first == last || depth >= self.bits {
            for rank in first..=last {
                if self.boundaries[rank] < self.boundaries[rank + 1] {
                    visitor(rank);
                }
            }
            return;
        }

        self.visit_cell(prefix << 1, depth + 1, lo, hi, visitor);
        self.visit_cell(prefix << 1 | 1, depth + 1, lo, hi, visitor);
    }
}

impl RankIndex for RadixTree {
    fn ntasks(&self) -> usize {
        self.boundaries.len() - 1
    }

    fn bounds(&self) -> &BoundingBox {
        self.encoder.bounds()
    }

    fn point_assign(&self, point: [Real; 3]) -> usize {
        self.segment_of(self.encoder.encode(point))
    }

    fn visit_box<F>(&self, lo: [Real; 3], hi: [Real; 3], mut visitor: F)
    where
        F: FnMut(usize),
    {
        // Closed box: a low face on a cell edge also touches the cell below it.
        let qlo = self.encoder.quantize_lower(lo);
        let qhi = self.encoder.quantize(hi);
        self.visit_cell(0, 0, &qlo, &qhi, &mut visitor);
    }
}

/// Chooses `ntasks + 1` bucket boundaries `0 = c[0] <= c[1] <= ... <= c[ntasks] = len`
/// splitting a histogram into contiguous runs of near-equal count.
///
/// Cut `j` is placed where the cumulative count is closest to `j / ntasks` of the total.
/// Among equally close cuts (runs of empty buckets), the one minimizing the wider of this
/// segment and the average remaining segment wins, then the lowest one.
pub fn split_histogram(histogram: &[u64], ntasks: usize) -> Vec<usize> {
    let buckets = histogram.len();
    let mut cumulative = Vec::with_capacity(buckets + 1);
    let mut acc = 0u64;
    cumulative.push(acc);
    for &h in histogram {
        acc += h;
        cumulative.push(acc);
    }

    // Counts are compared scaled by ntasks to stay in integers.
    let n = ntasks as i128;
    let total = acc as i128;
    let scaled = |c: u64| c as i128 * n;

    let mut cuts = Vec::with_capacity(ntasks + 1);
    cuts.push(0);
    let mut prev = 0;
    for j in 1..ntasks {
        let target = total * j as i128;
        let window = &cumulative[prev..];

        let above = prev + window.partition_point(|&c| scaled(c) < target);
        let mut err = scaled(cumulative[above]) - target;
        if above > prev {
            err = err.min(target - scaled(cumulative[above - 1]));
        }
        let first = prev + window.partition_point(|&c| scaled(c) < target - err);
        let last = prev + window.partition_point(|&c| scaled(c) <= target + err) - 1;

        let remaining = (ntasks - j) as f64;
        let widest = |b: usize| ((b - prev) as f64).max((buckets - b) as f64 / remaining);
        let ideal = (prev as f64 * remaining + buckets as f64) / (remaining + 1.0);
        let mut cut = (ideal.floor() as usize).clamp(first, last);
        if cut < last && widest(cut + 1) < widest(cut) {
            cut += 1;
        }

        cuts.push(cut);
        prev = cut;
    }
    cuts.push(buckets);
    cuts
}

/// Finds the keys cutting the global key order into `ntasks` runs of near-equal count
/// (collective).
///
/// `sorted` holds this worker's keys in ascending order. Cut `j - 1` is the key of rank
/// `floor(j * total / ntasks)` in the global order, so task `t` owns the keys in
/// `[cuts[t - 1], cuts[t])` and `cuts.partition_point(|&c| c <= key)` is the owner of
/// `key`. Keys are resolved nine bits at a time, with one reduction per digit for all
/// cuts together. Equal keys are never split.
pub fn select_cuts<C: Communicator>(sorted: &[u64], ntasks: usize, comm: &C) -> Vec<u64> {
    let mut total = [sorted.len() as u64];
    comm.all_reduce_count(&mut total, ReduceOp::Sum);
    let total = total[0];
    if total == 0 || ntasks <= 1 {
        return vec![KEY_END; ntasks.saturating_sub(1)];
    }

    let targets: Vec<u64> = (1..ntasks)
        .map(|j| (total as u128 * j as u128 / ntasks as u128) as u64)
        .collect();
    // Every prefix holds the key its target rank falls on.
    let mut prefixes = vec![0u64; targets.len()];
    let mut resolved = 0;
    while resolved < KEY_BITS {
        let step = DIGIT_BITS.min(KEY_BITS - resolved);
        let rest = KEY_BITS - resolved - step;
        let digits = 1usize << step;

        // Last key below each extended prefix.
        let probes: Vec<u64> = prefixes
            .iter()
            .flat_map(|&prefix| (0..digits as u64).map(move |d| (((prefix << step | d) + 1) << rest) - 1))
            .collect();
        let counts = comm.count_at_most(sorted, &probes);
        for (j, prefix) in prefixes.iter_mut().enumerate() {
            let counts = &counts[j * digits..(j + 1) * digits];
            let digit = counts.partition_point(|&c| c <= targets[j]);
            *prefix = *prefix << step | digit as u64;
        }
        resolved += step;
    }

    debug!("morton cuts: {} keys, {} tasks, targets {:?}", total, ntasks, targets);
    prefixes
}
