use crate::comm::{Communicator, ReduceOp};
use crate::error::BalanceError;
use crate::extent::global_bounds;
use crate::morton::MortonEncoder;
use crate::partition::radix::select_cuts;
use crate::partition::{Partition, Partitioning};
use crate::points::PointSet;
use crate::Real;
use log::{debug, info};
use rayon::prelude::*;
use std::sync::Arc;

/// Load vector the imbalance ratio is computed from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImbalanceMetric {
    /// Local point count of every worker.
    #[default]
    WorkerLoad,
    /// Global point count of every partition region, as assigned by the current partition.
    TaskLoad,
}

/// Balancer settings, fixed for the lifetime of a [`Balancer`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BalancerConfig {
    /// Number of tasks (partition regions); `0` uses the number of workers.
    pub ntasks: usize,
    /// Radix key bits or RCB depth; `0` selects [`Partitioning::default_cutoff`].
    pub cutoff: usize,
    /// Rebuild when the imbalance exceeds `1 + epsilon`.
    pub epsilon: Real,
    pub part: Partitioning,
    pub metric: ImbalanceMetric,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            ntasks: 0,
            cutoff: 0,
            epsilon: 0.1,
            part: Partitioning::default(),
            metric: ImbalanceMetric::default(),
        }
    }
}

impl BalancerConfig {
    pub fn new(part: Partitioning) -> Self {
        Self { part, ..Self::default() }
    }

    pub fn with_ntasks(mut self, ntasks: usize) -> Self {
        self.ntasks = ntasks;
        self
    }

    pub fn with_cutoff(mut self, cutoff: usize) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_epsilon(mut self, epsilon: Real) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_metric(mut self, metric: ImbalanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Checks the settings and replaces `0` defaults by concrete values.
    fn resolve(mut self, workers: usize) -> Result<Self, BalanceError> {
        if self.epsilon.is_nan() || self.epsilon < 0.0 {
            return Err(BalanceError::InvalidEpsilon(self.epsilon));
        }
        if self.ntasks == 0 {
            self.ntasks = workers.max(1);
        }
        let max = self.part.max_cutoff();
        if self.cutoff > max {
            return Err(BalanceError::InvalidCutoff { cutoff: self.cutoff, max });
        }
        if self.cutoff == 0 {
            self.cutoff = self.part.default_cutoff(self.ntasks);
        }
        Ok(self)
    }
}

/// What an [`Balancer::update`] call did to the partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The imbalance was within bounds; the partition is unchanged.
    Unchanged,
    /// The partition was rebuilt from the new points.
    Rebuilt,
}

/// A dynamic load balancer shared by all workers of a communicator.
///
/// [`Balancer::create`] and [`Balancer::update`] are collective: every worker calls them
/// in the same order. Queries are local and read the most recently published partition.
/// A rebuilt partition is constructed completely before it replaces the old one, and
/// snapshots taken with [`Balancer::snapshot`] stay valid after the replacement.
///
/// A rebuild only happens when the global load vector differs from the one the current
/// partition was built for, so an imbalance that rebuilding cannot remove is not chased.
#[derive(Debug)]
pub struct Balancer<C: Communicator> {
    comm: C,
    config: BalancerConfig,
    partition: Arc<Partition>,
    // Global loads measured when the current partition was published.
    settled: Vec<u64>,
    imbalance: Real,
    npoint: usize,
    rebuilds: usize,
}

impl<C: Communicator> Balancer<C> {
    /// Validates the configuration and builds the initial partition from the local points
    /// of every worker (collective).
    pub fn create(comm: C, config: BalancerConfig, points: &PointSet) -> Result<Self, BalanceError> {
        let config = config.resolve(comm.size())?;
        let partition = build_partition(&comm, &config, points)?;
        debug!(
            "worker {}/{}: created {:?} balancer with {} tasks, cutoff {}",
            comm.rank(),
            comm.size(),
            config.part,
            config.ntasks,
            config.cutoff
        );

        let mut balancer = Self {
            comm,
            config,
            partition: Arc::new(partition),
            settled: Vec::new(),
            imbalance: 1.0,
            npoint: points.len(),
            rebuilds: 0,
        };
        balancer.settled = balancer.loads(points);
        balancer.imbalance = imbalance_ratio(&balancer.settled);
        Ok(balancer)
    }

    /// Owner of `point`; points outside the global bounds are clamped onto them.
    pub fn point_assign(&self, point: [Real; 3]) -> usize {
        self.partition.point_assign(point)
    }

    /// Owners of all local points, computed in parallel.
    pub fn assign_points(&self, points: &PointSet) -> Vec<usize> {
        let partition = &*self.partition;
        (0..points.len())
            .into_par_iter()
            .map(|i| partition.point_assign(points.point(i)))
            .collect()
    }

    /// Writes the distinct owners of the box `[lo, hi]` into `ranks` and returns their number.
    ///
    /// `ranks` must hold at least [`Balancer::ntasks`] entries.
    pub fn box_assign(&self, lo: [Real; 3], hi: [Real; 3], ranks: &mut [usize]) -> Result<usize, BalanceError> {
        self.partition.box_assign(lo, hi, ranks)
    }

    /// Distinct owners of the box `[lo, hi]`, ascending.
    pub fn box_ranks(&self, lo: [Real; 3], hi: [Real; 3]) -> Vec<usize> {
        self.partition.box_ranks(lo, hi)
    }

    /// Replaces the local point set and rebuilds the partition if the load imbalance
    /// exceeds `1 + epsilon` (collective).
    ///
    /// Loads identical to those the current partition was built for never trigger a
    /// rebuild, so repeated calls with an unchanged distribution are idempotent.
    /// On error the previous partition stays published.
    pub fn update(&mut self, points: &PointSet) -> Result<UpdateOutcome, BalanceError> {
        self.npoint = points.len();
        let loads = self.loads(points);
        let imbalance = imbalance_ratio(&loads);
        self.imbalance = imbalance;

        if imbalance <= 1.0 + self.config.epsilon {
            debug!("worker {}: imbalance {:.4} within threshold", self.comm.rank(), imbalance);
            return Ok(UpdateOutcome::Unchanged);
        }
        if loads == self.settled {
            debug!(
                "worker {}: imbalance {:.4} unchanged since the partition was built",
                self.comm.rank(),
                imbalance
            );
            return Ok(UpdateOutcome::Unchanged);
        }

        info!(
            "worker {}: imbalance {:.4} exceeds {:.4}, rebuilding {:?} partition",
            self.comm.rank(),
            imbalance,
            1.0 + self.config.epsilon,
            self.config.part
        );
        let partition = build_partition(&self.comm, &self.config, points)?;
        self.partition = Arc::new(partition);
        self.rebuilds += 1;
        self.settled = match self.config.metric {
            ImbalanceMetric::WorkerLoad => loads,
            ImbalanceMetric::TaskLoad => self.loads(points),
        };
        self.imbalance = imbalance_ratio(&self.settled);
        Ok(UpdateOutcome::Rebuilt)
    }

    /// Releases the partition and all balancer state.
    pub fn destroy(self) {}

    /// Imbalance ratio computed by the last `create` or `update`.
    pub fn imbalance(&self) -> Real {
        self.imbalance
    }

    /// Local point count passed to the last `create` or `update`.
    pub fn npoint(&self) -> usize {
        self.npoint
    }

    /// Number of rebuilds performed by `update`.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    pub fn ntasks(&self) -> usize {
        self.config.ntasks
    }

    pub fn cutoff(&self) -> usize {
        self.config.cutoff
    }

    pub fn epsilon(&self) -> Real {
        self.config.epsilon
    }

    pub fn partitioning(&self) -> Partitioning {
        self.config.part
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// The currently published partition.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// A shared handle on the currently published partition.
    pub fn snapshot(&self) -> Arc<Partition> {
        Arc::clone(&self.partition)
    }

    // Collective: one reduction of the configured load vector.
    fn loads(&self, points: &PointSet) -> Vec<u64> {
        let mut loads = match self.config.metric {
            ImbalanceMetric::WorkerLoad => {
                let mut loads = vec![0u64; self.comm.size()];
                loads[self.comm.rank()] = points.len() as u64;
                loads
            }
            ImbalanceMetric::TaskLoad => {
                let mut loads = vec![0u64; self.config.ntasks];
                for rank in self.assign_points(points) {
                    loads[rank] += 1;
                }
                loads
            }
        };
        self.comm.all_reduce_count(&mut loads, ReduceOp::Sum);
        loads
    }
}

fn build_partition<C: Communicator>(comm: &C, config: &BalancerConfig, points: &PointSet) -> Result<Partition, BalanceError> {
    let bounds = global_bounds(points, comm);
    Partition::build(config.part, points, bounds, config.ntasks, config.cutoff, comm)
}

/// Largest load divided by the mean load; `1.0` when there is no load at all.
pub fn imbalance_ratio(loads: &[u64]) -> Real {
    let total: u64 = loads.iter().sum();
    if total == 0 {
        return 1.0;
    }
    let max = loads.iter().copied().max().unwrap_or(0);
    let mean = total as Real / loads.len() as Real;
    max as Real / mean
}

/// Assigns every local point a worker in `0..comm.size()` by cutting the global Morton
/// order into runs of equal count (collective).
///
/// The cuts are exact keys, so a dense cluster is divided like any other run of points.
pub fn morton_balance<C: Communicator>(comm: &C, points: &PointSet) -> Result<Vec<usize>, BalanceError> {
    let encoder = MortonEncoder::new(global_bounds(points, comm));
    let mut keys: Vec<u64> = Vec::new();
    keys.try_reserve_exact(points.len())?;
    keys.par_extend((0..points.len()).into_par_iter().map(|i| encoder.encode(points.point(i))));

    let mut sorted: Vec<u64> = Vec::new();
    sorted.try_reserve_exact(keys.len())?;
    sorted.extend_from_slice(&keys);
    sorted.par_sort_unstable();

    let cuts = select_cuts(&sorted, comm.size(), comm);
    Ok(keys
        .into_par_iter()
        .map(|key| cuts.partition_point(|&c| c <= key))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;

    #[test]
    fn test_imbalance_ratio() {
        assert_eq!(imbalance_ratio(&[0, 0, 0]), 1.0);
        assert_eq!(imbalance_ratio(&[10, 10]), 1.0);
        assert!((imbalance_ratio(&[300, 100, 100]) - 1.8).abs() < 1e-6);
    }

    #[test]
    fn test_config_validation() {
        let points = PointSet::default();
        let negative = BalancerConfig::default().with_epsilon(-0.5);
        assert!(matches!(Balancer::create(SelfComm, negative, &points), Err(BalanceError::InvalidEpsilon(_))));

        let nan = BalancerConfig::default().with_epsilon(Real::NAN);
        assert!(Balancer::create(SelfComm, nan, &points).is_err());

        let deep = BalancerConfig::new(Partitioning::Radix).with_cutoff(40);
        assert!(matches!(
            Balancer::create(SelfComm, deep, &points),
            Err(BalanceError::InvalidCutoff { cutoff: 40, .. })
        ));
    }

    #[test]
    fn test_defaults_resolved() {
        let points = PointSet::from_interleaved(&[0.0, 0.0, 0.0]).unwrap();
        let lb = Balancer::create(SelfComm, BalancerConfig::default(), &points).unwrap();
        assert_eq!(lb.ntasks(), 1);
        assert_eq!(lb.cutoff(), 0);
        assert_eq!(lb.point_assign([5.0, 5.0, 5.0]), 0);

        let radix = BalancerConfig::new(Partitioning::Radix).with_ntasks(4);
        let lb = Balancer::create(SelfComm, radix, &points).unwrap();
        assert_eq!(lb.cutoff(), crate::partition::DEFAULT_RADIX_BITS);
        lb.destroy();
    }

    #[test]
    fn test_morton_balance_single_worker() {
        let points = PointSet::from_interleaved(&[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(morton_balance(&SelfComm, &points).unwrap(), vec![0, 0]);
    }
}
