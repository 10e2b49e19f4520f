//! Collective communication between the workers sharing one partition.
//!
//! Building a partition is a collective operation: every worker calls the same sequence of
//! reductions in the same order. The [`Communicator`] trait is the only coordination the
//! balancer needs. [`SelfComm`] covers a single process, and [`ThreadComm`] runs a group of
//! workers as threads of one process.

use crate::Real;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Element-wise combination applied by a reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

impl ReduceOp {
    fn combine_real(self, acc: &mut [Real], values: &[Real]) {
        for (a, &v) in acc.iter_mut().zip(values) {
            *a = match self {
                ReduceOp::Min => a.min(v),
                ReduceOp::Max => a.max(v),
                ReduceOp::Sum => *a + v,
            };
        }
    }

    fn combine_count(self, acc: &mut [u64], values: &[u64]) {
        for (a, &v) in acc.iter_mut().zip(values) {
            *a = match self {
                ReduceOp::Min => (*a).min(v),
                ReduceOp::Max => (*a).max(v),
                ReduceOp::Sum => *a + v,
            };
        }
    }
}

/// Collective reductions over all participating workers.
///
/// Every method is collective: all workers must call it with slices of the same length,
/// in the same order, or the group deadlocks. On return every worker holds the same result.
pub trait Communicator {
    /// Index of this worker in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of participating workers.
    fn size(&self) -> usize;

    /// Element-wise all-reduce of coordinates.
    fn all_reduce_real(&self, values: &mut [Real], op: ReduceOp);

    /// Element-wise all-reduce of counts.
    fn all_reduce_count(&self, values: &mut [u64], op: ReduceOp);

    /// Merges local histograms into the global one.
    fn global_histogram(&self, local: &mut [u64]) {
        self.all_reduce_count(local, ReduceOp::Sum);
    }

    /// Global number of values `<= probe` for each probe.
    ///
    /// `sorted` holds this worker's values in ascending order.
    fn count_at_most<T: PartialOrd + Copy>(&self, sorted: &[T], probes: &[T]) -> Vec<u64> {
        let mut counts: Vec<u64> = probes
            .iter()
            .map(|&x| sorted.partition_point(|&v| v <= x) as u64)
            .collect();
        self.all_reduce_count(&mut counts, ReduceOp::Sum);
        counts
    }
}

/// The trivial communicator of a single worker; every reduction is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_real(&self, _values: &mut [Real], _op: ReduceOp) {}

    fn all_reduce_count(&self, _values: &mut [u64], _op: ReduceOp) {}
}

/// One member of an in-process worker group.
///
/// Members rendezvous on a shared mutex: each reduction accumulates every member's
/// contribution, then releases all of them with the combined result. A reduction whose
/// length differs between members breaks the group and every member panics. A member that
/// leaves without joining a collective the others entered still leaves them waiting.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    round: Mutex<Round>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct Round {
    arrived: usize,
    // Members that have not yet read the finished round's result.
    pending: usize,
    generation: u64,
    broken: bool,
    reals: Vec<Real>,
    counts: Vec<u64>,
}

impl ThreadComm {
    /// Creates the members of a group of `size` workers, in rank order.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let shared = Arc::new(Shared {
            size,
            round: Mutex::new(Round::default()),
            cond: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm { rank, shared: Arc::clone(&shared) })
            .collect()
    }

    /// Runs `f` on `size` scoped threads, one per group member, and returns the results
    /// in rank order. A panicking worker is re-raised on the caller.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = Self::group(size)
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    // `contribute` returns false when the contribution does not fit the round.
    fn rendezvous(&self, contribute: impl FnOnce(&mut Round, bool) -> bool, read: impl FnOnce(&Round)) {
        let shared = &*self.shared;
        let mut round = shared.round.lock();
        while round.pending > 0 && !round.broken {
            shared.cond.wait(&mut round);
        }
        if round.broken {
            drop(round);
            panic!("worker {}: collective group broken by a mismatched reduction", self.rank);
        }

        let first = round.arrived == 0;
        if !contribute(&mut *round, first) {
            round.broken = true;
            shared.cond.notify_all();
            drop(round);
            panic!("worker {}: collective called with mismatched lengths", self.rank);
        }
        round.arrived += 1;

        let generation = round.generation;
        if round.arrived == shared.size {
            round.arrived = 0;
            round.pending = shared.size;
            round.generation += 1;
            shared.cond.notify_all();
        } else {
            while round.generation == generation && !round.broken {
                shared.cond.wait(&mut round);
            }
            if round.broken {
                drop(round);
                panic!("worker {}: collective group broken by a mismatched reduction", self.rank);
            }
        }

        read(&*round);
        round.pending -= 1;
        if round.pending == 0 {
            shared.cond.notify_all();
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_reduce_real(&self, values: &mut [Real], op: ReduceOp) {
        let local = values.to_vec();
        self.rendezvous(
            |round, first| {
                if first {
                    round.reals = local;
                } else if round.reals.len() == local.len() {
                    op.combine_real(&mut round.reals, &local);
                } else {
                    return false;
                }
                true
            },
            |round| values.copy_from_slice(&round.reals),
        );
    }

    fn all_reduce_count(&self, values: &mut [u64], op: ReduceOp) {
        let local = values.to_vec();
        self.rendezvous(
            |round, first| {
                if first {
                    round.counts = local;
                } else if round.counts.len() == local.len() {
                    op.combine_count(&mut round.counts, &local);
                } else {
                    return false;
                }
                true
            },
            |round| values.copy_from_slice(&round.counts),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_comm_is_identity() {
        let mut v = [3.0, -1.0];
        SelfComm.all_reduce_real(&mut v, ReduceOp::Min);
        assert_eq!(v, [3.0, -1.0]);
        assert_eq!(SelfComm.count_at_most(&[1.0, 2.0, 2.0, 5.0], &[0.0, 2.0, 9.0]), vec![0, 3, 4]);
    }

    #[test]
    fn test_thread_group_reductions() {
        let results = ThreadComm::run(4, |comm| {
            let r = comm.rank() as Real;
            let mut lo = [r, -r];
            comm.all_reduce_real(&mut lo, ReduceOp::Min);
            let mut hi = [r];
            comm.all_reduce_real(&mut hi, ReduceOp::Max);
            let mut sum = [comm.rank() as u64 + 1, 1];
            comm.all_reduce_count(&mut sum, ReduceOp::Sum);
            (lo, hi, sum)
        });
        assert_eq!(results.len(), 4);
        for (lo, hi, sum) in results {
            assert_eq!(lo, [0.0, -3.0]);
            assert_eq!(hi, [3.0]);
            assert_eq!(sum, [10, 4]);
        }
    }

    #[test]
    #[should_panic(expected = "mismatched")]
    fn test_mismatched_lengths_fail_every_member() {
        ThreadComm::run(3, |comm| {
            let mut v = vec![1u64; comm.rank() + 1];
            comm.all_reduce_count(&mut v, ReduceOp::Sum);
        });
    }

    #[test]
    fn test_count_at_most_keys() {
        let results = ThreadComm::run(2, |comm| {
            let sorted: Vec<u64> = if comm.rank() == 0 { vec![1, 4, 9] } else { vec![4, 5] };
            comm.count_at_most(&sorted, &[0, 4, 8, u64::MAX])
        });
        assert!(results.iter().all(|c| *c == vec![0, 3, 4, 5]));
    }

    #[test]
    fn test_thread_group_many_rounds() {
        // Back-to-back rounds must not mix contributions of different generations.
        let results = ThreadComm::run(3, |comm| {
            let mut total = 0;
            for i in 0..200u64 {
                let mut v = [i + comm.rank() as u64];
                comm.all_reduce_count(&mut v, ReduceOp::Sum);
                total += v[0];
            }
            total
        });
        let expected: u64 = (0..200u64).map(|i| 3 * i + 3).sum();
        assert!(results.iter().all(|&t| t == expected));
    }
}
