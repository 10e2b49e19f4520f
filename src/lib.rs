//! # dynbalance
//!
//! `dynbalance` assigns ownership of 3D points and axis-aligned boxes to the workers of a
//! domain-decomposed simulation, and keeps that assignment balanced while the points move.
//! It can be used natively with any collective-communication substrate, and compiled to
//! WebAssembly (WASM) as a single-worker balancer.
//!
//! ## Features
//!
//! - **Two partitions**: a flat Morton-order radix partition of the key space, or a
//!   recursive coordinate bisection (RCB) tree of weighted-median splits.
//! - **Local queries**: point and box ownership are answered from an immutable snapshot
//!   of the partition, without further communication.
//! - **Dynamic updates**: an imbalance monitor rebuilds the partition only when the load
//!   ratio exceeds `1 + epsilon`.
//! - **Pluggable collectives**: all coordination goes through the [`Communicator`] trait;
//!   [`SelfComm`] covers a single process and [`ThreadComm`] runs a worker group in-process.
//!
//! ## Main Interface
//!
//! The primary entry point is the [`Balancer`] struct:
//!
//! ```
//! use dynbalance::{Balancer, BalancerConfig, Partitioning, PointSet, SelfComm};
//!
//! let points = PointSet::from_interleaved(&[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
//! let config = BalancerConfig::new(Partitioning::Rcb).with_ntasks(2);
//! let lb = Balancer::create(SelfComm, config, &points).unwrap();
//! assert!(lb.point_assign([0.5, 0.5, 0.5]) < 2);
//! ```

mod balancer;
mod bounds;
pub mod comm;
mod error;
mod extent;
pub mod morton;
pub mod partition;
mod points;
mod wasm;

/// Floating point type of all coordinates.
#[cfg(not(feature = "single-precision"))]
pub type Real = f64;
/// Floating point type of all coordinates.
#[cfg(feature = "single-precision")]
pub type Real = f32;

pub use balancer::Balancer;
pub use balancer::BalancerConfig;
pub use balancer::ImbalanceMetric;
pub use balancer::UpdateOutcome;
pub use balancer::imbalance_ratio;
pub use balancer::morton_balance;
pub use bounds::BoundingBox;
pub use comm::Communicator;
pub use comm::ReduceOp;
pub use comm::SelfComm;
pub use comm::ThreadComm;
pub use error::BalanceError;
pub use extent::global_bounds;
pub use partition::Partition;
pub use partition::Partitioning;
pub use points::PointSet;
pub use wasm::LoadBalancer;
