use crate::balancer::{Balancer, BalancerConfig, ImbalanceMetric, UpdateOutcome};
use crate::comm::SelfComm;
use crate::partition::Partitioning;
use crate::points::PointSet;
use crate::Real;
use wasm_bindgen::prelude::*;

#[cfg(target_arch = "wasm32")]
use wasm_bindgen_rayon::init_thread_pool;

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn init_threads(n: usize) -> js_sys::Promise {
    init_thread_pool(n)
}

#[wasm_bindgen(typescript_custom_section)]
const TS_CONSTANTS_PARTITIONING: &'static str = r#"
export const PART_RADIX = 0;
export const PART_RCB = 1;
"#;

/// Single-worker load balancer for JavaScript.
///
/// Points are passed as flat `[x, y, z, x, y, z, ...]` arrays. With a single worker the
/// imbalance is measured over the partition regions, so `update` rebuilds whenever the
/// points drift into an uneven split.
#[wasm_bindgen]
pub struct LoadBalancer {
    inner: Balancer<SelfComm>,
}

#[wasm_bindgen]
impl LoadBalancer {
    /// Creates a balancer over `ntasks` regions; `part` is `PART_RADIX` or `PART_RCB`.
    #[wasm_bindgen(constructor)]
    pub fn new(ntasks: usize, points: Vec<Real>, cutoff: usize, epsilon: Real, part: u32) -> Result<LoadBalancer, JsError> {
        let part = match part {
            0 => Partitioning::Radix,
            1 => Partitioning::Rcb,
            other => return Err(JsError::new(&format!("unknown partitioning {}", other))),
        };
        let config = BalancerConfig {
            ntasks,
            cutoff,
            epsilon,
            part,
            metric: ImbalanceMetric::TaskLoad,
        };
        let points = PointSet::from_interleaved(&points)?;
        Ok(LoadBalancer {
            inner: Balancer::create(SelfComm, config, &points)?,
        })
    }

    #[wasm_bindgen(js_name = pointAssign)]
    pub fn point_assign(&self, x: Real, y: Real, z: Real) -> usize {
        self.inner.point_assign([x, y, z])
    }

    /// Returns the distinct regions overlapping the box, ascending.
    #[allow(clippy::too_many_arguments)]
    #[wasm_bindgen(js_name = boxAssign)]
    pub fn box_assign(&self, lo_x: Real, lo_y: Real, lo_z: Real, hi_x: Real, hi_y: Real, hi_z: Real) -> Vec<u32> {
        self.inner
            .box_ranks([lo_x, lo_y, lo_z], [hi_x, hi_y, hi_z])
            .into_iter()
            .map(|rank| rank as u32)
            .collect()
    }

    /// Region of every point in a flat coordinate array.
    #[wasm_bindgen(js_name = assignPoints)]
    pub fn assign_points(&self, points: Vec<Real>) -> Result<Vec<u32>, JsError> {
        let points = PointSet::from_interleaved(&points)?;
        Ok(self.inner.assign_points(&points).into_iter().map(|rank| rank as u32).collect())
    }

    /// Replaces the points; returns `true` if the partition was rebuilt.
    pub fn update(&mut self, points: Vec<Real>) -> Result<bool, JsError> {
        let points = PointSet::from_interleaved(&points)?;
        Ok(self.inner.update(&points)? == UpdateOutcome::Rebuilt)
    }

    #[wasm_bindgen(getter)]
    pub fn imbalance(&self) -> Real {
        self.inner.imbalance()
    }

    #[wasm_bindgen(getter)]
    pub fn npoint(&self) -> usize {
        self.inner.npoint()
    }

    #[wasm_bindgen(getter)]
    pub fn ntasks(&self) -> usize {
        self.inner.ntasks()
    }

    #[wasm_bindgen(getter)]
    pub fn rebuilds(&self) -> usize {
        self.inner.rebuilds()
    }
}
