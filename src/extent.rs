use crate::bounds::BoundingBox;
use crate::comm::{Communicator, ReduceOp};
use crate::points::PointSet;

/// Combines every worker's local bounding box into the global one (collective).
///
/// A worker without points contributes the empty box, which leaves the reduction
/// unchanged. If no worker holds a point the result is the zero-size box at the origin.
pub fn global_bounds<C: Communicator>(points: &PointSet, comm: &C) -> BoundingBox {
    let local = points.bounds();
    let mut min = local.min;
    let mut max = local.max;
    comm.all_reduce_real(&mut min, ReduceOp::Min);
    comm.all_reduce_real(&mut max, ReduceOp::Max);

    let bounds = BoundingBox::new(min, max);
    if bounds.is_empty() {
        BoundingBox::default()
    } else {
        bounds
    }
}
