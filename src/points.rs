use crate::bounds::BoundingBox;
use crate::error::BalanceError;
use crate::Real;
use rand::Rng;

/// A worker's local points, stored as one coordinate array per axis.
///
/// A `PointSet` always owns its coordinates, so the balancer never keeps a reference to
/// caller memory past the call that received it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointSet {
    axes: [Vec<Real>; 3],
}

impl PointSet {
    /// Takes ownership of three same-length coordinate arrays.
    pub fn new(x: Vec<Real>, y: Vec<Real>, z: Vec<Real>) -> Result<Self, BalanceError> {
        if x.len() != y.len() || x.len() != z.len() {
            return Err(BalanceError::MismatchedAxes { x: x.len(), y: y.len(), z: z.len() });
        }
        Ok(Self { axes: [x, y, z] })
    }

    /// Copies three same-length coordinate slices.
    pub fn from_axes(x: &[Real], y: &[Real], z: &[Real]) -> Result<Self, BalanceError> {
        Self::new(x.to_vec(), y.to_vec(), z.to_vec())
    }

    /// Copies a flat `[x0, y0, z0, x1, y1, z1, ...]` buffer.
    pub fn from_interleaved(coords: &[Real]) -> Result<Self, BalanceError> {
        if coords.len() % 3 != 0 {
            return Err(BalanceError::InterleavedLength(coords.len()));
        }
        let count = coords.len() / 3;
        let mut axes = [Vec::with_capacity(count), Vec::with_capacity(count), Vec::with_capacity(count)];
        for p in coords.chunks_exact(3) {
            for a in 0..3 {
                axes[a].push(p[a]);
            }
        }
        Ok(Self { axes })
    }

    /// Draws `count` points uniformly inside `bounds`.
    pub fn random<R: Rng>(count: usize, bounds: &BoundingBox, rng: &mut R) -> Self {
        let mut axes = [Vec::with_capacity(count), Vec::with_capacity(count), Vec::with_capacity(count)];
        for _ in 0..count {
            for a in 0..3 {
                let v = if bounds.max[a] > bounds.min[a] {
                    rng.gen_range(bounds.min[a]..bounds.max[a])
                } else {
                    bounds.min[a]
                };
                axes[a].push(v);
            }
        }
        Self { axes }
    }

    pub fn len(&self) -> usize {
        self.axes[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes[0].is_empty()
    }

    /// Coordinates of all points along one axis.
    pub fn axis(&self, axis: usize) -> &[Real] {
        &self.axes[axis]
    }

    pub fn point(&self, index: usize) -> [Real; 3] {
        [self.axes[0][index], self.axes[1][index], self.axes[2][index]]
    }

    pub fn iter(&self) -> impl Iterator<Item = [Real; 3]> + '_ {
        (0..self.len()).map(move |i| self.point(i))
    }

    pub fn push(&mut self, p: [Real; 3]) {
        for a in 0..3 {
            self.axes[a].push(p[a]);
        }
    }

    /// Bounding box of the local points only.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_points(self.iter())
    }
}
