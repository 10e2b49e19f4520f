use crate::Real;

/// Axis-aligned bounding box in 3D space.
///
/// All containment and intersection tests are closed: a point on a face is inside,
/// and two boxes sharing only a face intersect.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: [Real; 3],
    pub max: [Real; 3],
}

impl BoundingBox {
    pub fn new(min: [Real; 3], max: [Real; 3]) -> Self {
        Self { min, max }
    }

    /// The identity of [`BoundingBox::union`]: contains nothing and leaves any box unchanged.
    pub fn empty() -> Self {
        Self {
            min: [Real::INFINITY; 3],
            max: [Real::NEG_INFINITY; 3],
        }
    }

    /// Smallest box holding all given points, or [`BoundingBox::empty`] without points.
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = [Real; 3]>,
    {
        let mut bounds = Self::empty();
        for p in points {
            bounds.extend(p);
        }
        bounds
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|a| self.min[a] > self.max[a])
    }

    pub fn extend(&mut self, p: [Real; 3]) {
        for a in 0..3 {
            if p[a] < self.min[a] { self.min[a] = p[a]; }
            if p[a] > self.max[a] { self.max[a] = p[a]; }
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let mut out = *self;
        for a in 0..3 {
            out.min[a] = out.min[a].min(other.min[a]);
            out.max[a] = out.max[a].max(other.max[a]);
        }
        out
    }

    pub fn extent(&self, axis: usize) -> Real {
        self.max[axis] - self.min[axis]
    }

    /// Axis of the largest extent; ties go to the lower axis index.
    pub fn longest_axis(&self) -> usize {
        let (ex, ey, ez) = (self.extent(0), self.extent(1), self.extent(2));
        if ex >= ey && ex >= ez {
            0
        } else if ey >= ez {
            1
        } else {
            2
        }
    }

    pub fn contains(&self, p: &[Real; 3]) -> bool {
        (0..3).all(|a| p[a] >= self.min[a] && p[a] <= self.max[a])
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        (0..3).all(|a| self.min[a] <= other.max[a] && self.max[a] >= other.min[a])
    }

    /// Moves `p` onto the nearest point of the box.
    pub fn clamp(&self, p: [Real; 3]) -> [Real; 3] {
        let mut out = p;
        for a in 0..3 {
            out[a] = out[a].max(self.min[a]).min(self.max[a]);
        }
        out
    }

    /// Cuts the box at `coord` along `axis` into a lower and an upper half sharing that face.
    pub fn split(&self, axis: usize, coord: Real) -> (BoundingBox, BoundingBox) {
        let mut lower = *self;
        let mut upper = *self;
        lower.max[axis] = coord;
        upper.min[axis] = coord;
        (lower, upper)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new([0.0; 3], [0.0; 3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_union_identity() {
        let b = BoundingBox::new([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);
        assert!(BoundingBox::empty().is_empty());
        assert_eq!(BoundingBox::empty().union(&b), b);
        assert_eq!(BoundingBox::from_points(std::iter::empty()), BoundingBox::empty());
    }

    #[test]
    fn test_closed_intersection() {
        let a = BoundingBox::new([0.0; 3], [1.0; 3]);
        let touching = BoundingBox::new([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]);
        let apart = BoundingBox::new([1.5, 0.0, 0.0], [2.0, 1.0, 1.0]);
        assert!(a.intersects(&touching));
        assert!(!a.intersects(&apart));
        assert!(a.contains(&[1.0, 1.0, 0.0]));
    }

    #[test]
    fn test_longest_axis_ties_prefer_x() {
        assert_eq!(BoundingBox::new([0.0; 3], [1.0; 3]).longest_axis(), 0);
        assert_eq!(BoundingBox::new([0.0; 3], [1.0, 2.0, 2.0]).longest_axis(), 1);
        assert_eq!(BoundingBox::new([0.0; 3], [1.0, 2.0, 3.0]).longest_axis(), 2);
    }

    #[test]
    fn test_clamp_and_split() {
        let b = BoundingBox::new([0.0; 3], [10.0; 3]);
        assert_eq!(b.clamp([-1.0, 5.0, 11.0]), [0.0, 5.0, 10.0]);
        let (lo, hi) = b.split(1, 4.0);
        assert_eq!(lo.max[1], 4.0);
        assert_eq!(hi.min[1], 4.0);
        assert_eq!(hi.max, [10.0; 3]);
    }
}
