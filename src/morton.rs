//! Morton (Z-order) keys of points inside a global bounding box.
//!
//! Every axis is normalized to the box and quantized to [`AXIS_BITS`] bits, then the bits
//! of the three axes are interleaved, most significant level first and x before y before z.
//! A key prefix of `k` bits therefore names a box obtained by `k` successive halvings,
//! cycling through x, y and z.
//!
//! Coordinates outside the box are clamped to its nearest face before quantization, so
//! every point has a key. An axis of zero extent quantizes to 0.

use crate::bounds::BoundingBox;
use crate::Real;

/// Quantization bits per axis.
pub const AXIS_BITS: u32 = 21;
/// Significant bits of a key.
pub const KEY_BITS: u32 = 3 * AXIS_BITS;
/// One past the largest key.
pub const KEY_END: u64 = 1 << KEY_BITS;

const AXIS_MAX: u32 = (1 << AXIS_BITS) - 1;

/// Maps points to Morton keys relative to a fixed bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MortonEncoder {
    bounds: BoundingBox,
    scale: [Real; 3],
}

impl MortonEncoder {
    pub fn new(bounds: BoundingBox) -> Self {
        let mut scale = [0.0; 3];
        for a in 0..3 {
            let extent = bounds.extent(a);
            if extent > 0.0 {
                scale[a] = (1u32 << AXIS_BITS) as Real / extent;
            }
        }
        Self { bounds, scale }
    }

    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    /// Integer grid coordinates of `p`, clamped to the box.
    pub fn quantize(&self, p: [Real; 3]) -> [u32; 3] {
        let mut q = [0; 3];
        for a in 0..3 {
            let v = (p[a] - self.bounds.min[a]) * self.scale[a];
            q[a] = if v.is_nan() || v <= 0.0 {
                0
            } else if v >= AXIS_MAX as Real {
                AXIS_MAX
            } else {
                v as u32
            };
        }
        q
    }

    /// Like [`MortonEncoder::quantize`], but a coordinate exactly on the edge between two
    /// cells maps to the lower one, whose closed extent also contains it.
    pub fn quantize_lower(&self, p: [Real; 3]) -> [u32; 3] {
        let mut q = self.quantize(p);
        for a in 0..3 {
            let v = (p[a] - self.bounds.min[a]) * self.scale[a];
            if v > 0.0 && v <= AXIS_MAX as Real && v.fract() == 0.0 {
                q[a] = v as u32 - 1;
            }
        }
        q
    }

    pub fn encode(&self, p: [Real; 3]) -> u64 {
        interleave(self.quantize(p))
    }
}

/// Interleaves three quantized coordinates into one key.
pub fn interleave(q: [u32; 3]) -> u64 {
    spread(q[0]) << 2 | spread(q[1]) << 1 | spread(q[2])
}

// Moves bit i of v to bit 3i.
fn spread(v: u32) -> u64 {
    let mut x = (v & AXIS_MAX) as u64;
    x = (x | x << 32) & 0x001f_0000_0000_ffff;
    x = (x | x << 16) & 0x001f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}

/// Leading `bits` bits of a key.
pub fn bucket(key: u64, bits: u32) -> u64 {
    key >> (KEY_BITS - bits)
}

/// Half-open key range `[start, end)` covered by a `bits`-bit prefix.
pub fn prefix_range(prefix: u64, bits: u32) -> (u64, u64) {
    let shift = KEY_BITS - bits;
    (prefix << shift, (prefix + 1) << shift)
}

/// Inclusive grid-coordinate ranges `(lo, hi)` of the cell named by a `bits`-bit prefix.
pub fn prefix_cell(prefix: u64, bits: u32) -> ([u32; 3], [u32; 3]) {
    let mut value = [0u32; 3];
    let mut depth = [0u32; 3];
    for k in 0..bits {
        let bit = ((prefix >> (bits - 1 - k)) & 1) as u32;
        let a = (k % 3) as usize;
        value[a] = value[a] << 1 | bit;
        depth[a] += 1;
    }
    let mut lo = [0; 3];
    let mut hi = [0; 3];
    for a in 0..3 {
        let shift = AXIS_BITS - depth[a];
        lo[a] = value[a] << shift;
        hi[a] = lo[a] + ((1u32 << shift) - 1);
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> MortonEncoder {
        MortonEncoder::new(BoundingBox::new([0.0; 3], [1.0; 3]))
    }

    #[test]
    fn test_interleave_order() {
        assert_eq!(interleave([0, 0, 0]), 0);
        assert_eq!(interleave([1, 0, 0]), 0b100);
        assert_eq!(interleave([0, 1, 0]), 0b010);
        assert_eq!(interleave([0, 0, 1]), 0b001);
        assert_eq!(interleave([AXIS_MAX; 3]), KEY_END - 1);
    }

    #[test]
    fn test_first_bit_halves_x() {
        let enc = unit();
        assert_eq!(bucket(enc.encode([0.25, 0.9, 0.9]), 1), 0);
        assert_eq!(bucket(enc.encode([0.75, 0.1, 0.1]), 1), 1);
        assert_eq!(bucket(enc.encode([0.1, 0.75, 0.1]), 2), 0b01);
    }

    #[test]
    fn test_out_of_box_points_clamp() {
        let enc = unit();
        assert_eq!(enc.encode([-5.0, -1.0, -0.1]), enc.encode([0.0, 0.0, 0.0]));
        assert_eq!(enc.encode([7.0, 1.5, 2.0]), enc.encode([1.0, 1.0, 1.0]));
        assert_eq!(enc.encode([1.0, 1.0, 1.0]), KEY_END - 1);
        assert_eq!(enc.quantize([Real::NAN, 0.5, 2.0])[0], 0);
    }

    #[test]
    fn test_zero_extent_axis() {
        let enc = MortonEncoder::new(BoundingBox::new([0.0, 3.0, 0.0], [1.0, 3.0, 1.0]));
        assert_eq!(enc.quantize([0.5, 3.0, 0.5])[1], 0);
        assert_eq!(enc.quantize([0.5, 8.0, 0.5])[1], 0);
    }

    #[test]
    fn test_edge_coordinates_quantize_both_ways() {
        let enc = unit();
        let half = [0.5, 0.25, 0.3];
        assert_eq!(enc.quantize(half)[0], 1 << (AXIS_BITS - 1));
        assert_eq!(enc.quantize_lower(half)[0], (1 << (AXIS_BITS - 1)) - 1);
        assert_eq!(enc.quantize_lower(half)[1], (1 << (AXIS_BITS - 2)) - 1);
        assert_eq!(enc.quantize_lower(half)[2], enc.quantize(half)[2]);
        assert_eq!(enc.quantize_lower([0.0, -1.0, 1.0]), enc.quantize([0.0, -1.0, 1.0]));
    }

    #[test]
    fn test_locality() {
        let enc = unit();
        let a = enc.encode([0.10, 0.10, 0.10]);
        let b = enc.encode([0.11, 0.10, 0.10]);
        let far = enc.encode([0.90, 0.90, 0.90]);
        assert!(a.abs_diff(b) < a.abs_diff(far));
    }

    #[test]
    fn test_prefix_cell_contains_encoded_point() {
        let enc = unit();
        let p = [0.3, 0.8, 0.55];
        let key = enc.encode(p);
        let q = enc.quantize(p);
        for bits in 0..=12 {
            let prefix = bucket(key, bits);
            let (start, end) = prefix_range(prefix, bits);
            assert!(start <= key && key < end);
            let (lo, hi) = prefix_cell(prefix, bits);
            for a in 0..3 {
                assert!(lo[a] <= q[a] && q[a] <= hi[a], "bits {} axis {}", bits, a);
            }
        }
        assert_eq!(prefix_range(0, 0), (0, KEY_END));
    }
}
