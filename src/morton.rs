//! Routines for working with Morton indices.
//!
//! A Morton index interleaves the bits of the anchor coordinates of an
//! octant, x least significant. The index does not encode the level; the
//! linear order of a tree is Morton-with-level ([`morton_level_cmp`]), which
//! breaks the ancestor/descendant tie in favour of the coarser octant.

use std::cmp::Ordering;

use crate::constants::Dim;

/// Interleave the bits of `x` and `y` (two dimensions).
pub fn encode2(x: u32, y: u32) -> u64 {
    split2(x as u64) | (split2(y as u64) << 1)
}

/// Interleave the bits of `x`, `y` and `z` (three dimensions).
pub fn encode3(x: u32, y: u32, z: u32) -> u64 {
    split3(x as u64) | (split3(y as u64) << 1) | (split3(z as u64) << 2)
}

/// Morton index of an anchor in the given dimension. `z` is ignored in 2D.
pub fn encode(dim: Dim, x: u32, y: u32, z: u32) -> u64 {
    match dim {
        Dim::Two => encode2(x, y),
        Dim::Three => encode3(x, y, z),
    }
}

/// Recover the anchor coordinates from a Morton index.
pub fn decode(dim: Dim, morton: u64) -> (u32, u32, u32) {
    match dim {
        Dim::Two => (compact2(morton), compact2(morton >> 1), 0),
        Dim::Three => (
            compact3(morton),
            compact3(morton >> 1),
            compact3(morton >> 2),
        ),
    }
}

/// Morton-with-level comparison: by Morton code, coarser first on ties.
pub fn morton_level_cmp(ma: u64, la: u8, mb: u64, lb: u8) -> Ordering {
    ma.cmp(&mb).then(la.cmp(&lb))
}

// Magic-bits bit spreading. The 2D variant spaces 32 bits of input one
// apart; the 3D variant spaces 21 bits two apart.

fn split2(v: u64) -> u64 {
    let mut x = v & 0xffff_ffff;
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

fn compact2(v: u64) -> u32 {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    x = (x | (x >> 16)) & 0x0000_0000_ffff_ffff;
    x as u32
}

fn split3(v: u64) -> u64 {
    let mut x = v & 0x1f_ffff;
    x = (x | (x << 32)) & 0x001f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x001f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

fn compact3(v: u64) -> u32 {
    let mut x = v & 0x1249_2492_4924_9249;
    x = (x | (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x | (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x | (x >> 32)) & 0x001f_ffff;
    x as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_2d() {
        let max = (1u32 << Dim::Two.max_level()) - 1;
        for &(x, y) in &[(0, 0), (1, 0), (0, 1), (12345, 54321), (max, max)] {
            let m = encode2(x, y);
            assert_eq!(decode(Dim::Two, m), (x, y, 0));
        }
    }

    #[test]
    fn round_trip_3d() {
        let max = (1u32 << Dim::Three.max_level()) - 1;
        for &(x, y, z) in &[
            (0, 0, 0),
            (1, 2, 3),
            (max, 0, max),
            (123_456, 654_321, 333_333),
            (max, max, max),
        ] {
            let m = encode3(x, y, z);
            assert_eq!(decode(Dim::Three, m), (x, y, z));
        }
    }

    #[test]
    fn x_is_least_significant() {
        // The first child offset along x must be the smallest increment.
        assert!(encode2(1, 0) < encode2(0, 1));
        assert!(encode3(1, 0, 0) < encode3(0, 1, 0));
        assert!(encode3(0, 1, 0) < encode3(0, 0, 1));
    }

    #[test]
    fn order_matches_z_curve() {
        // The four unit cells of a 2x2 grid in Z-order.
        let cells = [(0u32, 0u32), (1, 0), (0, 1), (1, 1)];
        let codes: Vec<u64> = cells.iter().map(|&(x, y)| encode2(x, y)).collect();
        for w in codes.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn coarser_sorts_first() {
        let m = encode3(0, 0, 0);
        assert_eq!(morton_level_cmp(m, 1, m, 2), Ordering::Less);
        assert_eq!(morton_level_cmp(m, 2, m, 2), Ordering::Equal);
    }
}
