//! Affine map between the logical integer grid and the physical domain.

use crate::constants::Dim;
use crate::octant::Octant;

/// Scaling and translation between the logical grid `[0, 2^MAX_LEVEL)^dim`
/// and the physical cube `[origin, origin + length)^dim`.
#[derive(Clone, Copy, Debug)]
pub struct DomainMapper {
    origin: [f64; 3],
    length: f64,
    scale: f64,
    dim: Dim,
}

impl DomainMapper {
    /// The unit domain with origin at zero.
    pub fn unit(dim: Dim) -> Self {
        Self::new(dim, [0.0; 3], 1.0)
    }

    /// A domain with the given origin and side length.
    pub fn new(dim: Dim, origin: [f64; 3], length: f64) -> Self {
        assert!(length > 0.0);
        Self {
            origin,
            length,
            scale: length / (1u64 << dim.max_level()) as f64,
            dim,
        }
    }

    /// Physical origin of the domain.
    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// Physical side length of the domain.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Map a logical point to physical coordinates.
    pub fn map_point(&self, logical: [f64; 3]) -> [f64; 3] {
        let mut physical = [0.0; 3];
        for axis in 0..self.dim.n() {
            physical[axis] = self.origin[axis] + self.scale * logical[axis];
        }
        physical
    }

    /// Map a physical point back to logical grid coordinates, clamped to the
    /// grid.
    pub fn unmap_point(&self, physical: [f64; 3]) -> [u32; 3] {
        let max = (1u64 << self.dim.max_level()) - 1;
        let mut logical = [0u32; 3];
        for axis in 0..self.dim.n() {
            let l = (physical[axis] - self.origin[axis]) / self.scale;
            logical[axis] = (l.max(0.0) as u64).min(max) as u32;
        }
        logical
    }

    /// Physical edge length of an octant of logical size `size`.
    pub fn map_size(&self, size: u32) -> f64 {
        self.scale * size as f64
    }

    /// Physical face area from a logical area.
    pub fn map_area(&self, area: u64) -> f64 {
        self.scale.powi(self.dim.n() as i32 - 1) * area as f64
    }

    /// Physical volume from a logical volume.
    pub fn map_volume(&self, volume: u64) -> f64 {
        self.scale.powi(self.dim.n() as i32) * volume as f64
    }

    /// Physical center of an octant.
    pub fn map_center(&self, oct: &Octant) -> [f64; 3] {
        self.map_point(oct.center())
    }

    /// Physical coordinates of the corner nodes of an octant, in Z-order.
    pub fn map_nodes(&self, oct: &Octant) -> Vec<[f64; 3]> {
        (0..self.dim.nnodes())
            .map(|inode| {
                let n = oct.node(inode);
                self.map_point([n[0] as f64, n[1] as f64, n[2] as f64])
            })
            .collect()
    }

    /// Physical direction of a face normal. The map is axis-aligned, so the
    /// direction is unchanged.
    pub fn map_normal(&self, normal: [i8; 3]) -> [f64; 3] {
        [normal[0] as f64, normal[1] as f64, normal[2] as f64]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unit_domain_round_trip() {
        let map = DomainMapper::unit(Dim::Two);
        let root = Octant::root(Dim::Two);
        assert_eq!(map.map_center(&root), [0.5, 0.5, 0.0]);
        assert_eq!(map.map_size(root.size()), 1.0);
        assert_eq!(map.map_volume(root.volume()), 1.0);

        let logical = map.unmap_point([0.5, 0.25, 0.0]);
        assert_eq!(logical[0], 1 << 29);
        assert_eq!(logical[1], 1 << 28);
    }

    #[test]
    fn shifted_domain() {
        let map = DomainMapper::new(Dim::Three, [-1.0, -1.0, -1.0], 2.0);
        let root = Octant::root(Dim::Three);
        assert_eq!(map.map_center(&root), [0.0, 0.0, 0.0]);
        let nodes = map.map_nodes(&root);
        assert_eq!(nodes[0], [-1.0, -1.0, -1.0]);
        assert_eq!(nodes[7], [1.0, 1.0, 1.0]);
        assert_eq!(map.map_area(root.area()), 4.0);
    }

    #[test]
    fn out_of_domain_points_clamp() {
        let map = DomainMapper::unit(Dim::Two);
        assert_eq!(map.unmap_point([-0.5, 2.0, 0.0])[0], 0);
        assert_eq!(map.unmap_point([-0.5, 2.0, 0.0])[1], (1 << 30) - 1);
    }
}
