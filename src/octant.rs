//! The octant: a single leaf of the linear tree.

use mpi::traits::Equivalence;

use crate::constants::Dim;
use crate::morton;

// Flag-word layout. Bits 0-5 mark faces lying on the domain boundary,
// bits 6-11 faces lying on a partition boundary.
const BOUND_SHIFT: u16 = 0;
const PBOUND_SHIFT: u16 = 6;
const NEW_REFINED: u16 = 1 << 12;
const NEW_COARSENED: u16 = 1 << 13;
const BALANCE_OFF: u16 = 1 << 14;
const AUX: u16 = 1 << 15;

/// A leaf of the linear octree.
///
/// An octant covers the half-open cube `[anchor, anchor + size)` per axis on
/// the logical integer grid `[0, 2^MAX_LEVEL)`. Anchor coordinates are
/// always multiples of the octant size. Two octants are equal iff their
/// anchors and levels match; ordering is Morton-with-level.
#[derive(Clone, Copy, Debug)]
pub struct Octant {
    dim: Dim,
    x: u32,
    y: u32,
    z: u32,
    level: u8,
    marker: i8,
    info: u16,
}

impl Octant {
    /// The root octant covering the whole domain.
    pub fn root(dim: Dim) -> Self {
        let mut info = 0;
        for face in 0..dim.nfaces() {
            info |= 1 << (BOUND_SHIFT + face as u16);
        }
        Self {
            dim,
            x: 0,
            y: 0,
            z: 0,
            level: 0,
            marker: 0,
            info,
        }
    }

    /// An octant from anchor and level. Flags start cleared; domain-boundary
    /// bits are derived from the anchor.
    pub fn new(dim: Dim, x: u32, y: u32, z: u32, level: u8) -> Self {
        debug_assert!(level <= dim.max_level());
        let mut oct = Self {
            dim,
            x,
            y,
            z,
            level,
            marker: 0,
            info: 0,
        };
        debug_assert!(oct.anchor_aligned());
        let max = 1u32 << dim.max_level();
        let s = oct.size();
        let anchor = [x, y, z];
        for axis in 0..dim.n() {
            if anchor[axis] == 0 {
                oct.set_bound(2 * axis, true);
            }
            if anchor[axis] + s == max {
                oct.set_bound(2 * axis + 1, true);
            }
        }
        oct
    }

    fn anchor_aligned(&self) -> bool {
        let mask = self.size() - 1;
        (self.x & mask) == 0 && (self.y & mask) == 0 && (self.z & mask) == 0
    }

    /// Dimension tag.
    pub fn dim(&self) -> Dim {
        self.dim
    }

    /// Anchor coordinates (z is zero in 2D).
    pub fn anchor(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// Refinement level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Pending refine (+) or coarsen (-) intent.
    pub fn marker(&self) -> i8 {
        self.marker
    }

    /// Set the refine/coarsen intent, clamped to the representable range.
    pub fn set_marker(&mut self, marker: i8) {
        let ml = self.dim.max_level() as i16;
        let up = ml - self.level as i16;
        let down = -(self.level as i16);
        self.marker = (marker as i16).clamp(down, up) as i8;
    }

    /// Edge length in logical units, `2^(MAX_LEVEL - level)`.
    pub fn size(&self) -> u32 {
        1 << (self.dim.max_level() - self.level)
    }

    /// Face area in logical units, `size^(dim-1)`.
    pub fn area(&self) -> u64 {
        (self.size() as u64).pow(self.dim.n() as u32 - 1)
    }

    /// Volume in logical units, `size^dim`.
    pub fn volume(&self) -> u64 {
        (self.size() as u64).pow(self.dim.n() as u32)
    }

    /// Morton index of the anchor.
    pub fn morton(&self) -> u64 {
        morton::encode(self.dim, self.x, self.y, self.z)
    }

    /// Morton index of the finest descendant at the far corner. Together
    /// with [`Octant::morton`] this brackets the Morton range covered by the
    /// octant.
    pub fn last_desc_morton(&self) -> u64 {
        let s = self.size() - 1;
        let z = if self.dim == Dim::Three { self.z + s } else { 0 };
        morton::encode(self.dim, self.x + s, self.y + s, z)
    }

    /// The finest octant at the near corner of the cube.
    pub fn first_descendant(&self) -> Octant {
        let mut oct = *self;
        oct.level = self.dim.max_level();
        oct.marker = 0;
        oct.info = 0;
        oct
    }

    /// The finest octant at the far corner of the cube.
    pub fn last_descendant(&self) -> Octant {
        let s = self.size() - 1;
        let mut oct = *self;
        oct.x += s;
        oct.y += s;
        if self.dim == Dim::Three {
            oct.z += s;
        }
        oct.level = self.dim.max_level();
        oct.marker = 0;
        oct.info = 0;
        oct
    }

    /// Center of the octant in logical coordinates.
    pub fn center(&self) -> [f64; 3] {
        let half = self.size() as f64 * 0.5;
        let z = if self.dim == Dim::Three {
            self.z as f64 + half
        } else {
            0.0
        };
        [self.x as f64 + half, self.y as f64 + half, z]
    }

    /// Center of a face in logical coordinates.
    pub fn face_center(&self, face: usize) -> [f64; 3] {
        debug_assert!(face < self.dim.nfaces());
        let normal = self.dim.tables().normals[face];
        let half = self.size() as f64 * 0.5;
        let mut c = self.center();
        for axis in 0..self.dim.n() {
            c[axis] += normal[axis] as f64 * half;
        }
        c
    }

    /// Logical coordinates of a corner node (Z-order numbering).
    pub fn node(&self, inode: usize) -> [u32; 3] {
        debug_assert!(inode < self.dim.nnodes());
        let s = self.size();
        let dz = if self.dim == Dim::Three {
            ((inode >> 2) & 1) as u32
        } else {
            0
        };
        [
            self.x + ((inode & 1) as u32) * s,
            self.y + (((inode >> 1) & 1) as u32) * s,
            self.z + dz * s,
        ]
    }

    /// Outward normal of a face.
    pub fn normal(&self, face: usize) -> [i8; 3] {
        debug_assert!(face < self.dim.nfaces());
        self.dim.tables().normals[face]
    }

    // Flag accessors.

    /// Whether `face` lies on the domain boundary.
    pub fn is_bound(&self, face: usize) -> bool {
        self.info & (1 << (BOUND_SHIFT + face as u16)) != 0
    }

    pub(crate) fn set_bound(&mut self, face: usize, value: bool) {
        let bit = 1 << (BOUND_SHIFT + face as u16);
        if value {
            self.info |= bit;
        } else {
            self.info &= !bit;
        }
    }

    /// Whether `face` lies on a partition boundary.
    pub fn is_pbound(&self, face: usize) -> bool {
        self.info & (1 << (PBOUND_SHIFT + face as u16)) != 0
    }

    pub(crate) fn set_pbound(&mut self, face: usize, value: bool) {
        let bit = 1 << (PBOUND_SHIFT + face as u16);
        if value {
            self.info |= bit;
        } else {
            self.info &= !bit;
        }
    }

    pub(crate) fn clear_pbound(&mut self) {
        self.info &= !(0b11_1111 << PBOUND_SHIFT);
    }

    /// Whether the octant was created by the last refinement.
    pub fn is_new_refined(&self) -> bool {
        self.info & NEW_REFINED != 0
    }

    pub(crate) fn set_new_refined(&mut self, value: bool) {
        if value {
            self.info |= NEW_REFINED;
        } else {
            self.info &= !NEW_REFINED;
        }
    }

    /// Whether the octant was created by the last coarsening.
    pub fn is_new_coarsened(&self) -> bool {
        self.info & NEW_COARSENED != 0
    }

    pub(crate) fn set_new_coarsened(&mut self, value: bool) {
        if value {
            self.info |= NEW_COARSENED;
        } else {
            self.info &= !NEW_COARSENED;
        }
    }

    /// Whether 2:1 balance is enforced for this octant.
    pub fn is_balanced(&self) -> bool {
        self.info & BALANCE_OFF == 0
    }

    /// Enable or disable 2:1 balance enforcement for this octant.
    pub fn set_balanced(&mut self, value: bool) {
        if value {
            self.info &= !BALANCE_OFF;
        } else {
            self.info |= BALANCE_OFF;
        }
    }

    pub(crate) fn aux(&self) -> bool {
        self.info & AUX != 0
    }

    pub(crate) fn set_aux(&mut self, value: bool) {
        if value {
            self.info |= AUX;
        } else {
            self.info &= !AUX;
        }
    }

    /// The parent octant. Anchor snaps to the coarser grid; flags and marker
    /// start cleared apart from the derived domain-boundary bits.
    pub fn father(&self) -> Octant {
        debug_assert!(self.level > 0);
        let mask = !(2 * self.size() - 1);
        Octant::new(
            self.dim,
            self.x & mask,
            self.y & mask,
            if self.dim == Dim::Three {
                self.z & mask
            } else {
                0
            },
            self.level - 1,
        )
    }

    /// Which child of its father this octant is (Z-order position).
    pub fn child_index(&self) -> usize {
        debug_assert!(self.level > 0);
        let s = self.size();
        let mut idx = usize::from(self.x & s != 0);
        idx |= usize::from(self.y & s != 0) << 1;
        if self.dim == Dim::Three {
            idx |= usize::from(self.z & s != 0) << 2;
        }
        idx
    }

    /// The `2^dim` children in Z-order. Children inherit the marker less one
    /// refinement (clamped at zero) and the balance setting; boundary and
    /// partition-boundary bits survive only on the faces each child shares
    /// with its father.
    pub fn children(&self) -> Vec<Octant> {
        debug_assert!(self.level < self.dim.max_level());
        let half = self.size() >> 1;
        let nchildren = self.dim.nchildren();
        let mut children = Vec::with_capacity(nchildren);
        for i in 0..nchildren {
            let dx = (i & 1) as u32;
            let dy = ((i >> 1) & 1) as u32;
            let dz = ((i >> 2) & 1) as u32;
            let mut child = Octant {
                dim: self.dim,
                x: self.x + dx * half,
                y: self.y + dy * half,
                z: self.z + dz * half,
                level: self.level + 1,
                marker: self.marker.saturating_sub(1).max(0),
                info: 0,
            };
            let d = [dx, dy, dz];
            for axis in 0..self.dim.n() {
                // The child touches the father's negative face iff its
                // offset along that axis is zero.
                if d[axis] == 0 {
                    child.set_bound(2 * axis, self.is_bound(2 * axis));
                    child.set_pbound(2 * axis, self.is_pbound(2 * axis));
                } else {
                    child.set_bound(2 * axis + 1, self.is_bound(2 * axis + 1));
                    child.set_pbound(2 * axis + 1, self.is_pbound(2 * axis + 1));
                }
            }
            child.set_new_refined(true);
            child.set_balanced(self.is_balanced());
            children.push(child);
        }
        children
    }

    /// Morton of the ancestor anchor at `level`, or of the octant itself if
    /// it is coarser.
    pub(crate) fn ancestor_morton(&self, level: u8) -> u64 {
        if level >= self.level {
            return self.morton();
        }
        let mask = !((1u32 << (self.dim.max_level() - level)) - 1);
        morton::encode(
            self.dim,
            self.x & mask,
            self.y & mask,
            if self.dim == Dim::Three {
                self.z & mask
            } else {
                0
            },
        )
    }

    // Neighbor-Morton helpers. Each returns the Morton indices of the
    // potential equal-or-finer neighbors across the given incidence, empty
    // if the direction leaves the domain.

    /// Morton indices of the (up to `2^(dim-1)`) half-size neighbors across
    /// `face`.
    pub fn half_size_mortons(&self, face: usize) -> Vec<u64> {
        if self.is_bound(face) {
            return Vec::new();
        }
        let at_bottom = self.level == self.dim.max_level();
        let dh = if at_bottom {
            self.size()
        } else {
            self.size() >> 1
        };
        self.face_candidates(face, dh, if at_bottom { 1 } else { 2 })
    }

    /// Morton indices of the `maxdepth`-sized neighbors across `face`,
    /// sorted ascending.
    pub fn min_size_mortons(&self, face: usize, maxdepth: u8) -> Vec<u64> {
        if self.is_bound(face) {
            return Vec::new();
        }
        if maxdepth <= self.level {
            return self.face_candidates(face, self.size(), 1);
        }
        let dh = 1u32 << (self.dim.max_level() - maxdepth);
        let per_axis = (self.size() / dh) as usize;
        let mut mortons = self.face_candidates(face, dh, per_axis);
        mortons.sort_unstable();
        mortons
    }

    /// Half-size candidates when this octant is 2:1 balanced (a neighbor can
    /// be at most one level finer), min-size candidates otherwise.
    pub fn virtual_mortons(&self, face: usize, maxdepth: u8) -> Vec<u64> {
        if self.is_balanced() {
            self.half_size_mortons(face)
        } else {
            self.min_size_mortons(face, maxdepth)
        }
    }

    // Enumerate anchors of hypothetical size-`dh` neighbors tiling the far
    // side of `face`, `per_axis` per free axis.
    fn face_candidates(&self, face: usize, dh: u32, per_axis: usize) -> Vec<u64> {
        let normal = self.dim.tables().normals[face];
        let s = self.size();
        let anchor = self.anchor();
        let free: Vec<usize> = (0..self.dim.n()).filter(|&a| normal[a] == 0).collect();
        let count = per_axis.pow(free.len() as u32);
        let mut mortons = Vec::with_capacity(count);
        for i in 0..count {
            let mut coords = anchor;
            let mut rem = i;
            for &axis in &free {
                coords[axis] = anchor[axis] + dh * (rem % per_axis) as u32;
                rem /= per_axis;
            }
            for axis in 0..self.dim.n() {
                match normal[axis] {
                    -1 => coords[axis] = anchor[axis].wrapping_sub(dh),
                    1 => coords[axis] = anchor[axis] + s,
                    _ => {}
                }
            }
            mortons.push(morton::encode(self.dim, coords[0], coords[1], coords[2]));
        }
        mortons
    }

    /// Whether `edge` lies on the domain boundary (either incident face
    /// does). 3D only.
    pub fn edge_is_bound(&self, edge: usize) -> bool {
        let [f0, f1] = self.dim.tables().edgeface[edge];
        self.is_bound(f0) || self.is_bound(f1)
    }

    /// Morton indices of the (up to 2) half-size neighbors across `edge`.
    /// 3D only.
    pub fn edge_half_size_mortons(&self, edge: usize) -> Vec<u64> {
        debug_assert!(self.dim == Dim::Three);
        if self.edge_is_bound(edge) {
            return Vec::new();
        }
        let at_bottom = self.level == self.dim.max_level();
        let dh = if at_bottom {
            self.size()
        } else {
            self.size() >> 1
        };
        let count = if at_bottom { 1 } else { 2 };
        self.edge_candidates(edge, dh, count)
    }

    /// Morton indices of the `maxdepth`-sized neighbors across `edge`,
    /// sorted ascending. 3D only.
    pub fn edge_min_size_mortons(&self, edge: usize, maxdepth: u8) -> Vec<u64> {
        debug_assert!(self.dim == Dim::Three);
        if self.edge_is_bound(edge) {
            return Vec::new();
        }
        if maxdepth <= self.level {
            return self.edge_candidates(edge, self.size(), 1);
        }
        let dh = 1u32 << (self.dim.max_level() - maxdepth);
        let count = (self.size() / dh) as usize;
        let mut mortons = self.edge_candidates(edge, dh, count);
        mortons.sort_unstable();
        mortons
    }

    /// Virtual neighbor candidates across `edge` (see
    /// [`Octant::virtual_mortons`]). 3D only.
    pub fn edge_virtual_mortons(&self, edge: usize, maxdepth: u8) -> Vec<u64> {
        if self.is_balanced() {
            self.edge_half_size_mortons(edge)
        } else {
            self.edge_min_size_mortons(edge, maxdepth)
        }
    }

    fn edge_candidates(&self, edge: usize, dh: u32, count: usize) -> Vec<u64> {
        let coeff = self.dim.tables().edgecoeffs[edge];
        let s = self.size();
        let anchor = self.anchor();
        let mut mortons = Vec::with_capacity(count);
        for i in 0..count {
            let mut coords = anchor;
            for axis in 0..3 {
                match coeff[axis] {
                    -1 => coords[axis] = anchor[axis].wrapping_sub(dh),
                    1 => coords[axis] = anchor[axis] + s,
                    // The free axis: step along the edge.
                    _ => coords[axis] = anchor[axis] + dh * i as u32,
                }
            }
            mortons.push(morton::encode(self.dim, coords[0], coords[1], coords[2]));
        }
        mortons
    }

    /// Whether `inode` lies on the domain boundary (any incident face does).
    pub fn node_is_bound(&self, inode: usize) -> bool {
        let faces = &self.dim.tables().nodeface[inode];
        (0..self.dim.n()).any(|k| self.is_bound(faces[k]))
    }

    /// Morton index of the sample point identifying the single diagonal
    /// neighbor across `inode`, empty if the node leaves the domain.
    pub fn node_virtual_morton(&self, inode: usize) -> Vec<u64> {
        if self.node_is_bound(inode) {
            return Vec::new();
        }
        let coeff = self.dim.tables().nodecoeffs[inode];
        let s = self.size();
        let anchor = self.anchor();
        let mut coords = anchor;
        for axis in 0..self.dim.n() {
            // Sample one finest-grid cell beyond the corner.
            coords[axis] = match coeff[axis] {
                -1 => anchor[axis].wrapping_sub(1),
                _ => anchor[axis] + s,
            };
        }
        vec![morton::encode(self.dim, coords[0], coords[1], coords[2])]
    }
}

impl PartialEq for Octant {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y && self.z == other.z && self.level == other.level
    }
}

impl Eq for Octant {}

impl PartialOrd for Octant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Octant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        morton::morton_level_cmp(self.morton(), self.level, other.morton(), other.level)
    }
}

/// Fixed-layout octant record for rank-to-rank exchange.
#[derive(Copy, Clone, Default, Equivalence)]
pub(crate) struct PackedOctant {
    x: u32,
    y: u32,
    z: u32,
    level: u8,
    marker: i8,
    info: u16,
}

impl PackedOctant {
    pub fn pack(oct: &Octant) -> Self {
        Self {
            x: oct.x,
            y: oct.y,
            z: oct.z,
            level: oct.level,
            marker: oct.marker,
            info: oct.info,
        }
    }

    pub fn unpack(&self, dim: Dim) -> Octant {
        Octant {
            dim,
            x: self.x,
            y: self.y,
            z: self.z,
            level: self.level,
            marker: self.marker,
            info: self.info,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_is_all_bound() {
        let root = Octant::root(Dim::Two);
        for face in 0..4 {
            assert!(root.is_bound(face));
        }
        assert_eq!(root.size(), 1 << 30);
        assert_eq!(root.volume(), 1u64 << 60);
    }

    #[test]
    fn children_tile_father() {
        let root = Octant::root(Dim::Two);
        let children = root.children();
        assert_eq!(children.len(), 4);
        let h = 1u32 << 29;
        let anchors: Vec<[u32; 3]> = children.iter().map(|c| c.anchor()).collect();
        assert_eq!(
            anchors,
            vec![[0, 0, 0], [h, 0, 0], [0, h, 0], [h, h, 0]]
        );
        // Z-order of children is the Morton order.
        for w in children.windows(2) {
            assert!(w[0] < w[1]);
        }
        for (i, child) in children.iter().enumerate() {
            assert!(child.is_new_refined());
            assert_eq!(child.child_index(), i);
            assert_eq!(child.father(), root);
        }
    }

    #[test]
    fn children_boundary_flags() {
        let root = Octant::root(Dim::Three);
        let children = root.children();
        // First child keeps the three negative faces, loses the positive.
        assert!(children[0].is_bound(0) && children[0].is_bound(2) && children[0].is_bound(4));
        assert!(!children[0].is_bound(1) && !children[0].is_bound(3) && !children[0].is_bound(5));
        // Last child is the mirror image.
        let last = &children[7];
        assert!(last.is_bound(1) && last.is_bound(3) && last.is_bound(5));
        assert!(!last.is_bound(0) && !last.is_bound(2) && !last.is_bound(4));
    }

    #[test]
    fn marker_clamps() {
        let mut oct = Octant::root(Dim::Three);
        oct.set_marker(25);
        assert_eq!(oct.marker(), 20);
        oct.set_marker(-5);
        assert_eq!(oct.marker(), 0);
    }

    #[test]
    fn children_consume_marker() {
        let mut oct = Octant::root(Dim::Two);
        oct.set_marker(2);
        let children = oct.children();
        assert!(children.iter().all(|c| c.marker() == 1));
    }

    #[test]
    fn descendants_bracket_morton_range() {
        let oct = Octant::new(Dim::Two, 1 << 29, 0, 0, 1);
        assert_eq!(oct.first_descendant().morton(), oct.morton());
        assert_eq!(oct.last_descendant().morton(), oct.last_desc_morton());
        assert!(oct.morton() < oct.last_desc_morton());
    }

    #[test]
    fn half_size_mortons_interior_face() {
        let h = 1u32 << 29;
        let oct = Octant::new(Dim::Two, h, 0, 0, 1);
        // Across the -x face towards the sibling at the origin.
        let mortons = oct.half_size_mortons(0);
        assert_eq!(mortons.len(), 2);
        let q = h >> 1;
        assert_eq!(mortons[0], morton::encode2(h - q, 0));
        assert_eq!(mortons[1], morton::encode2(h - q, q));
        // The +x face is the domain boundary.
        assert!(oct.half_size_mortons(1).is_empty());
    }

    #[test]
    fn min_size_mortons_counts() {
        let h = 1u32 << 29;
        let oct = Octant::new(Dim::Two, h, 0, 0, 1);
        let mortons = oct.min_size_mortons(0, 3);
        assert_eq!(mortons.len(), 4);
        assert!(mortons.windows(2).all(|w| w[0] < w[1]));

        let oct3 = Octant::new(Dim::Three, 1 << 19, 0, 0, 1);
        assert_eq!(oct3.min_size_mortons(0, 3).len(), 16);
        assert_eq!(oct3.half_size_mortons(0).len(), 4);
    }

    #[test]
    fn edge_and_node_candidates() {
        let h = 1u32 << 19;
        let oct = Octant::new(Dim::Three, h, h, h, 1);
        // Edge 0 runs along y at the -x,-z corner.
        let mortons = oct.edge_half_size_mortons(0);
        assert_eq!(mortons.len(), 2);
        let q = h >> 1;
        assert_eq!(mortons[0], morton::encode3(h - q, h, h - q));
        assert_eq!(mortons[1], morton::encode3(h - q, h + q, h - q));

        let corner = oct.node_virtual_morton(0);
        assert_eq!(corner, vec![morton::encode3(h - 1, h - 1, h - 1)]);

        // A corner on the domain boundary yields nothing.
        let first = Octant::new(Dim::Three, 0, 0, 0, 1);
        assert!(first.node_virtual_morton(0).is_empty());
    }

    #[test]
    fn packed_round_trip() {
        let mut oct = Octant::new(Dim::Two, 1 << 29, 1 << 29, 0, 2);
        oct.set_marker(-1);
        oct.set_balanced(false);
        let packed = PackedOctant::pack(&oct);
        let back = packed.unpack(Dim::Two);
        assert_eq!(back, oct);
        assert_eq!(back.marker(), -1);
        assert!(!back.is_balanced());
    }
}
