//! The local linear tree.
//!
//! A rank owns a strictly increasing (Morton-with-level) vector of disjoint
//! octants covering a contiguous slice of the domain, plus a read-only
//! vector of ghost octants mirroring the peers' leaves adjacent to the local
//! slice. All mutation happens through single-sweep refine/coarsen passes
//! and the 2:1 marker balance; the parallel coordinator
//! ([`parallel::ParaTree`]) sequences them across ranks.

pub mod parallel;

use std::collections::HashMap;

use crate::constants::Dim;
use crate::error::TreeError;
use crate::octant::Octant;

/// A face, edge or node direction of an octant.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Incidence {
    /// Across a face (codimension 1).
    Face(usize),
    /// Across an edge (codimension 2, 3D only).
    Edge(usize),
    /// Across a corner node (codimension `dim`).
    Node(usize),
}

/// Sorted octant storage of one rank.
pub(crate) struct LocalTree {
    dim: Dim,
    pub(crate) octants: Vec<Octant>,
    pub(crate) ghosts: Vec<Octant>,
    local_max_depth: u8,
    ghost_max_depth: u8,
    balance_codim: u8,
    /// Unique logical node coordinates, first-seen order.
    pub(crate) nodes: Vec<[u32; 3]>,
    /// Per-octant node indices, `nnodes` per octant.
    pub(crate) connectivity: Vec<u32>,
    /// Per-ghost node indices into the same node table.
    pub(crate) ghost_connectivity: Vec<u32>,
}

impl LocalTree {
    /// A tree holding the root octant (rank zero) or nothing (other ranks).
    pub fn new(dim: Dim, with_root: bool) -> Self {
        let octants = if with_root {
            vec![Octant::root(dim)]
        } else {
            Vec::new()
        };
        Self {
            dim,
            octants,
            ghosts: Vec::new(),
            local_max_depth: 0,
            ghost_max_depth: 0,
            balance_codim: 1,
            nodes: Vec::new(),
            connectivity: Vec::new(),
            ghost_connectivity: Vec::new(),
        }
    }

    pub fn dim(&self) -> Dim {
        self.dim
    }

    pub fn num_octants(&self) -> usize {
        self.octants.len()
    }

    pub fn num_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    pub fn local_max_depth(&self) -> u8 {
        self.local_max_depth
    }

    /// Codimension up to which 2:1 balance is enforced, clamped to `dim`.
    pub fn balance_codim(&self) -> u8 {
        self.balance_codim
    }

    pub fn set_balance_codim(&mut self, codim: u8) {
        self.balance_codim = codim.clamp(1, self.dim.n() as u8);
    }

    /// Morton index of the first descendant of the local range, if any.
    pub fn first_desc_morton(&self) -> Option<u64> {
        self.octants.first().map(|o| o.morton())
    }

    /// Morton index of the last descendant of the local range, if any.
    pub fn last_desc_morton(&self) -> Option<u64> {
        self.octants.last().map(|o| o.last_desc_morton())
    }

    pub fn refresh_depth(&mut self) {
        self.local_max_depth = self.octants.iter().map(|o| o.level()).max().unwrap_or(0);
        self.ghost_max_depth = self.ghosts.iter().map(|o| o.level()).max().unwrap_or(0);
    }

    fn effective_max_depth(&self) -> u8 {
        self.local_max_depth.max(self.ghost_max_depth)
    }

    pub fn clear_adapt_flags(&mut self) {
        for oct in &mut self.octants {
            oct.set_new_refined(false);
            oct.set_new_coarsened(false);
        }
    }

    pub fn clear_connectivity(&mut self) {
        self.nodes.clear();
        self.connectivity.clear();
        self.ghost_connectivity.clear();
    }

    /// The sorted-disjoint-contiguous storage invariant. Library bugs only.
    pub fn assert_invariants(&self) {
        debug_assert!(self.octants.windows(2).all(|w| {
            w[0] < w[1] && w[1].morton() == w[0].last_desc_morton() + 1
        }));
        debug_assert!(self
            .ghosts
            .windows(2)
            .all(|w| w[0] < w[1] && w[1].morton() > w[0].last_desc_morton()));
    }

    // ------------------------------------------------------------------
    // Refinement and coarsening sweeps
    // ------------------------------------------------------------------

    /// One refinement sweep: every octant with a positive marker below the
    /// deepest level is replaced in place by its children. When `mapper` is
    /// given it is filled with the pre-sweep index of each output octant.
    pub fn refine_sweep(&mut self, mapper: Option<&mut Vec<u32>>) -> bool {
        self.refine_impl(mapper, false)
    }

    /// Unconditional refinement of every octant, markers ignored.
    pub fn refine_all(&mut self, mapper: Option<&mut Vec<u32>>) -> bool {
        self.refine_impl(mapper, true)
    }

    fn refine_impl(&mut self, mapper: Option<&mut Vec<u32>>, all: bool) -> bool {
        let ml = self.dim.max_level();
        let wants = |oct: &Octant| (all || oct.marker() > 0) && oct.level() < ml;

        if let Some(map) = &mapper {
            debug_assert!(map.is_empty());
        }
        if !self.octants.iter().any(wants) {
            if let Some(map) = mapper {
                map.extend(0..self.octants.len() as u32);
            }
            return false;
        }

        let mut new = Vec::with_capacity(self.octants.len() + 3 * self.dim.nchildren());
        let mut map = mapper;
        for (i, oct) in self.octants.iter().enumerate() {
            if wants(oct) {
                for child in oct.children() {
                    if let Some(map) = map.as_deref_mut() {
                        map.push(i as u32);
                    }
                    new.push(child);
                }
            } else {
                if let Some(map) = map.as_deref_mut() {
                    map.push(i as u32);
                }
                new.push(*oct);
            }
        }
        self.octants = new;
        self.refresh_depth();
        self.assert_invariants();
        true
    }

    /// One coarsening sweep: every complete local family whose members all
    /// carry a negative marker (and all keep 2:1 enforcement on) is replaced
    /// by its father. Surviving negative markers step one toward zero.
    pub fn coarsen_sweep(&mut self, mapper: Option<&mut Vec<u32>>) -> bool {
        self.coarsen_impl(mapper, false)
    }

    /// Unconditional coarsening of every complete local family.
    pub fn coarsen_all(&mut self, mapper: Option<&mut Vec<u32>>) -> bool {
        self.coarsen_impl(mapper, true)
    }

    fn coarsen_impl(&mut self, mut mapper: Option<&mut Vec<u32>>, all: bool) -> bool {
        let nc = self.dim.nchildren();
        let n = self.octants.len();
        if let Some(map) = &mapper {
            debug_assert!(map.is_empty());
        }

        let mut new = Vec::with_capacity(n);
        let mut changed = false;
        let mut i = 0;
        while i < n {
            if let Some(father) = self.family_father(i, all) {
                if let Some(map) = mapper.as_deref_mut() {
                    map.push(i as u32);
                }
                new.push(father);
                i += nc;
                changed = true;
            } else {
                let mut oct = self.octants[i];
                if !all && oct.marker() < 0 {
                    oct.set_marker(oct.marker() + 1);
                }
                if let Some(map) = mapper.as_deref_mut() {
                    map.push(i as u32);
                }
                new.push(oct);
                i += 1;
            }
        }
        self.octants = new;
        self.refresh_depth();
        self.assert_invariants();
        changed
    }

    /// The father replacing the family starting at `i`, if `i` starts a
    /// complete eligible family.
    fn family_father(&self, i: usize, unconditional: bool) -> Option<Octant> {
        let nc = self.dim.nchildren();
        let first = &self.octants[i];
        if first.level() == 0 || first.child_index() != 0 || i + nc > self.octants.len() {
            return None;
        }
        let members = &self.octants[i..i + nc];
        let father = first.father();
        for member in &members[1..] {
            if member.level() != first.level() || member.father() != father {
                return None;
            }
        }
        if !unconditional
            && members
                .iter()
                .any(|m| m.marker() > -1 || !m.is_balanced())
        {
            return None;
        }

        let mut father = father;
        let max_marker = members.iter().map(|m| m.marker()).max().unwrap();
        father.set_marker((max_marker as i16 + 1).min(0) as i8);
        father.set_new_coarsened(true);
        father.set_balanced(members.iter().any(|m| m.is_balanced()));
        for face in 0..self.dim.nfaces() {
            father.set_pbound(face, members.iter().any(|m| m.is_pbound(face)));
        }
        Some(father)
    }

    // ------------------------------------------------------------------
    // 2:1 balance
    // ------------------------------------------------------------------

    /// Relax local markers until no neighbor pair within the balance
    /// codimension would end up more than one level apart. Ghost targets
    /// constrain local octants; octants with balance switched off constrain
    /// their neighbors but are never promoted.
    pub fn balance21(&mut self) -> Result<bool, TreeError> {
        let n = self.octants.len();
        if n == 0 {
            return Ok(false);
        }
        let max_rounds = 2 * self.dim.max_level() as usize + 2;
        let maxdepth = self.effective_max_depth();
        let incidences = self.incidence_list();

        let target = |oct: &Octant| oct.level() as i16 + oct.marker() as i16;

        fn enqueue(next: &mut Vec<usize>, in_next: &mut [bool], j: usize) {
            if !in_next[j] {
                in_next[j] = true;
                next.push(j);
            }
        }

        // Octants with pending markers, plus everything on a partition
        // boundary: a peer may have raised the target of a ghost.
        let mut work: Vec<usize> = self
            .octants
            .iter()
            .enumerate()
            .filter(|(_, o)| o.marker() != 0 || o.aux())
            .map(|(i, _)| i)
            .collect();

        let mut any_changed = false;
        let mut rounds = 0;
        while !work.is_empty() {
            rounds += 1;
            if rounds > max_rounds {
                return Err(TreeError::BalanceDiverged(rounds));
            }

            let mut next = Vec::new();
            let mut in_next = vec![false; n];

            for &i in &work {
                let mut raised_i = false;
                let mut all_locals = Vec::new();

                for &inc in &incidences {
                    let oct_i = self.octants[i];
                    let candidates = self.virtual_candidates(&oct_i, inc, maxdepth);
                    let (locals, ghost_hits) = self.search_candidates(&candidates);

                    for &j in &locals {
                        let j = j as usize;
                        if j == i {
                            continue;
                        }
                        let t_i = target(&self.octants[i]);
                        let t_j = target(&self.octants[j]);
                        if t_j > t_i + 1 && self.octants[i].is_balanced() {
                            let level = self.octants[i].level() as i16;
                            self.octants[i].set_marker((t_j - 1 - level) as i8);
                            raised_i = true;
                        } else if t_i > t_j + 1 && self.octants[j].is_balanced() {
                            let level = self.octants[j].level() as i16;
                            self.octants[j].set_marker((t_i - 1 - level) as i8);
                            any_changed = true;
                            enqueue(&mut next, &mut in_next, j);
                            enqueue(&mut next, &mut in_next, i);
                        }
                    }
                    all_locals.extend(locals.iter().map(|&j| j as usize));

                    for &g in &ghost_hits {
                        let ghost = self.ghosts[g as usize];
                        let t_i = target(&self.octants[i]);
                        let t_g = ghost.level() as i16 + ghost.marker() as i16;
                        if t_g > t_i + 1 && self.octants[i].is_balanced() {
                            let level = self.octants[i].level() as i16;
                            self.octants[i].set_marker((t_g - 1 - level) as i8);
                            raised_i = true;
                        }
                        // A deficient ghost is raised by its owner during
                        // the cross-rank marker rounds.
                    }
                }

                if raised_i {
                    any_changed = true;
                    enqueue(&mut next, &mut in_next, i);
                    for j in all_locals {
                        if j != i {
                            enqueue(&mut next, &mut in_next, j);
                        }
                    }
                }
            }
            work = next;
        }
        Ok(any_changed)
    }

    /// One serial adaptation: marker balance, one refine sweep, one coarsen
    /// sweep. The parallel coordinator wraps this with the cross-rank
    /// rounds; unit tests drive it directly.
    pub fn adapt_serial(&mut self, mapper: Option<&mut Vec<u32>>) -> Result<bool, TreeError> {
        self.clear_adapt_flags();
        self.clear_connectivity();
        self.balance21()?;
        let changed = match mapper {
            None => {
                let refined = self.refine_sweep(None);
                let coarsened = self.coarsen_sweep(None);
                refined || coarsened
            }
            Some(mapper) => {
                let mut refine_map = Vec::new();
                let refined = self.refine_sweep(Some(&mut refine_map));
                let mut coarsen_map = Vec::new();
                let coarsened = self.coarsen_sweep(Some(&mut coarsen_map));
                mapper.clear();
                mapper.extend(coarsen_map.iter().map(|&j| refine_map[j as usize]));
                refined || coarsened
            }
        };
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Neighbor search
    // ------------------------------------------------------------------

    /// The face/edge/node directions within the balance codimension.
    pub(crate) fn incidence_list(&self) -> Vec<Incidence> {
        let mut incidences: Vec<Incidence> =
            (0..self.dim.nfaces()).map(Incidence::Face).collect();
        if self.dim == Dim::Three && self.balance_codim >= 2 {
            incidences.extend((0..self.dim.nedges()).map(Incidence::Edge));
        }
        if self.balance_codim as usize >= self.dim.n() {
            incidences.extend((0..self.dim.nnodes()).map(Incidence::Node));
        }
        incidences
    }

    pub(crate) fn virtual_candidates(
        &self,
        oct: &Octant,
        inc: Incidence,
        maxdepth: u8,
    ) -> Vec<u64> {
        match inc {
            Incidence::Face(f) => oct.virtual_mortons(f, maxdepth),
            Incidence::Edge(e) => oct.edge_virtual_mortons(e, maxdepth),
            Incidence::Node(k) => oct.node_virtual_morton(k),
        }
    }

    /// Locate the leaf containing Morton index `m` in a sorted disjoint
    /// octant array.
    fn locate(arr: &[Octant], m: u64) -> Option<usize> {
        let idx = arr.partition_point(|o| o.morton() <= m);
        if idx == 0 {
            return None;
        }
        (m <= arr[idx - 1].last_desc_morton()).then_some(idx - 1)
    }

    /// Resolve candidate Mortons to distinct local and ghost indices,
    /// preserving candidate order.
    fn search_candidates(&self, candidates: &[u64]) -> (Vec<u32>, Vec<u32>) {
        let mut locals: Vec<u32> = Vec::new();
        let mut ghosts: Vec<u32> = Vec::new();
        for &m in candidates {
            if let Some(i) = Self::locate(&self.octants, m) {
                if locals.last() != Some(&(i as u32)) {
                    locals.push(i as u32);
                }
            } else if let Some(g) = Self::locate(&self.ghosts, m) {
                if ghosts.last() != Some(&(g as u32)) {
                    ghosts.push(g as u32);
                }
            }
        }
        (locals, ghosts)
    }

    /// All leaves incident on direction `iface` of codimension `codim` of
    /// local octant `idx`. Results keep the Z-order of the incidence
    /// pattern; the flag vector marks ghost hits.
    pub fn find_neighbours(
        &self,
        idx: usize,
        iface: usize,
        codim: usize,
    ) -> (Vec<u32>, Vec<bool>) {
        let oct = self.octants[idx];
        self.neighbours_of(&oct, iface, codim)
    }

    /// [`LocalTree::find_neighbours`] for an octant not necessarily in the
    /// local storage (a ghost, or a query box).
    pub fn neighbours_of(&self, oct: &Octant, iface: usize, codim: usize) -> (Vec<u32>, Vec<bool>) {
        let inc = match (codim, self.dim) {
            (1, _) => Incidence::Face(iface),
            (2, Dim::Three) => Incidence::Edge(iface),
            (2, Dim::Two) | (3, Dim::Three) => Incidence::Node(iface),
            _ => panic!("codimension {codim} not defined in {}D", self.dim.n()),
        };
        let candidates = self.virtual_candidates(oct, inc, self.effective_max_depth());

        let mut out = Vec::new();
        let mut is_ghost = Vec::new();
        let mut last: Option<(u32, bool)> = None;
        for &m in &candidates {
            let hit = if let Some(i) = Self::locate(&self.octants, m) {
                Some((i as u32, false))
            } else {
                Self::locate(&self.ghosts, m).map(|g| (g as u32, true))
            };
            if let Some(hit) = hit {
                if last != Some(hit) {
                    out.push(hit.0);
                    is_ghost.push(hit.1);
                    last = Some(hit);
                }
            }
        }
        (out, is_ghost)
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Enumerate the unique node coordinates of the local octants and the
    /// per-octant node indices. Deterministic and idempotent: nodes appear
    /// in first-seen order over the sorted octants.
    pub fn update_connectivity(&mut self) {
        self.build_connectivity(false);
    }

    /// Extend the node table with ghost-only nodes and build the ghost
    /// connectivity.
    pub fn update_ghosts_connectivity(&mut self) {
        self.build_connectivity(true);
    }

    fn build_connectivity(&mut self, with_ghosts: bool) {
        fn push_octant(
            oct: &Octant,
            nnodes: usize,
            index: &mut HashMap<[u32; 3], u32>,
            nodes: &mut Vec<[u32; 3]>,
            conn: &mut Vec<u32>,
        ) {
            for k in 0..nnodes {
                let coord = oct.node(k);
                let id = match index.entry(coord) {
                    std::collections::hash_map::Entry::Occupied(e) => *e.get(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        let id = nodes.len() as u32;
                        nodes.push(coord);
                        e.insert(id);
                        id
                    }
                };
                conn.push(id);
            }
        }

        let nnodes = self.dim.nnodes();
        self.clear_connectivity();
        let mut index: HashMap<[u32; 3], u32> =
            HashMap::with_capacity(self.octants.len() * nnodes);

        let mut nodes = Vec::new();
        let mut connectivity = Vec::with_capacity(self.octants.len() * nnodes);
        for oct in &self.octants {
            push_octant(oct, nnodes, &mut index, &mut nodes, &mut connectivity);
        }
        let mut ghost_connectivity = Vec::new();
        if with_ghosts {
            ghost_connectivity.reserve(self.ghosts.len() * nnodes);
            for oct in &self.ghosts {
                push_octant(oct, nnodes, &mut index, &mut nodes, &mut ghost_connectivity);
            }
        }
        self.nodes = nodes;
        self.connectivity = connectivity;
        self.ghost_connectivity = ghost_connectivity;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn anchor_index(tree: &LocalTree, x: u32, y: u32) -> usize {
        tree.octants
            .iter()
            .position(|o| o.anchor() == [x, y, 0])
            .unwrap()
    }

    /// Brute-force 2:1 check over every incidence within the codimension.
    fn assert_balanced(tree: &LocalTree) {
        for idx in 0..tree.num_octants() {
            let oct = &tree.octants[idx];
            for inc in tree.incidence_list() {
                let (iface, codim) = match inc {
                    Incidence::Face(f) => (f, 1),
                    Incidence::Edge(e) => (e, 2),
                    Incidence::Node(k) => (k, tree.dim().n()),
                };
                let (neighbours, _) = tree.find_neighbours(idx, iface, codim);
                for &j in &neighbours {
                    let diff = (tree.octants[j as usize].level() as i16
                        - oct.level() as i16)
                        .abs();
                    assert!(diff <= 1, "2:1 violated between {idx} and {j}");
                }
            }
        }
    }

    #[test]
    fn refine_root_once() {
        // S1: a marked root becomes its four children.
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.octants[0].set_marker(1);
        let changed = tree.adapt_serial(None).unwrap();
        assert!(changed);
        assert_eq!(tree.num_octants(), 4);
        let h = 1u32 << 29;
        let anchors: Vec<[u32; 3]> = tree.octants.iter().map(|o| o.anchor()).collect();
        assert_eq!(anchors, vec![[0, 0, 0], [h, 0, 0], [0, h, 0], [h, h, 0]]);
        assert!(tree.octants.iter().all(|o| o.level() == 1));
        assert!(tree.octants.iter().all(|o| o.is_new_refined()));
        assert!(!tree.adapt_serial(None).unwrap());
    }

    #[test]
    fn face_balance_propagates() {
        // S2: a marker of two on the corner octant drags its face
        // neighbors one level down.
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        tree.refine_all(None);
        assert_eq!(tree.num_octants(), 16);
        tree.set_balance_codim(1);

        let q = 1u32 << 28;
        tree.octants[anchor_index(&tree, 0, 0)].set_marker(2);
        tree.adapt_serial(None).unwrap();

        // The octants east and north of the marked one refined once.
        assert_eq!(tree.octants[anchor_index(&tree, q, 0)].level(), 3);
        assert_eq!(tree.octants[anchor_index(&tree, 0, q)].level(), 3);
        // The diagonal neighbor is only corner-adjacent and stays put.
        assert_eq!(tree.octants[anchor_index(&tree, q, q)].level(), 2);
        assert_eq!(tree.num_octants(), 25);

        // Draining the leftover markers keeps the tree balanced.
        while tree.adapt_serial(None).unwrap() {}
        assert_eq!(tree.num_octants(), 37);
        assert_balanced(&tree);
    }

    #[test]
    fn balance_respects_opt_out() {
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        tree.refine_all(None);
        let q = 1u32 << 28;
        let east = anchor_index(&tree, q, 0);
        tree.octants[east].set_balanced(false);
        tree.octants[anchor_index(&tree, 0, 0)].set_marker(2);
        while tree.adapt_serial(None).unwrap() {}
        // The opted-out neighbor was never promoted.
        assert_eq!(tree.octants[anchor_index(&tree, q, 0)].level(), 2);
        // The northern neighbor still was.
        assert!(tree
            .octants
            .iter()
            .any(|o| o.anchor() == [0, q, 0] && o.level() == 3));
    }

    #[test]
    fn corner_balance_codim_two() {
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        tree.refine_all(None);
        tree.set_balance_codim(2);
        let q = 1u32 << 28;
        tree.octants[anchor_index(&tree, 0, 0)].set_marker(2);
        while tree.adapt_serial(None).unwrap() {}
        // With node balance on, the diagonal neighbor refines too.
        assert!(tree
            .octants
            .iter()
            .any(|o| o.anchor() == [q, q, 0] && o.level() == 3));
        assert_balanced(&tree);
    }

    #[test]
    fn coarsen_family() {
        // S3: four sibling leaves with negative markers collapse to the
        // root.
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        for oct in &mut tree.octants {
            oct.set_marker(-1);
        }
        let changed = tree.adapt_serial(None).unwrap();
        assert!(changed);
        assert_eq!(tree.num_octants(), 1);
        assert_eq!(tree.octants[0].level(), 0);
        assert!(tree.octants[0].is_new_coarsened());
        assert_eq!(tree.octants[0].marker(), 0);
    }

    #[test]
    fn partial_family_does_not_coarsen() {
        // S4: three of four markers are not enough.
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        for oct in tree.octants.iter_mut().take(3) {
            oct.set_marker(-1);
        }
        tree.adapt_serial(None).unwrap();
        assert_eq!(tree.num_octants(), 4);
        assert!(tree.octants.iter().all(|o| o.level() == 1));
        // The failed coarsen intent decayed toward zero.
        assert!(tree.octants.iter().all(|o| o.marker() == 0));
    }

    #[test]
    fn global_refine_3d() {
        // S5: four uniform refinements of the 3D root.
        let mut tree = LocalTree::new(Dim::Three, true);
        for _ in 0..4 {
            tree.refine_all(None);
        }
        assert_eq!(tree.num_octants(), 4096);
        assert!(tree.octants.iter().all(|o| o.level() == 4));
        tree.assert_invariants();
    }

    #[test]
    fn refine_then_coarsen_restores() {
        // Adapt-then-undo: refine everything, coarsen everything.
        let mut tree = LocalTree::new(Dim::Three, true);
        tree.refine_all(None);
        tree.refine_all(None);
        assert_eq!(tree.num_octants(), 64);
        tree.coarsen_all(None);
        tree.coarsen_all(None);
        assert_eq!(tree.num_octants(), 1);
        assert_eq!(tree.octants[0].level(), 0);
    }

    #[test]
    fn deep_marker_drains_over_adapts() {
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.octants[0].set_marker(3);
        let mut adapts = 0;
        while tree.adapt_serial(None).unwrap() {
            adapts += 1;
        }
        assert_eq!(adapts, 3);
        assert_eq!(tree.num_octants(), 64);
        assert!(tree.octants.iter().all(|o| o.level() == 3));
    }

    #[test]
    fn mapper_tracks_sources() {
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        // Refine the first leaf, coarsen nothing.
        tree.octants[0].set_marker(1);
        let mut mapper = Vec::new();
        tree.adapt_serial(Some(&mut mapper)).unwrap();
        assert_eq!(tree.num_octants(), 7);
        assert_eq!(mapper, vec![0, 0, 0, 0, 1, 2, 3]);

        // Now coarsen the four new leaves back into one.
        for i in 0..4 {
            tree.octants[i].set_marker(-1);
        }
        let mut mapper = Vec::new();
        tree.adapt_serial(Some(&mut mapper)).unwrap();
        assert_eq!(tree.num_octants(), 4);
        assert_eq!(mapper, vec![0, 4, 5, 6]);
        assert!(tree.octants[0].is_new_coarsened());
    }

    #[test]
    fn neighbour_search_mixed_levels() {
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        tree.refine_all(None);
        let q = 1u32 << 28;
        // Refine the east neighbor of the corner octant.
        tree.octants[anchor_index(&tree, q, 0)].set_marker(1);
        tree.adapt_serial(None).unwrap();

        // The corner octant now sees two finer leaves across its +x face.
        let corner = anchor_index(&tree, 0, 0);
        let (neighbours, is_ghost) = tree.find_neighbours(corner, 1, 1);
        assert_eq!(neighbours.len(), 2);
        assert!(is_ghost.iter().all(|&g| !g));
        let e = 1u32 << 27;
        assert_eq!(tree.octants[neighbours[0] as usize].anchor(), [q, 0, 0]);
        assert_eq!(tree.octants[neighbours[1] as usize].anchor(), [q, e, 0]);

        // Looking back from a fine leaf finds the single coarser octant.
        let fine = anchor_index(&tree, q, 0);
        let (back, _) = tree.find_neighbours(fine, 0, 1);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0] as usize, corner);

        // A domain-boundary face has no neighbors.
        let (none, _) = tree.find_neighbours(corner, 0, 1);
        assert!(none.is_empty());
    }

    #[test]
    fn node_neighbour_search() {
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        let h = 1u32 << 29;
        // Corner-adjacent neighbor across node 3 of the first child.
        let (hits, _) = tree.find_neighbours(anchor_index(&tree, 0, 0), 3, 2);
        assert_eq!(hits.len(), 1);
        assert_eq!(tree.octants[hits[0] as usize].anchor(), [h, h, 0]);
    }

    #[test]
    fn edge_neighbour_search_3d() {
        let mut tree = LocalTree::new(Dim::Three, true);
        tree.refine_all(None);
        let h = 1u32 << 19;
        let idx = tree
            .octants
            .iter()
            .position(|o| o.anchor() == [h, h, h])
            .unwrap();
        // Edge 0 of the last child runs along y at its -x,-z corner; the
        // diagonal neighbor is the second child.
        let (hits, _) = tree.find_neighbours(idx, 0, 2);
        assert_eq!(hits.len(), 1);
        assert_eq!(tree.octants[hits[0] as usize].anchor(), [0, h, 0]);
    }

    #[test]
    fn connectivity_counts_and_idempotence() {
        let mut tree = LocalTree::new(Dim::Two, true);
        tree.refine_all(None);
        tree.update_connectivity();
        // A 2x2 grid has 9 distinct nodes.
        assert_eq!(tree.nodes.len(), 9);
        assert_eq!(tree.connectivity.len(), 16);

        let nodes = tree.nodes.clone();
        let connectivity = tree.connectivity.clone();
        tree.update_connectivity();
        assert_eq!(tree.nodes, nodes);
        assert_eq!(tree.connectivity, connectivity);

        // Every octant references its own anchor as first node.
        for (i, oct) in tree.octants.iter().enumerate() {
            assert_eq!(tree.nodes[tree.connectivity[4 * i] as usize], oct.anchor());
        }
    }

    #[test]
    fn connectivity_3d_counts() {
        let mut tree = LocalTree::new(Dim::Three, true);
        tree.refine_all(None);
        tree.update_connectivity();
        assert_eq!(tree.nodes.len(), 27);
        assert_eq!(tree.connectivity.len(), 64);
    }
}
