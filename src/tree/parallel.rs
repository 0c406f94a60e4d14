//! The parallel tree coordinator.
//!
//! One [`ParaTree`] per rank owns the local slice of the global leaf
//! sequence and sequences the collective operations: adaptation (with the
//! cross-rank marker rounds and cross-border family coarsening), ghost halo
//! construction, load balancing with optional payload migration, and ghost
//! payload exchange. Every rank must call the collective methods in the
//! same order.

use itertools::Itertools;
use mpi::collective::SystemOperation;
use mpi::traits::{CommunicatorCollectives, Destination, Equivalence, Source};

use crate::buffer::CommBuffer;
use crate::constants::Dim;
use crate::data::{GhostData, MigrateData};
use crate::error::TreeError;
use crate::map::DomainMapper;
use crate::morton;
use crate::octant::{Octant, PackedOctant};
use crate::tools::{
    exchange_down, exchange_up, gather_to_all, global_inclusive_cumsum, redistribute,
    redistribute_with_counts,
};
use crate::vtk;

use super::{Incidence, LocalTree};

/// Epoch handle of the ghost halo.
///
/// Every collective that rebuilds the halo advances the epoch; payload
/// shadow arrays built for an older epoch no longer line up with the ghost
/// order and must be refilled through [`ParaTree::communicate`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GhostIndex(u64);

/// How a load balance slices the global sequence.
enum Partitioner<'a> {
    /// Equal octant counts.
    Uniform,
    /// Equal counts, with partition edges pulled back so no family within
    /// `levels` of the global maximum depth is split.
    Family(u8),
    /// Equal summed weight.
    Weighted(&'a [u64]),
}

/// Per-rank summary exchanged when the partition table is rebuilt.
#[derive(Copy, Clone, Default, Equivalence)]
struct RankState {
    count: u64,
    first_desc: u64,
    last_desc: u64,
    depth: u8,
}

/// Marker refresh record for one border octant.
#[derive(Copy, Clone, Default, Equivalence)]
struct MarkerMsg {
    marker: i8,
    balanced: u8,
}

/// Edge-of-rank family candidate, exchanged with both neighbors during
/// adaptation.
#[derive(Copy, Clone, Default, Equivalence)]
struct FamilyEdge {
    father_morton: u64,
    father_level: u8,
    /// Members of the candidate at this rank edge; zero when there is no
    /// candidate.
    count: u8,
    /// Every member carries a coarsen marker and keeps 2:1 enforcement.
    eligible: u8,
    /// The run is anchored: child zero for a trailing run, the last child
    /// for a leading run.
    anchored: u8,
}

/// The distributed linear octree facade.
///
/// Constructed collectively on every rank of the communicator; starts as a
/// single root octant owned by rank zero.
pub struct ParaTree<C: CommunicatorCollectives> {
    comm: C,
    rank: usize,
    size: usize,
    tree: LocalTree,
    map: DomainMapper,
    /// Inclusive last global index held by each rank; `-1` base for empty
    /// prefixes.
    partition_range: Vec<i64>,
    rank_counts: Vec<u64>,
    partition_first_desc: Vec<u64>,
    partition_last_desc: Vec<u64>,
    global_num_octants: u64,
    max_depth_global: u8,
    /// Local octant indices bordering each peer, ascending, in the order
    /// the peer's ghosts mirror them.
    border_per_proc: Vec<Vec<u32>>,
    /// Ghosts received from each peer (ghosts are stored concatenated in
    /// source-rank order).
    ghost_counts: Vec<i32>,
    ghost_epoch: u64,
}

enum AdaptMode {
    Markers,
    GlobalRefine,
    GlobalCoarse,
}

impl<C: CommunicatorCollectives> ParaTree<C> {
    /// A tree over the unit domain.
    pub fn new(dim: Dim, comm: C) -> Self {
        Self::with_domain(dim, [0.0; 3], 1.0, comm)
    }

    /// A tree over the cube `[origin, origin + length)^dim`.
    pub fn with_domain(dim: Dim, origin: [f64; 3], length: f64, comm: C) -> Self {
        let rank = comm.rank() as usize;
        let size = comm.size() as usize;
        let tree = LocalTree::new(dim, rank == 0);
        let mut pt = Self {
            comm,
            rank,
            size,
            tree,
            map: DomainMapper::new(dim, origin, length),
            partition_range: Vec::new(),
            rank_counts: Vec::new(),
            partition_first_desc: Vec::new(),
            partition_last_desc: Vec::new(),
            global_num_octants: 0,
            max_depth_global: 0,
            border_per_proc: Vec::new(),
            ghost_counts: Vec::new(),
            ghost_epoch: 0,
        };
        pt.update_global_state();
        pt.build_ghost_halo();
        pt
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Dimension tag of the tree.
    pub fn dim(&self) -> Dim {
        self.tree.dim()
    }

    /// Rank of this process.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.size
    }

    /// The domain mapper between logical and physical coordinates.
    pub fn domain(&self) -> &DomainMapper {
        &self.map
    }

    /// Number of local octants.
    pub fn num_octants(&self) -> usize {
        self.tree.num_octants()
    }

    /// Number of octants across all ranks.
    pub fn num_global_octants(&self) -> u64 {
        self.global_num_octants
    }

    /// Number of local ghosts.
    pub fn num_ghosts(&self) -> usize {
        self.tree.num_ghosts()
    }

    /// Deepest level present on any rank.
    pub fn global_max_depth(&self) -> u8 {
        self.max_depth_global
    }

    /// Codimension up to which 2:1 balance is enforced.
    pub fn balance_codim(&self) -> u8 {
        self.tree.balance_codim()
    }

    /// The current ghost halo epoch.
    pub fn ghost_index(&self) -> GhostIndex {
        GhostIndex(self.ghost_epoch)
    }

    /// Local octant `i`.
    pub fn octant(&self, i: usize) -> Option<&Octant> {
        self.tree.octants.get(i)
    }

    /// Ghost octant `g`.
    pub fn ghost_octant(&self, g: usize) -> Option<&Octant> {
        self.tree.ghosts.get(g)
    }

    /// Global index of local octant `i`.
    pub fn global_idx(&self, i: usize) -> u64 {
        let base = if self.rank == 0 {
            0
        } else {
            (self.partition_range[self.rank - 1] + 1) as u64
        };
        base + i as u64
    }

    /// Local index of `global` on `rank`, if that rank holds it.
    pub fn local_idx(&self, global: u64, rank: usize) -> Option<usize> {
        let base = if rank == 0 {
            0
        } else {
            (self.partition_range[rank - 1] + 1) as u64
        };
        let last = self.partition_range[rank];
        if last >= 0 && global >= base && global <= last as u64 {
            Some((global - base) as usize)
        } else {
            None
        }
    }

    /// Physical center of local octant `i`.
    pub fn center(&self, i: usize) -> Option<[f64; 3]> {
        self.octant(i).map(|o| self.map.map_center(o))
    }

    /// Physical corner nodes of local octant `i`, in Z-order.
    pub fn nodes(&self, i: usize) -> Option<Vec<[f64; 3]>> {
        self.octant(i).map(|o| self.map.map_nodes(o))
    }

    /// Physical center of ghost octant `g`.
    pub fn ghost_center(&self, g: usize) -> Option<[f64; 3]> {
        self.ghost_octant(g).map(|o| self.map.map_center(o))
    }

    /// The rank whose partition contains the given physical point.
    pub fn point_owner(&self, physical: [f64; 3]) -> usize {
        let logical = self.map.unmap_point(physical);
        let m = morton::encode(self.dim(), logical[0], logical[1], logical[2]);
        self.find_owner(m)
    }

    /// Inclusive last global index held by each rank (`-1` base: an empty
    /// prefix repeats the previous entry).
    pub fn partition_range_global_idx(&self) -> &[i64] {
        &self.partition_range
    }

    /// First-descendant Morton index of each rank's slice (`u64::MAX` for
    /// empty ranks).
    pub fn partition_first_descs(&self) -> &[u64] {
        &self.partition_first_desc
    }

    /// Last-descendant Morton index of each rank's slice, carried over
    /// empty ranks.
    pub fn partition_last_descs(&self) -> &[u64] {
        &self.partition_last_desc
    }

    // ------------------------------------------------------------------
    // Mutation (local, non-collective)
    // ------------------------------------------------------------------

    /// Set the refine/coarsen intent of local octant `i`.
    pub fn set_marker(&mut self, i: usize, marker: i8) -> Result<(), TreeError> {
        let oct = self
            .tree
            .octants
            .get_mut(i)
            .ok_or(TreeError::InvalidIndex(i))?;
        oct.set_marker(marker);
        Ok(())
    }

    /// Toggle 2:1 enforcement for local octant `i`.
    pub fn set_balance(&mut self, i: usize, balanced: bool) -> Result<(), TreeError> {
        let oct = self
            .tree
            .octants
            .get_mut(i)
            .ok_or(TreeError::InvalidIndex(i))?;
        oct.set_balanced(balanced);
        Ok(())
    }

    /// Set the balance codimension (clamped to `dim`).
    pub fn set_balance_codim(&mut self, codim: u8) {
        self.tree.set_balance_codim(codim);
    }

    /// All leaves incident on direction `iface` of codimension `codim` of
    /// local octant `idx`; the flag vector marks ghost hits.
    pub fn find_neighbours(&self, idx: usize, iface: usize, codim: usize) -> (Vec<u32>, Vec<bool>) {
        self.tree.find_neighbours(idx, iface, codim)
    }

    // ------------------------------------------------------------------
    // Collectives
    // ------------------------------------------------------------------

    /// Adapt the tree to the current markers: cross-rank marker balance,
    /// one refine sweep, one coarsen sweep, then partition and halo
    /// refresh. Returns whether any rank changed its leaves.
    pub fn adapt(&mut self) -> Result<bool, TreeError> {
        self.adapt_impl(None, None, AdaptMode::Markers)
    }

    /// [`ParaTree::adapt`], filling `mapper` with the pre-adapt local index
    /// that produced each post-adapt octant (the first family member for a
    /// coarsened father). Octants received from the right neighbor through
    /// cross-border coarsening map to indices at and above the pre-adapt
    /// count.
    pub fn adapt_mapped(&mut self, mapper: &mut Vec<u32>) -> Result<bool, TreeError> {
        self.adapt_impl(Some(mapper), None, AdaptMode::Markers)
    }

    /// [`ParaTree::adapt`], carrying a per-octant payload through the
    /// adaptation: straight copies for surviving octants,
    /// [`MigrateData::refine_into`] under refined families and
    /// [`MigrateData::coarsen_into`] under coarsened ones.
    pub fn adapt_with_data<D: MigrateData>(&mut self, data: &mut D) -> Result<bool, TreeError> {
        self.adapt_impl(None, Some(data), AdaptMode::Markers)
    }

    /// Refine every octant on every rank once.
    pub fn adapt_global_refine(&mut self) -> Result<bool, TreeError> {
        self.adapt_impl(None, None, AdaptMode::GlobalRefine)
    }

    /// Coarsen every complete family on every rank once.
    pub fn adapt_global_coarse(&mut self) -> Result<bool, TreeError> {
        self.adapt_impl(None, None, AdaptMode::GlobalCoarse)
    }

    /// Rebuild the ghost halo (and the partition tables) without adapting.
    pub fn update_ghosts(&mut self) {
        self.update_global_state();
        self.build_ghost_halo();
    }

    /// Rebuild the node table and per-octant connectivity of the local
    /// octants.
    pub fn update_connectivity(&mut self) {
        self.tree.update_connectivity();
    }

    /// Rebuild connectivity including the ghost octants.
    pub fn update_ghosts_connectivity(&mut self) {
        self.tree.update_ghosts_connectivity();
    }

    /// Unique logical node coordinates (after `update_connectivity`).
    pub fn logical_nodes(&self) -> &[[u32; 3]] {
        &self.tree.nodes
    }

    /// Per-octant node indices, `nnodes` per octant.
    pub fn connectivity(&self) -> &[u32] {
        &self.tree.connectivity
    }

    /// Per-ghost node indices (after `update_ghosts_connectivity`).
    pub fn ghost_connectivity(&self) -> &[u32] {
        &self.tree.ghost_connectivity
    }

    /// Equalise octant counts across ranks.
    pub fn load_balance(&mut self) -> Result<(), TreeError> {
        self.load_balance_impl(Partitioner::Uniform, None)
    }

    /// Equalise octant counts, keeping families within `levels` of the
    /// global maximum depth on one rank.
    pub fn load_balance_levels(&mut self, levels: u8) -> Result<(), TreeError> {
        self.load_balance_impl(Partitioner::Family(levels), None)
    }

    /// Slice the global sequence at equal summed per-octant weight.
    pub fn load_balance_weighted(&mut self, weights: &[u64]) -> Result<(), TreeError> {
        self.load_balance_impl(Partitioner::Weighted(weights), None)
    }

    /// [`ParaTree::load_balance_levels`], migrating a per-octant payload
    /// along with the octants.
    pub fn load_balance_with_data<D: MigrateData>(
        &mut self,
        data: &mut D,
        levels: u8,
    ) -> Result<(), TreeError> {
        self.load_balance_impl(Partitioner::Family(levels), Some(data))
    }

    /// Mirror the payload of border octants onto the peers' ghost shadows.
    pub fn communicate<D: GhostData>(&mut self, data: &mut D) -> Result<GhostIndex, TreeError> {
        if self.size > 1 {
            let mut buf = CommBuffer::new();
            let mut byte_counts = vec![0i32; self.size];
            for (p, border) in self.border_per_proc.iter().enumerate() {
                let before = buf.len();
                for &i in border {
                    data.gather(&mut buf, i as usize);
                }
                byte_counts[p] = (buf.len() - before) as i32;
            }

            let (recv, recv_byte_counts) =
                redistribute_with_counts(buf.as_bytes(), &byte_counts, &self.comm);

            let mut ghost = 0usize;
            let mut offset = 0usize;
            for p in 0..self.size {
                let nbytes = recv_byte_counts[p] as usize;
                let mut rx = CommBuffer::from_bytes(recv[offset..offset + nbytes].to_vec());
                for _ in 0..self.ghost_counts[p] {
                    data.scatter(&mut rx, ghost)?;
                    ghost += 1;
                }
                offset += nbytes;
            }
            debug_assert_eq!(ghost, self.tree.num_ghosts());
        }
        Ok(GhostIndex(self.ghost_epoch))
    }

    /// Write the local leaves as a VTU piece
    /// (`s<NNNN>-p<NNNN>-<name>.vtu`) plus, on rank zero, the PVTU master
    /// (`s<NNNN>-<name>.pvtu`).
    pub fn write_vtu(&mut self, name: &str) -> std::io::Result<()> {
        if self.tree.connectivity.is_empty() {
            self.tree.update_connectivity();
        }
        vtk::write(&self.tree, &self.map, self.rank, self.size, name, None)
    }

    /// [`ParaTree::write_vtu`] with a per-octant scalar attached to the
    /// cells.
    pub fn write_vtu_scalar(&mut self, name: &str, data: &[f64]) -> std::io::Result<()> {
        if self.tree.connectivity.is_empty() {
            self.tree.update_connectivity();
        }
        vtk::write(&self.tree, &self.map, self.rank, self.size, name, Some(data))
    }

    // ------------------------------------------------------------------
    // Partition bookkeeping
    // ------------------------------------------------------------------

    fn update_global_state(&mut self) {
        self.tree.refresh_depth();
        let n = self.tree.num_octants() as u64;

        if self.size == 1 {
            self.rank_counts = vec![n];
            self.partition_range = vec![n as i64 - 1];
            self.partition_first_desc = vec![self.tree.first_desc_morton().unwrap_or(u64::MAX)];
            self.partition_last_desc = vec![self.tree.last_desc_morton().unwrap_or(0)];
            self.global_num_octants = n;
            self.max_depth_global = self.tree.local_max_depth();
            return;
        }

        let state = RankState {
            count: n,
            first_desc: self.tree.first_desc_morton().unwrap_or(u64::MAX),
            last_desc: self.tree.last_desc_morton().unwrap_or(0),
            depth: self.tree.local_max_depth(),
        };
        let states = gather_to_all(std::slice::from_ref(&state), &self.comm);

        self.rank_counts = states.iter().map(|s| s.count).collect();
        self.partition_first_desc = states.iter().map(|s| s.first_desc).collect();
        self.global_num_octants = self.rank_counts.iter().sum();
        self.max_depth_global = states
            .iter()
            .filter(|s| s.count > 0)
            .map(|s| s.depth)
            .max()
            .unwrap_or(0);

        // The inclusive index table; empty ranks repeat the previous entry.
        self.partition_range = states
            .iter()
            .scan(-1i64, |acc, s| {
                *acc += s.count as i64;
                Some(*acc)
            })
            .collect();

        // Carry the last-descendant sentinels over empty ranks so the
        // owner search sees a non-decreasing table.
        let mut carried = 0u64;
        self.partition_last_desc = states
            .iter()
            .map(|s| {
                if s.count > 0 {
                    carried = s.last_desc;
                }
                carried
            })
            .collect();
    }

    /// The rank owning the leaf that contains Morton index `m`.
    fn find_owner(&self, m: u64) -> usize {
        let mut r = self.partition_last_desc.partition_point(|&last| last < m);
        r = r.min(self.size - 1);
        while r < self.size - 1 && self.rank_counts[r] == 0 {
            r += 1;
        }
        r
    }

    // ------------------------------------------------------------------
    // Ghost halo
    // ------------------------------------------------------------------

    fn build_ghost_halo(&mut self) {
        self.ghost_epoch += 1;
        if self.size == 1 {
            self.tree.ghosts.clear();
            self.border_per_proc = vec![Vec::new()];
            self.ghost_counts = vec![0];
            self.tree.refresh_depth();
            return;
        }

        for oct in &mut self.tree.octants {
            oct.clear_pbound();
            oct.set_aux(false);
        }

        let incidences = self.tree.incidence_list();
        let maxdepth = self.max_depth_global;
        let mut border: Vec<Vec<u32>> = vec![Vec::new(); self.size];

        for i in 0..self.tree.num_octants() {
            let oct = self.tree.octants[i];
            for &inc in &incidences {
                let candidates = self.tree.virtual_candidates(&oct, inc, maxdepth);
                let mut foreign = false;
                for &m in &candidates {
                    let owner = self.find_owner(m);
                    if owner != self.rank {
                        foreign = true;
                        let list = &mut border[owner];
                        if list.last() != Some(&(i as u32)) {
                            list.push(i as u32);
                        }
                    }
                }
                if foreign {
                    self.tree.octants[i].set_aux(true);
                    if let Incidence::Face(f) = inc {
                        self.tree.octants[i].set_pbound(f, true);
                    }
                }
            }
        }

        let counts: Vec<i32> = border.iter().map(|b| b.len() as i32).collect();
        let packed: Vec<PackedOctant> = border
            .iter()
            .flat_map(|b| b.iter().map(|&i| PackedOctant::pack(&self.tree.octants[i as usize])))
            .collect();

        let (received, recv_counts) = redistribute_with_counts(&packed, &counts, &self.comm);
        let dim = self.dim();
        self.tree.ghosts = received.iter().map(|p| p.unpack(dim)).collect();
        self.ghost_counts = recv_counts;
        self.border_per_proc = border;
        self.tree.refresh_depth();
        self.tree.assert_invariants();

        log::debug!(
            "rank {}: halo rebuilt, {} ghosts from {} peers (epoch {})",
            self.rank,
            self.tree.num_ghosts(),
            self.ghost_counts.iter().filter(|&&c| c > 0).count(),
            self.ghost_epoch,
        );
    }

    /// Refresh the markers and balance bits of the ghost shadow from the
    /// owning ranks.
    fn exchange_markers(&mut self) {
        let counts: Vec<i32> = self.border_per_proc.iter().map(|b| b.len() as i32).collect();
        let msgs: Vec<MarkerMsg> = self
            .border_per_proc
            .iter()
            .flat_map(|b| {
                b.iter().map(|&i| {
                    let oct = &self.tree.octants[i as usize];
                    MarkerMsg {
                        marker: oct.marker(),
                        balanced: oct.is_balanced() as u8,
                    }
                })
            })
            .collect();

        let received = redistribute(&msgs, &counts, &self.comm);
        debug_assert_eq!(received.len(), self.tree.num_ghosts());
        for (ghost, msg) in self.tree.ghosts.iter_mut().zip(&received) {
            ghost.set_marker(msg.marker);
            ghost.set_balanced(msg.balanced != 0);
        }
    }

    // ------------------------------------------------------------------
    // Adaptation
    // ------------------------------------------------------------------

    fn adapt_impl(
        &mut self,
        mapper: Option<&mut Vec<u32>>,
        mut data: Option<&mut dyn MigrateData>,
        mode: AdaptMode,
    ) -> Result<bool, TreeError> {
        let before = self.tree.num_octants();
        // A mapper is materialised whenever the caller wants one or a
        // payload has to be carried.
        let want_map = mapper.is_some() || data.is_some();
        let mut final_map = Vec::new();
        // Octants drained from the local front by cross-border shipping;
        // every surviving local index is shifted down by this much.
        let mut shipped = 0;

        let changed_local = match mode {
            AdaptMode::Markers if self.size == 1 => self
                .tree
                .adapt_serial(want_map.then_some(&mut final_map))?,
            AdaptMode::Markers => {
                self.tree.clear_adapt_flags();
                self.tree.clear_connectivity();

                // Marker balance in lockstep: each round refreshes the
                // ghost markers, relaxes locally and agrees on whether
                // anything moved anywhere.
                let max_rounds = 2 * self.dim().max_level() as usize + 2;
                let mut rounds = 0;
                loop {
                    self.exchange_markers();
                    let changed = self.tree.balance21()?;
                    let mut global_changed = false;
                    self.comm.all_reduce_into(
                        &changed,
                        &mut global_changed,
                        SystemOperation::logical_or(),
                    );
                    if !global_changed {
                        break;
                    }
                    rounds += 1;
                    if rounds > max_rounds {
                        return Err(TreeError::BalanceDiverged(rounds));
                    }
                }
                shipped = match data.as_deref_mut() {
                    Some(d) => self.cross_border_coarsen(false, Some(d)),
                    None => self.cross_border_coarsen(false, None),
                };

                let mut refine_map = Vec::new();
                let mut coarsen_map = Vec::new();
                let refined = self.tree.refine_sweep(want_map.then_some(&mut refine_map));
                let coarsened = self.tree.coarsen_sweep(want_map.then_some(&mut coarsen_map));
                if want_map {
                    final_map = coarsen_map
                        .iter()
                        .map(|&j| refine_map[j as usize])
                        .collect();
                }
                refined || coarsened
            }
            AdaptMode::GlobalRefine => {
                self.tree.clear_adapt_flags();
                self.tree.clear_connectivity();
                self.tree.refine_all(want_map.then_some(&mut final_map))
            }
            AdaptMode::GlobalCoarse => {
                self.tree.clear_adapt_flags();
                self.tree.clear_connectivity();
                if self.size > 1 {
                    shipped = match data.as_deref_mut() {
                        Some(d) => self.cross_border_coarsen(true, Some(d)),
                        None => self.cross_border_coarsen(true, None),
                    };
                }
                self.tree.coarsen_all(want_map.then_some(&mut final_map))
            }
        };

        // The payload adapter storage was shifted in lockstep with the
        // octants during shipping, so it consumes the sweep map as is.
        if let Some(data) = data {
            self.apply_adapt_data(data, &final_map);
        }
        if let Some(mapper) = mapper {
            // The caller's mapper is promised true pre-adapt local
            // indices. Sweep entries count from the post-shipping array:
            // adding back the shipped prefix restores surviving indices
            // and lands received members at `before` and above.
            if shipped > 0 {
                for m in &mut final_map {
                    *m += shipped as u32;
                }
            }
            *mapper = final_map;
        }

        self.update_global_state();
        self.build_ghost_halo();

        let changed = if self.size > 1 {
            let mut global_changed = false;
            self.comm.all_reduce_into(
                &changed_local,
                &mut global_changed,
                SystemOperation::logical_or(),
            );
            global_changed
        } else {
            changed_local
        };

        log::debug!(
            "rank {}: adapt {} -> {} octants ({} global)",
            self.rank,
            before,
            self.tree.num_octants(),
            self.global_num_octants,
        );
        Ok(changed)
    }

    /// Drive the payload interpolation hooks from the adapt mapper.
    fn apply_adapt_data(&self, data: &mut dyn MigrateData, mapper: &[u32]) {
        let nc = self.dim().nchildren();
        let n = self.tree.num_octants();
        debug_assert_eq!(mapper.len(), n);

        data.begin_adapt(n);
        let mut i = 0;
        while i < n {
            let oct = &self.tree.octants[i];
            if oct.is_new_refined() {
                // A refined family is consecutive and maps to one father.
                debug_assert!((1..nc).all(|k| mapper[i + k] == mapper[i]));
                data.refine_into(i..i + nc, mapper[i] as usize);
                i += nc;
            } else if oct.is_new_coarsened() {
                let src = mapper[i] as usize;
                data.coarsen_into(i, src..src + nc);
                i += 1;
            } else {
                data.assign(i, mapper[i] as usize);
                i += 1;
            }
        }
        data.end_adapt();
    }

    // ------------------------------------------------------------------
    // Cross-border family coarsening
    // ------------------------------------------------------------------

    /// A family straddling two adjacent ranks cannot coarsen locally. Both
    /// sides describe their edge candidate to each other; when the two runs
    /// complete a family, the right rank ships its members to the left rank
    /// (the designated owner), which coarsens them in the regular sweep.
    /// Returns how many octants were shipped away from the local front.
    fn cross_border_coarsen(
        &mut self,
        unconditional: bool,
        data: Option<&mut dyn MigrateData>,
    ) -> usize {
        let nc = self.dim().nchildren();

        let trailing = self.trailing_candidate(unconditional);
        let leading = self.leading_candidate(unconditional);

        // Trailing metadata travels right, leading metadata travels left.
        let left_trailing = exchange_up(&trailing, &self.comm);
        let right_leading = exchange_down(&leading, &self.comm);

        let completes = |t: &FamilyEdge, l: &FamilyEdge| {
            t.count > 0
                && l.count > 0
                && t.anchored != 0
                && l.anchored != 0
                && t.eligible != 0
                && l.eligible != 0
                && t.father_morton == l.father_morton
                && t.father_level == l.father_level
                && t.count as usize + l.count as usize == nc
        };

        let recv_from_right = match right_leading {
            Some(l) if completes(&trailing, &l) => Some(l.count as usize),
            _ => None,
        };
        let send_to_left = match left_trailing {
            Some(t) if completes(&t, &leading) => Some(leading.count as usize),
            _ => None,
        };

        if recv_from_right.is_none() && send_to_left.is_none() {
            return 0;
        }

        // Ships are ordered by rank parity so each pair has one sender and
        // one posted receiver.
        let mut data = data;
        if self.rank % 2 == 0 {
            if let Some(k) = recv_from_right {
                match data.as_deref_mut() {
                    Some(d) => self.receive_family_members(k, Some(d)),
                    None => self.receive_family_members(k, None),
                }
            }
            if let Some(k) = send_to_left {
                match data.as_deref_mut() {
                    Some(d) => self.ship_family_members(k, Some(d)),
                    None => self.ship_family_members(k, None),
                }
            }
        } else {
            if let Some(k) = send_to_left {
                match data.as_deref_mut() {
                    Some(d) => self.ship_family_members(k, Some(d)),
                    None => self.ship_family_members(k, None),
                }
            }
            if let Some(k) = recv_from_right {
                match data.as_deref_mut() {
                    Some(d) => self.receive_family_members(k, Some(d)),
                    None => self.receive_family_members(k, None),
                }
            }
        }
        self.tree.refresh_depth();
        self.tree.assert_invariants();
        send_to_left.unwrap_or(0)
    }

    /// Ship the `k` leading local octants (and payload) to the previous
    /// rank.
    fn ship_family_members(&mut self, k: usize, data: Option<&mut dyn MigrateData>) {
        let packed: Vec<PackedOctant> = self.tree.octants[..k]
            .iter()
            .map(PackedOctant::pack)
            .collect();
        let left = self.comm.process_at_rank(self.rank as i32 - 1);
        left.send(&packed[..]);
        if let Some(data) = data {
            let mut buf = CommBuffer::new();
            data.gather_range(&mut buf, 0..k);
            left.send(buf.as_bytes());
            data.drop_front(k);
        }
        self.tree.octants.drain(..k);
    }

    /// Append `k` octants (and payload) arriving from the next rank.
    fn receive_family_members(&mut self, k: usize, data: Option<&mut dyn MigrateData>) {
        let right = self.comm.process_at_rank(self.rank as i32 + 1);
        let (packed, _status) = right.receive_vec::<PackedOctant>();
        debug_assert_eq!(packed.len(), k);
        let dim = self.dim();
        self.tree
            .octants
            .extend(packed.iter().map(|p| p.unpack(dim)));
        if let Some(data) = data {
            let (bytes, _status) = right.receive_vec::<u8>();
            let mut rx = CommBuffer::from_bytes(bytes);
            data.scatter_range(&mut rx, k)
                .expect("family payload truncated");
        }
    }

    /// The run of trailing local octants forming the left part of a family
    /// whose remaining members live on the next rank.
    fn trailing_candidate(&self, unconditional: bool) -> FamilyEdge {
        let octants = &self.tree.octants;
        let Some(last) = octants.last() else {
            return FamilyEdge::default();
        };
        if last.level() == 0 {
            return FamilyEdge::default();
        }
        let father = last.father();
        let count = octants
            .iter()
            .rev()
            .take_while(|o| o.level() == last.level() && o.father() == father)
            .count();
        if count == 0 || count >= self.dim().nchildren() {
            // A complete family coarsens locally.
            return FamilyEdge::default();
        }
        let members = &octants[octants.len() - count..];
        FamilyEdge {
            father_morton: father.morton(),
            father_level: father.level(),
            count: count as u8,
            eligible: (unconditional
                || members.iter().all(|m| m.marker() <= -1 && m.is_balanced()))
                as u8,
            anchored: (members[0].child_index() == 0) as u8,
        }
    }

    /// The run of leading local octants forming the right part of a family
    /// whose first members live on the previous rank.
    fn leading_candidate(&self, unconditional: bool) -> FamilyEdge {
        let octants = &self.tree.octants;
        let Some(first) = octants.first() else {
            return FamilyEdge::default();
        };
        if first.level() == 0 {
            return FamilyEdge::default();
        }
        let father = first.father();
        let count = octants
            .iter()
            .take_while(|o| o.level() == first.level() && o.father() == father)
            .count();
        if count == 0 || count >= self.dim().nchildren() {
            return FamilyEdge::default();
        }
        let members = &octants[..count];
        FamilyEdge {
            father_morton: father.morton(),
            father_level: father.level(),
            count: count as u8,
            eligible: (unconditional
                || members.iter().all(|m| m.marker() <= -1 && m.is_balanced()))
                as u8,
            anchored: (members[count - 1].child_index() == self.dim().nchildren() - 1) as u8,
        }
    }

    // ------------------------------------------------------------------
    // Load balance
    // ------------------------------------------------------------------

    fn load_balance_impl(
        &mut self,
        partitioner: Partitioner<'_>,
        mut data: Option<&mut dyn MigrateData>,
    ) -> Result<(), TreeError> {
        if self.size == 1 {
            return Ok(());
        }
        let g = self.global_num_octants;
        if g == 0 {
            return Ok(());
        }

        let new_range = match partitioner {
            Partitioner::Uniform => self.uniform_partition(),
            Partitioner::Family(levels) => self.family_partition(levels),
            Partitioner::Weighted(weights) => self.weighted_partition(weights),
        };

        // Send counts: overlap of the local global range with each rank's
        // new slice.
        let my_first = self.global_idx(0) as i64;
        let my_last = self.partition_range[self.rank];
        let n = self.tree.num_octants();
        let mut counts = vec![0i32; self.size];
        for r in 0..self.size {
            let lo = if r == 0 { 0 } else { new_range[r - 1] + 1 };
            let hi = new_range[r];
            let overlap = (my_last.min(hi) - my_first.max(lo) + 1).max(0);
            counts[r] = overlap as i32;
        }
        debug_assert_eq!(counts.iter().sum::<i32>() as usize, n);

        // Payload bytes are gathered before the octants move.
        let payload = data.as_deref_mut().map(|data| {
            let mut buf = CommBuffer::new();
            let mut byte_counts = vec![0i32; self.size];
            let mut offset = 0usize;
            for (r, &c) in counts.iter().enumerate() {
                let before = buf.len();
                data.gather_range(&mut buf, offset..offset + c as usize);
                byte_counts[r] = (buf.len() - before) as i32;
                offset += c as usize;
            }
            (buf, byte_counts)
        });

        let packed: Vec<PackedOctant> =
            self.tree.octants.iter().map(PackedOctant::pack).collect();
        let (received, recv_counts) = redistribute_with_counts(&packed, &counts, &self.comm);
        let dim = self.dim();
        self.tree.octants = received.iter().map(|p| p.unpack(dim)).collect();

        // Received runs are sorted and source ranks are ordered along the
        // Morton curve, so the concatenation is already sorted.
        debug_assert!(self
            .tree
            .octants
            .iter()
            .tuple_windows()
            .all(|(a, b)| a < b));

        if let Some(data) = data {
            let (buf, byte_counts) = payload.unwrap();
            let (recv_bytes, recv_byte_counts) =
                redistribute_with_counts(buf.as_bytes(), &byte_counts, &self.comm);
            data.clear();
            let mut offset = 0usize;
            for p in 0..self.size {
                let nbytes = recv_byte_counts[p] as usize;
                let mut rx = CommBuffer::from_bytes(recv_bytes[offset..offset + nbytes].to_vec());
                data.scatter_range(&mut rx, recv_counts[p] as usize)?;
                offset += nbytes;
            }
        }

        self.update_global_state();
        self.build_ghost_halo();

        log::debug!(
            "rank {}: load balance {} -> {} octants",
            self.rank,
            n,
            self.tree.num_octants(),
        );
        Ok(())
    }

    fn uniform_partition(&self) -> Vec<i64> {
        let g = self.global_num_octants;
        let p = self.size as u64;
        (0..self.size)
            .map(|r| ((r as u64 + 1) * g / p) as i64 - 1)
            .collect()
    }

    /// Uniform targets, with each partition edge pulled back until it no
    /// longer separates two octants sharing an ancestor finer than
    /// `max_depth_global - levels`.
    fn family_partition(&self, levels: u8) -> Vec<i64> {
        let uniform = self.uniform_partition();
        let threshold = self.max_depth_global.saturating_sub(levels);

        let my_first = self.global_idx(0) as i64;
        let my_last = self.partition_range[self.rank];
        let n = self.tree.num_octants();

        let splits_protected = |a: &Octant, b: &Octant| {
            a.level() > threshold
                && b.level() > threshold
                && a.ancestor_morton(threshold) == b.ancestor_morton(threshold)
        };

        // Each rank adjusts the edges that fall inside its current range;
        // everyone else proposes the identity and a min-reduction merges.
        let mut proposal = vec![i64::MAX; self.size - 1];
        for (r, &b) in uniform.iter().take(self.size - 1).enumerate() {
            if n == 0 || b < my_first || b > my_last {
                continue;
            }
            let mut li = (b - my_first) as usize;
            let mut adjusted = b;
            while li + 1 < n
                && splits_protected(&self.tree.octants[li], &self.tree.octants[li + 1])
            {
                if li == 0 {
                    adjusted = my_first - 1;
                    break;
                }
                li -= 1;
                adjusted -= 1;
            }
            // An edge at the end of the local range cannot be checked
            // against the next rank's first octant and is left in place.
            proposal[r] = adjusted.min(b);
        }

        let mut merged = vec![0i64; self.size - 1];
        self.comm
            .all_reduce_into(&proposal[..], &mut merged[..], SystemOperation::min());

        let mut new_range: Vec<i64> = Vec::with_capacity(self.size);
        let mut prev = -1i64;
        for r in 0..self.size - 1 {
            let b = if merged[r] == i64::MAX {
                uniform[r]
            } else {
                merged[r]
            };
            let b = b.max(prev);
            new_range.push(b);
            prev = b;
        }
        new_range.push(self.global_num_octants as i64 - 1);
        new_range
    }

    fn weighted_partition(&self, weights: &[u64]) -> Vec<i64> {
        assert_eq!(weights.len(), self.tree.num_octants());
        let scan = global_inclusive_cumsum(weights, &self.comm);

        // Total weight lives in the last entry of the last non-empty rank;
        // a max-reduction spreads it without a dedicated broadcast.
        let local_top = scan.last().copied().unwrap_or(0);
        let mut total = 0u64;
        self.comm
            .all_reduce_into(&local_top, &mut total, SystemOperation::max());
        if total == 0 {
            return self.uniform_partition();
        }

        // Count, for every rank slice, how many local octants fall at or
        // below its weight target, then sum the counts globally.
        let p = self.size as u64;
        let mut local_counts = vec![0u64; self.size];
        for (r, count) in local_counts.iter_mut().enumerate() {
            let target = (r as u64 + 1) * total / p;
            *count = scan.partition_point(|&s| s <= target) as u64;
        }
        let mut global_counts = vec![0u64; self.size];
        self.comm
            .all_reduce_into(&local_counts[..], &mut global_counts[..], SystemOperation::sum());

        let g = self.global_num_octants as i64;
        let mut new_range: Vec<i64> = global_counts.iter().map(|&c| c as i64 - 1).collect();
        new_range[self.size - 1] = g - 1;
        let mut prev = -1i64;
        for b in &mut new_range {
            *b = (*b).max(prev);
            prev = *b;
        }
        new_range
    }
}
