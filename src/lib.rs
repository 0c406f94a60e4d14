//! A distributed linear octree/quadtree library for adaptive mesh
//! refinement.
//!
//! A single logical square (2D) or cubic (3D) domain is partitioned among
//! the ranks of an MPI communicator into a globally sorted sequence of
//! leaf *octants* identified by Morton indices. Each rank owns a
//! contiguous slice of the sequence; a one-deep halo of *ghost* octants
//! mirrors the peers' leaves adjacent to the slice.
//!
//! The tree is driven through per-octant refine/coarsen markers: the host
//! marks leaves, then calls [`ParaTree::adapt`], which balances markers
//! across ranks so that no two adjacent leaves end up more than one level
//! apart (2:1 balance, configurable up to face/edge/corner adjacency),
//! refines and coarsens in single Morton-order sweeps, and rebuilds the
//! partition tables and the ghost halo. [`ParaTree::load_balance`]
//! redistributes leaves across ranks while preserving the global Morton
//! order, optionally migrating per-octant payloads through a
//! [`MigrateData`] adapter; [`ParaTree::communicate`] mirrors payloads
//! onto ghosts through a [`GhostData`] adapter.
//!
//! ## Using the library
//!
//! ```no_run
//! use octamr::{Dim, ParaTree};
//!
//! let universe = mpi::initialize().unwrap();
//! let mut tree = ParaTree::new(Dim::Two, universe.world());
//!
//! // Refine twice everywhere, then once more around the domain center.
//! tree.adapt_global_refine().unwrap();
//! tree.adapt_global_refine().unwrap();
//! for i in 0..tree.num_octants() {
//!     let c = tree.center(i).unwrap();
//!     if (c[0] - 0.5).abs() < 0.25 && (c[1] - 0.5).abs() < 0.25 {
//!         tree.set_marker(i, 1).unwrap();
//!     }
//! }
//! tree.adapt().unwrap();
//! tree.load_balance().unwrap();
//! ```
//!
//! All collective methods ([`ParaTree::adapt`] and friends,
//! [`ParaTree::load_balance`], [`ParaTree::communicate`],
//! [`ParaTree::update_ghosts`]) must be called in the same order on every
//! rank. Queries and marker setters are purely local.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod buffer;
pub mod constants;
pub mod data;
pub mod error;
pub mod map;
pub mod morton;
pub mod octant;
mod tools;
mod tree;
mod vtk;

pub use crate::buffer::CommBuffer;
pub use crate::constants::Dim;
pub use crate::data::{GhostData, MigrateData, VecGhostData, VecMigrateData};
pub use crate::error::TreeError;
pub use crate::map::DomainMapper;
pub use crate::octant::Octant;
pub use crate::tree::parallel::{GhostIndex, ParaTree};
