//! Distribute a uniformly refined quadtree across ranks, migrate a
//! per-octant payload, then coarsen everything back through the
//! cross-border family protocol, checking the adapt mapper against the
//! pre-adapt state. Run with any rank count up to eight, e.g.
//! `mpirun -n 2 load_balance`.

use mpi::traits::Communicator;
use octamr::{Dim, ParaTree, VecMigrateData};
use rand::prelude::*;

fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let size = world.size() as u64;
    let rank = world.rank() as usize;

    let mut tree = ParaTree::new(Dim::Two, world);

    // Three uniform refinements; all 64 leaves start on rank zero.
    for _ in 0..3 {
        tree.adapt_global_refine().unwrap();
    }
    assert_eq!(tree.num_global_octants(), 64);
    if rank > 0 {
        assert_eq!(tree.num_octants(), 0);
    }

    tree.load_balance().unwrap();
    let expect =
        ((rank as u64 + 1) * 64 / size - rank as u64 * 64 / size) as usize;
    assert_eq!(tree.num_octants(), expect);
    assert_eq!(tree.num_global_octants(), 64);

    // Running it again must be a no-op.
    tree.load_balance().unwrap();
    assert_eq!(tree.num_octants(), expect);

    // Attach each leaf's Morton index as payload, then rebalance with a
    // lopsided weight so octants (and payload) actually move. Protecting
    // one level keeps families of four together.
    let mut payload: Vec<f64> = (0..tree.num_octants())
        .map(|i| tree.octant(i).unwrap().morton() as f64)
        .collect();
    {
        let mut data = VecMigrateData::new(&mut payload, |children: &[f64]| {
            children.iter().sum::<f64>() / children.len() as f64
        });
        tree.load_balance_with_data(&mut data, 1).unwrap();
    }
    assert_eq!(payload.len(), tree.num_octants());
    for (i, &value) in payload.iter().enumerate() {
        assert_eq!(value, tree.octant(i).unwrap().morton() as f64);
    }
    println!(
        "rank {}: {} octants after family-preserving balance",
        rank,
        tree.num_octants()
    );

    // Random weights skew the partition off the family grid, so with high
    // odds some family straddles a rank edge and gets shipped to its left
    // owner during the coarsening below.
    let mut rng = StdRng::seed_from_u64(rank as u64);
    let weights: Vec<u64> = (0..tree.num_octants())
        .map(|_| rng.gen_range(1..8))
        .collect();
    tree.load_balance_weighted(&weights).unwrap();

    // Coarsen everything, tracking sources through the mapper.
    let before = tree.num_octants();
    let pre: Vec<(u64, u8)> = (0..before)
        .map(|i| {
            let oct = tree.octant(i).unwrap();
            (oct.morton(), oct.level())
        })
        .collect();
    for i in 0..before {
        tree.set_marker(i, -1).unwrap();
    }
    let mut mapper = Vec::new();
    let changed = tree.adapt_mapped(&mut mapper).unwrap();
    assert!(changed);
    assert_eq!(tree.num_global_octants(), 16);
    assert_eq!(mapper.len(), tree.num_octants());

    // Every mapper entry is a true pre-adapt local index: a coarsened
    // father points at its first child (same anchor, one level finer),
    // anything else at its own old slot.
    for i in 0..tree.num_octants() {
        let oct = tree.octant(i).unwrap();
        let src = mapper[i] as usize;
        assert!(src < before);
        if oct.is_new_coarsened() {
            assert_eq!(pre[src], (oct.morton(), oct.level() + 1));
        } else {
            assert_eq!(pre[src], (oct.morton(), oct.level()));
        }
    }

    // Markers are spent; adapting again changes nothing.
    assert!(!tree.adapt().unwrap());

    println!("rank {}: {} octants after coarsening", rank, tree.num_octants());
}
