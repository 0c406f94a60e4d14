//! Repeated marked refinement inside a disc, with 2:1 balance switched off
//! over the right half of the domain, and VTU output per iteration.

use mpi::traits::Communicator;
use octamr::{Dim, ParaTree};

fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;

    let mut tree = ParaTree::new(Dim::Two, world);
    tree.adapt_global_refine().unwrap();
    tree.adapt_global_refine().unwrap();
    tree.load_balance().unwrap();

    tree.set_balance_codim(1);

    let (xc, yc) = (0.5, 0.5);
    let radius = 0.4;

    for iter in 0..5 {
        // Octants in the right half of the domain do not enforce 2:1.
        for i in 0..tree.num_octants() {
            let c = tree.center(i).unwrap();
            if c[0] > xc {
                tree.set_balance(i, false).unwrap();
            }
        }

        // Mark the lower part of the disc for refinement.
        for i in 0..tree.num_octants() {
            let c = tree.center(i).unwrap();
            let inside = (c[0] - xc).powi(2) + (c[1] - yc).powi(2) < radius * radius;
            if inside && c[1] < yc {
                tree.set_marker(i, 1).unwrap();
            }
        }

        tree.adapt().unwrap();
        tree.load_balance().unwrap();

        let distance: Vec<f64> = (0..tree.num_octants())
            .map(|i| {
                let c = tree.center(i).unwrap();
                ((c[0] - xc).powi(2) + (c[1] - yc).powi(2)).sqrt()
            })
            .collect();
        tree.update_connectivity();
        tree.write_vtu_scalar(&format!("circle_iter{iter}"), &distance)
            .unwrap();
    }

    // The balanced (left) half obeys 2:1 across faces.
    for i in 0..tree.num_octants() {
        let oct = tree.octant(i).unwrap();
        if !oct.is_balanced() {
            continue;
        }
        for face in 0..4 {
            let (neighbours, is_ghost) = tree.find_neighbours(i, face, 1);
            for (&j, &ghost) in neighbours.iter().zip(&is_ghost) {
                let other = if ghost {
                    tree.ghost_octant(j as usize).unwrap()
                } else {
                    tree.octant(j as usize).unwrap()
                };
                if other.is_balanced() {
                    assert!((other.level() as i16 - oct.level() as i16).abs() <= 1);
                }
            }
        }
    }

    println!(
        "rank {}: {} octants, depth {}",
        rank,
        tree.num_octants(),
        tree.global_max_depth()
    );
}
