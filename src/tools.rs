//! Rank-collective helper routines.

use mpi::datatype::{Partition, PartitionMut};
use mpi::point_to_point as p2p;
use mpi::traits::{CommunicatorCollectives, Destination, Equivalence, Source};

/// Compute displacements from a vector of counts. For counts `[3, 4, 5]`
/// the displacements are `[0, 3, 7]`.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut acc = 0;
    for &c in counts {
        displs.push(acc);
        acc += c;
    }
    displs
}

/// Gather a distributed array to all ranks, concatenated in rank order.
pub fn gather_to_all<T, C>(arr: &[T], comm: &C) -> Vec<T>
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    let size = comm.size() as usize;

    let local_len = arr.len() as i32;
    let mut counts = vec![0i32; size];
    comm.all_gather_into(&local_len, &mut counts[..]);

    let total = counts.iter().sum::<i32>() as usize;
    let displs = displacements(&counts);
    let mut recv = vec![T::default(); total];
    {
        let mut partition = PartitionMut::new(&mut recv[..], counts, &displs[..]);
        comm.all_gather_varcount_into(arr, &mut partition);
    }
    recv
}

/// Exchange elements between all ranks. `counts[r]` elements of `arr`, in
/// order, go to rank `r`; the result concatenates what every rank sent to
/// us, in rank order. Returns the received elements together with the
/// per-source counts.
pub fn redistribute_with_counts<T, C>(arr: &[T], counts: &[i32], comm: &C) -> (Vec<T>, Vec<i32>)
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    let size = comm.size() as usize;
    debug_assert_eq!(counts.len(), size);
    debug_assert_eq!(counts.iter().sum::<i32>() as usize, arr.len());

    // First communicate how many elements everybody gets from each rank,
    // then send the actual elements with an alltoallv.

    let mut recv_counts = vec![0i32; size];
    comm.all_to_all_into(counts, &mut recv_counts[..]);

    let send_displs = displacements(counts);
    let send_partition = Partition::new(arr, counts.to_vec(), &send_displs[..]);

    let total = recv_counts.iter().sum::<i32>() as usize;
    let mut recv = vec![T::default(); total];
    let recv_displs = displacements(&recv_counts);
    {
        let mut recv_partition =
            PartitionMut::new(&mut recv[..], recv_counts.clone(), &recv_displs[..]);
        comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);
    }
    (recv, recv_counts)
}

/// [`redistribute_with_counts`] without the count bookkeeping.
pub fn redistribute<T, C>(arr: &[T], counts: &[i32], comm: &C) -> Vec<T>
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    redistribute_with_counts(arr, counts, comm).0
}

/// Send a value to the next rank; receive the previous rank's value.
/// Returns `None` on rank zero.
pub fn exchange_up<T, C>(value: &T, comm: &C) -> Option<T>
where
    T: Equivalence,
    C: CommunicatorCollectives,
{
    let rank = comm.rank();
    let size = comm.size();
    if size == 1 {
        return None;
    }
    if rank == 0 {
        comm.process_at_rank(1).send(value);
        None
    } else if rank == size - 1 {
        let (received, _status) = comm.process_at_rank(rank - 1).receive::<T>();
        Some(received)
    } else {
        let (received, _status) = p2p::send_receive(
            value,
            &comm.process_at_rank(rank + 1),
            &comm.process_at_rank(rank - 1),
        );
        Some(received)
    }
}

/// Send a value to the previous rank; receive the next rank's value.
/// Returns `None` on the last rank.
pub fn exchange_down<T, C>(value: &T, comm: &C) -> Option<T>
where
    T: Equivalence,
    C: CommunicatorCollectives,
{
    let rank = comm.rank();
    let size = comm.size();
    if size == 1 {
        return None;
    }
    if rank == 0 {
        let (received, _status) = comm.process_at_rank(1).receive::<T>();
        Some(received)
    } else if rank == size - 1 {
        comm.process_at_rank(rank - 1).send(value);
        None
    } else {
        let (received, _status) = p2p::send_receive(
            value,
            &comm.process_at_rank(rank - 1),
            &comm.process_at_rank(rank + 1),
        );
        Some(received)
    }
}

/// Inclusive prefix sum of local weights, made global across ranks: entry
/// `i` becomes the sum of all weights on lower ranks plus the local weights
/// up to and including `i`.
pub fn global_inclusive_cumsum<C>(weights: &[u64], comm: &C) -> Vec<u64>
where
    C: CommunicatorCollectives,
{
    use mpi::collective::SystemOperation;

    let mut scan = Vec::with_capacity(weights.len());
    let mut acc = 0u64;
    for &w in weights {
        acc += w;
        scan.push(acc);
    }

    if comm.size() == 1 {
        return scan;
    }

    // Scan the per-rank totals, then shift every local entry by the sum of
    // the previous ranks.
    let local_total = acc;
    let mut offset = 0u64;
    comm.exclusive_scan_into(&local_total, &mut offset, SystemOperation::sum());
    if comm.rank() > 0 {
        for s in &mut scan {
            *s += offset;
        }
    }
    scan
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn displacements_from_counts() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[]), Vec::<i32>::new());
    }
}
