//! Capability traits for user payloads.
//!
//! The tree never interprets payload bytes. Hosts that carry per-octant
//! data supply a [`GhostData`] adapter to mirror it onto ghosts and a
//! [`MigrateData`] adapter to move it through load balancing and to
//! interpolate it through adaptation.

use std::ops::Range;

use bytemuck::Pod;

use crate::buffer::CommBuffer;
use crate::error::TreeError;

/// Payload exchange on ghost octants.
///
/// `gather` is called for local border octants in the order the peer's
/// ghosts expect them; `scatter` is called for each ghost in ghost order.
pub trait GhostData {
    /// Packed size in bytes of the payload of local octant `i`.
    fn size(&self, i: usize) -> usize;

    /// Pack the payload of local octant `i`.
    fn gather(&self, buf: &mut CommBuffer, i: usize);

    /// Unpack one payload into the shadow slot of ghost `g`.
    fn scatter(&mut self, buf: &mut CommBuffer, g: usize) -> Result<(), TreeError>;
}

/// Payload migration through load balance and interpolation through adapt.
pub trait MigrateData {
    /// Packed size in bytes of the payloads of the local index range.
    fn size_range(&self, range: Range<usize>) -> usize;

    /// Pack the payloads of the local index range, in order.
    fn gather_range(&self, buf: &mut CommBuffer, range: Range<usize>);

    /// Unpack `count` payloads, appending to local storage.
    fn scatter_range(&mut self, buf: &mut CommBuffer, count: usize) -> Result<(), TreeError>;

    /// Drop all local payloads ahead of scattering a migrated set.
    fn clear(&mut self);

    /// Drop the first `count` payloads after their octants were shipped to
    /// the previous rank by cross-border coarsening.
    fn drop_front(&mut self, count: usize);

    /// Begin rebuilding payloads for an adapted tree of `new_len` octants.
    fn begin_adapt(&mut self, new_len: usize);

    /// Copy the payload of pre-adapt octant `src` to post-adapt slot `dst`.
    fn assign(&mut self, dst: usize, src: usize);

    /// In-place variant of [`MigrateData::assign`] for hosts that shift
    /// payloads instead of rebuilding them.
    fn relocate(&mut self, dst: usize, src: usize) {
        self.assign(dst, src);
    }

    /// Fill the post-adapt slots of a refined family from their father's
    /// pre-adapt payload.
    fn refine_into(&mut self, children: Range<usize>, father: usize);

    /// Fill the post-adapt slot of a coarsened father from its children's
    /// pre-adapt payloads.
    fn coarsen_into(&mut self, father: usize, children: Range<usize>);

    /// Finish an adapt rebuild, replacing the pre-adapt payloads.
    fn end_adapt(&mut self);
}

/// [`GhostData`] over a `Vec` of `Pod` values, one per octant.
pub struct VecGhostData<'a, T: Pod> {
    /// Payload of the local octants.
    pub data: &'a [T],
    /// Shadow payload of the ghosts, sized to the ghost count by the host.
    pub ghost_data: &'a mut [T],
}

impl<T: Pod> GhostData for VecGhostData<'_, T> {
    fn size(&self, _i: usize) -> usize {
        std::mem::size_of::<T>()
    }

    fn gather(&self, buf: &mut CommBuffer, i: usize) {
        buf.write(&self.data[i]);
    }

    fn scatter(&mut self, buf: &mut CommBuffer, g: usize) -> Result<(), TreeError> {
        self.ghost_data[g] = buf.read()?;
        Ok(())
    }
}

/// [`MigrateData`] over a `Vec` of `Pod` values.
///
/// Refinement copies the father's value into every child; coarsening merges
/// the children's values through the host-supplied closure (an average for
/// cell-centered fields).
pub struct VecMigrateData<'a, T: Pod, F: Fn(&[T]) -> T> {
    /// Payload of the local octants.
    pub data: &'a mut Vec<T>,
    merge: F,
    scratch: Vec<T>,
}

impl<'a, T: Pod, F: Fn(&[T]) -> T> VecMigrateData<'a, T, F> {
    /// Wrap a payload vector with a merge rule for coarsening.
    pub fn new(data: &'a mut Vec<T>, merge: F) -> Self {
        Self {
            data,
            merge,
            scratch: Vec::new(),
        }
    }
}

impl<T: Pod, F: Fn(&[T]) -> T> MigrateData for VecMigrateData<'_, T, F> {
    fn size_range(&self, range: Range<usize>) -> usize {
        range.len() * std::mem::size_of::<T>()
    }

    fn gather_range(&self, buf: &mut CommBuffer, range: Range<usize>) {
        for i in range {
            buf.write(&self.data[i]);
        }
    }

    fn scatter_range(&mut self, buf: &mut CommBuffer, count: usize) -> Result<(), TreeError> {
        for _ in 0..count {
            let value = buf.read()?;
            self.data.push(value);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn drop_front(&mut self, count: usize) {
        self.data.drain(..count);
    }

    fn begin_adapt(&mut self, new_len: usize) {
        self.scratch.clear();
        self.scratch.resize(new_len, T::zeroed());
    }

    fn assign(&mut self, dst: usize, src: usize) {
        self.scratch[dst] = self.data[src];
    }

    fn refine_into(&mut self, children: Range<usize>, father: usize) {
        for dst in children {
            self.scratch[dst] = self.data[father];
        }
    }

    fn coarsen_into(&mut self, father: usize, children: Range<usize>) {
        self.scratch[father] = (self.merge)(&self.data[children]);
    }

    fn end_adapt(&mut self) {
        std::mem::swap(self.data, &mut self.scratch);
        self.scratch.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vec_ghost_data_round_trip() {
        let data = vec![1.0f64, 2.0, 3.0];
        let mut ghost_data = vec![0.0f64; 2];
        let mut adapter = VecGhostData {
            data: &data,
            ghost_data: &mut ghost_data,
        };

        let mut buf = CommBuffer::new();
        adapter.gather(&mut buf, 2);
        adapter.gather(&mut buf, 0);

        let mut rx = CommBuffer::from_bytes(buf.as_bytes().to_vec());
        adapter.scatter(&mut rx, 0).unwrap();
        adapter.scatter(&mut rx, 1).unwrap();
        assert_eq!(ghost_data, vec![3.0, 1.0]);
    }

    #[test]
    fn vec_migrate_data_adapt_hooks() {
        let mut data = vec![10.0f64, 20.0, 30.0];
        let mut adapter = VecMigrateData::new(&mut data, |children: &[f64]| {
            children.iter().sum::<f64>() / children.len() as f64
        });

        // Octant 1 refines into four children, octant 0 and 2 carry over
        // around them.
        adapter.begin_adapt(6);
        adapter.assign(0, 0);
        adapter.refine_into(1..5, 1);
        adapter.assign(5, 2);
        adapter.end_adapt();
        assert_eq!(*adapter.data, vec![10.0, 20.0, 20.0, 20.0, 20.0, 30.0]);

        // The four children coarsen back.
        adapter.begin_adapt(3);
        adapter.assign(0, 0);
        adapter.coarsen_into(1, 1..5);
        adapter.assign(2, 5);
        adapter.end_adapt();
        assert_eq!(*adapter.data, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn vec_migrate_data_range_round_trip() {
        let mut data = vec![1u32, 2, 3, 4];
        let mut adapter = VecMigrateData::new(&mut data, |c: &[u32]| c[0]);

        let mut buf = CommBuffer::new();
        assert_eq!(adapter.size_range(1..3), 8);
        adapter.gather_range(&mut buf, 1..3);

        adapter.clear();
        let mut rx = CommBuffer::from_bytes(buf.as_bytes().to_vec());
        adapter.scatter_range(&mut rx, 2).unwrap();
        assert_eq!(*adapter.data, vec![2, 3]);
    }
}
