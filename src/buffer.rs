//! Typed communication buffer for rank-to-rank payload messages.

use bytemuck::Pod;

use crate::error::TreeError;

/// An opaque packed byte stream.
///
/// Payload adapters write scalars and fixed-layout aggregates with
/// [`CommBuffer::write`] on the sending rank and read them back with
/// [`CommBuffer::read`] on the receiving rank. Values are packed as raw
/// native-endian bytes; the contract is that a `write` followed by a `read`
/// of the same type is a pure round trip between peers of one MPI job.
#[derive(Clone, Default, Debug)]
pub struct CommBuffer {
    bytes: Vec<u8>,
    pos: usize,
}

impl CommBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Wrap received bytes for reading.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Append a value to the stream.
    pub fn write<T: Pod>(&mut self, value: &T) {
        self.bytes.extend_from_slice(bytemuck::bytes_of(value));
    }

    /// Read the next value from the stream.
    pub fn read<T: Pod>(&mut self) -> Result<T, TreeError> {
        let n = std::mem::size_of::<T>();
        let remaining = self.bytes.len() - self.pos;
        if n > remaining {
            return Err(TreeError::BufferUnderrun {
                requested: n,
                remaining,
            });
        }
        let value = bytemuck::pod_read_unaligned(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        Ok(value)
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The packed bytes, for handing to the transport.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop all content and reset the read cursor.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let mut buf = CommBuffer::new();
        buf.write(&42u32);
        buf.write(&-1.5f64);
        buf.write(&[1u8, 2, 3]);

        let mut rx = CommBuffer::from_bytes(buf.as_bytes().to_vec());
        assert_eq!(rx.read::<u32>().unwrap(), 42);
        assert_eq!(rx.read::<f64>().unwrap(), -1.5);
        assert_eq!(rx.read::<[u8; 3]>().unwrap(), [1, 2, 3]);
    }

    #[test]
    fn underrun_is_reported() {
        let mut buf = CommBuffer::from_bytes(vec![0u8; 3]);
        assert!(matches!(
            buf.read::<u64>(),
            Err(TreeError::BufferUnderrun {
                requested: 8,
                remaining: 3
            })
        ));
    }
}
