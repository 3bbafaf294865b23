/// Key-Value Store contract.
///
/// Byte-ordered keys, atomic batched writes, forward/reverse prefix
/// iteration, point get/put/delete. No built-in compression is assumed;
/// values are opaque byte strings.
pub mod rocks;

use crate::error::StoreError;

/// A single pending mutation in a [`Batch`].
pub(crate) enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An accumulator of pending writes committed atomically by [`Store::write`].
#[derive(Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(Op::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(Op::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// An ordered, byte-keyed embedded store, committed to atomically.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut batch = Batch::new();
        batch.put(key.to_vec(), value.to_vec());
        self.write(batch)
    }

    /// Keys and values with the given prefix, in ascending key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Keys and values with the given prefix, in descending key order.
    fn iter_prefix_rev(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Commit every operation in `batch` as a single atomic write.
    fn write(&self, batch: Batch) -> Result<(), StoreError>;
}
