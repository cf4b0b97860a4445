//! Sparse row-id set for per-transaction bookkeeping.
//!
//! A thin wrapper over `RoaringBitmap`: a transaction touching a handful of
//! rows costs a handful of containers regardless of table size, and
//! iteration yields ids in ascending order.

use roaring::RoaringBitmap;

use crate::storage::RowId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBitmap {
    ids: RoaringBitmap,
}

impl RowBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `id` was not already present.
    pub fn insert(&mut self, id: RowId) -> bool {
        self.ids.insert(id)
    }

    /// Returns true if `id` was present.
    pub fn remove(&mut self, id: RowId) -> bool {
        self.ids.remove(id)
    }

    #[inline]
    pub fn contains(&self, id: RowId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = RowId> + '_ {
        self.ids.iter()
    }
}
