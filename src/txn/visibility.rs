//! Row visibility rules.
//!
//! | state         | visible to                                          |
//! |---------------|-----------------------------------------------------|
//! | Free, Dirty   | nobody                                              |
//! | Committed     | everyone, except a connection that deleted it       |
//! | InTransaction | only the connection whose insert bitmap holds it    |
//!
//! Evaluated on every index traversal and table scan.

use super::bitmap::RowBitmap;
use crate::storage::{Arena, RowId, RowState};

pub trait Visibility {
    fn is_visible(&self, rows: &Arena, id: RowId) -> bool;
}

/// Sees committed rows only. Used outside any transaction and by recovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommittedView;

impl Visibility for CommittedView {
    #[inline]
    fn is_visible(&self, rows: &Arena, id: RowId) -> bool {
        rows.row_state(id) == RowState::Committed
    }
}

/// A connection's view of one table inside its open transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnView<'a> {
    inserted: Option<&'a RowBitmap>,
    deleted: Option<&'a RowBitmap>,
}

impl<'a> TxnView<'a> {
    pub fn new(inserted: &'a RowBitmap, deleted: &'a RowBitmap) -> Self {
        Self {
            inserted: Some(inserted),
            deleted: Some(deleted),
        }
    }

    /// The view of a connection that has not touched the table.
    pub fn untouched() -> Self {
        Self::default()
    }
}

impl Visibility for TxnView<'_> {
    #[inline]
    fn is_visible(&self, rows: &Arena, id: RowId) -> bool {
        match rows.row_state(id) {
            RowState::Committed => !self.deleted.is_some_and(|d| d.contains(id)),
            RowState::InTransaction => self.inserted.is_some_and(|i| i.contains(id)),
            RowState::Free | RowState::Dirty => false,
        }
    }
}

/// A view with one row hidden. An update vets and links its replacement
/// while the row being replaced is still indexed.
pub struct Hiding<'a> {
    inner: &'a dyn Visibility,
    hidden: RowId,
}

impl<'a> Hiding<'a> {
    pub fn new(inner: &'a dyn Visibility, hidden: RowId) -> Self {
        Self { inner, hidden }
    }
}

impl Visibility for Hiding<'_> {
    #[inline]
    fn is_visible(&self, rows: &Arena, id: RowId) -> bool {
        id != self.hidden && self.inner.is_visible(rows, id)
    }
}
