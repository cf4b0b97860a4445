//! Row lifecycle state kept in the low two bits of a row's control byte.
//!
//! ```text
//! Free ──allocate──> Dirty ──┬──> Committed ──────┬──> Free
//!                            └──> InTransaction ──┤
//!                                   │ commit      │ rollback / delete
//!                                   └──> Committed
//! ```
//!
//! The upper six bits of the control byte are preserved across state changes.

pub const STATE_MASK: u8 = 0x03;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RowState {
    #[default]
    Free = 0b00,
    /// Allocated, payload being written, not linked into any transaction yet.
    Dirty = 0b01,
    Committed = 0b10,
    /// Inserted by an open transaction; visible only to it.
    InTransaction = 0b11,
}

impl RowState {
    #[inline]
    pub fn from_control(control: u8) -> Self {
        match control & STATE_MASK {
            0b00 => RowState::Free,
            0b01 => RowState::Dirty,
            0b10 => RowState::Committed,
            _ => RowState::InTransaction,
        }
    }

    /// Replaces the state bits of `control`, keeping the rest.
    #[inline]
    pub fn apply(self, control: u8) -> u8 {
        (control & !STATE_MASK) | self as u8
    }

    /// Committed or InTransaction: the row holds a complete payload.
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, RowState::Committed | RowState::InTransaction)
    }
}
