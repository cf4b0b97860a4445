//! Typed failure conditions raised by the storage core.
//!
//! Everything returns `eyre::Result`; the variants here are the conditions a
//! caller may want to react to programmatically. They are raised with
//! `bail!(CoreError::...)` and recovered with [`CoreError::of`].

use crate::storage::RowId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Growing a region failed.
    OutOfMemory { object: &'static str, requested: usize },
    /// An arena reached its configured capacity ceiling, or a value is larger
    /// than any var-data class.
    OutOfSpace { object: &'static str, limit: u64 },
    /// A unique index already holds a visible row with an equal key.
    DuplicateKey { index: String, existing: RowId },
    /// The backup WAL segment has not been drained yet.
    WalBusy,
    /// Persistent bytes failed validation.
    Corruption { what: String },
}

impl CoreError {
    /// Finds a `CoreError` anywhere in a report's chain.
    pub fn of(report: &eyre::Report) -> Option<&CoreError> {
        report.chain().find_map(|e| e.downcast_ref::<CoreError>())
    }

    pub fn is_duplicate_key(report: &eyre::Report) -> bool {
        matches!(Self::of(report), Some(CoreError::DuplicateKey { .. }))
    }

    pub fn is_out_of_memory(report: &eyre::Report) -> bool {
        matches!(Self::of(report), Some(CoreError::OutOfMemory { .. }))
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::OutOfMemory { object, requested } => {
                write!(f, "out of memory growing {} to {} bytes", object, requested)
            }
            CoreError::OutOfSpace { object, limit } => {
                write!(f, "{} is full (limit {})", object, limit)
            }
            CoreError::DuplicateKey { index, existing } => {
                write!(f, "duplicate key in unique index '{}' (row {})", index, existing)
            }
            CoreError::WalBusy => write!(f, "backup WAL segment is still being drained"),
            CoreError::Corruption { what } => write!(f, "corruption: {}", what),
        }
    }
}

impl std::error::Error for CoreError {}
