//! # Transactions
//!
//! - [`visibility`]: which rows a reader may see
//! - [`bitmap`]: sparse per-table insert and delete sets
//! - [`lock`]: table locks held for a transaction's lifetime
//! - [`connection`]: the consumer API and commit/rollback

pub mod bitmap;
pub mod connection;
pub mod lock;
pub mod visibility;

pub use bitmap::RowBitmap;
pub use connection::{CommitOutcome, Connection, ConnectionId, Scan, TableReader};
pub use lock::{LockLevel, TableLock};
pub use visibility::{CommittedView, Hiding, TxnView, Visibility};
