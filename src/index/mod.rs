//! # Hash Indexes
//!
//! - [`key`]: key columns, hashing and key equality
//! - [`hash`]: the chained hash index with sibling lists for duplicate keys

pub mod hash;
pub mod key;

pub use hash::{HashIndex, HashMatches, HashNode};
pub use key::{write_text, Key, KeyField, KeyKind, KeySpec};
