//! # Chained Hash Index
//!
//! Maps a row's key to the set of row ids with that key. Built on two arenas:
//!
//! - a **node arena** addressed by the table's row ids, one 16-byte node per
//!   row: `next`, `prev`, `sibling`, `hash`
//! - a **bucket arena** of 4-byte heads, bucket `b` stored at arena id `b + 1`
//!
//! ## Chains and Siblings
//!
//! Rows whose keys land in the same bucket form the primary chain. Rows
//! sharing an *identical* key hang off the first node with that key as a
//! sibling list, so the primary chain has one node per distinct key.
//!
//! ```text
//! bucket[b] ──> T1 ──next──> T2 ──next──> 0
//!               │ sibling
//!               v
//!               S1 ──next──> S2 ──next──> 0
//! ```
//!
//! Link encoding (bit 31 = `MSB`):
//!
//! | node            | prev                         | sibling             |
//! |-----------------|------------------------------|---------------------|
//! | chain head      | `MSB \| bucket`              | first sibling or 0  |
//! | other top node  | previous top node            | first sibling or 0  |
//! | first sibling   | 0                            | owning top node     |
//! | later sibling   | previous sibling             | `MSB`               |
//! | not indexed     | 0                            | 0 (and next = 0)    |
//!
//! A top node always has a non-zero `prev`, a first sibling a non-zero
//! `sibling`, and a later sibling has `sibling == MSB`. A node with all three
//! links zero is not in the index.
//!
//! ## Growth
//!
//! Before each insert, if more than half the buckets are occupied, the bucket
//! table doubles and every chain is redistributed in one pass. Doubling means
//! a node either stays in bucket `b` or moves to `b + old_capacity`; moved top
//! nodes carry their sibling lists with them untouched.
//!
//! ## Concurrency
//!
//! Mutation takes `&mut self`; lookups take `&self` and never write links.
//! The table's storage lock provides the single-writer, multi-reader split.

use eyre::{bail, Result};
use tracing::debug;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::key::{Key, KeySpec};
use crate::config::{
    DEFAULT_ARENA_CAPACITY, HASH_BUCKET_SIZE, HASH_HEADER_SIZE, HASH_NODE_SIZE, ROWID_MASK,
    ROWID_MSB,
};
use crate::error::CoreError;
use crate::storage::headers::flags;
use crate::storage::{Arena, ArenaConfig, ArenaKind, Backing, RowId, NULL_ROW};
use crate::txn::Visibility;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HashNode {
    next: U32,
    prev: U32,
    sibling: U32,
    hash: U32,
}

const _: () = assert!(std::mem::size_of::<HashNode>() == HASH_NODE_SIZE);

impl HashNode {
    le_fields! {
        next: U32 => u32,
        prev: U32 => u32,
        sibling: U32 => u32,
        hash: U32 => u32,
    }

    pub fn is_linked(&self) -> bool {
        (self.next() | self.prev() | self.sibling()) != 0
    }

    /// Bucket index if this node is a chain head.
    fn owning_bucket(&self) -> Option<u32> {
        let prev = self.prev();
        (prev & ROWID_MSB != 0).then_some(prev & ROWID_MASK)
    }

    pub fn is_top(&self) -> bool {
        self.prev() != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HashHeader {
    row_count: U32,
    key_count: U32,
    occupied_buckets: U32,
    rehash_count: U32,
    reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<HashHeader>() == HASH_HEADER_SIZE);

impl HashHeader {
    le_fields! {
        row_count: U32 => u32,
        key_count: U32 => u32,
        occupied_buckets: U32 => u32,
        rehash_count: U32 => u32,
    }
}

#[derive(Debug)]
pub struct HashIndex {
    name: String,
    unique: bool,
    key: KeySpec,
    nodes: Arena,
    buckets: Arena,
}

impl HashIndex {
    /// Creates an empty index. `row_capacity` sizes the node arena to the
    /// table it indexes; it grows on demand afterwards.
    pub fn new(name: &str, key: KeySpec, unique: bool, row_capacity: u32) -> Result<Self> {
        let nodes = Arena::open(
            Backing::Memory,
            &ArenaConfig::new(
                ArenaKind::HashNodes,
                HASH_NODE_SIZE as u32,
                row_capacity.max(DEFAULT_ARENA_CAPACITY),
            )
            .with_extension(HASH_HEADER_SIZE as u16)
            .with_flags(flags::NO_ALLOC | flags::ZERO_ON_GROW),
        )?;
        let buckets = Arena::open(
            Backing::Memory,
            &ArenaConfig::new(
                ArenaKind::HashBuckets,
                HASH_BUCKET_SIZE as u32,
                DEFAULT_ARENA_CAPACITY,
            )
            .with_flags(flags::NO_ALLOC | flags::ZERO_ON_GROW),
        )?;
        Ok(Self {
            name: name.to_string(),
            unique,
            key,
            nodes,
            buckets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn key_spec(&self) -> &KeySpec {
        &self.key
    }

    fn header(&self) -> &HashHeader {
        match HashHeader::ref_from_bytes(self.nodes.extension()) {
            Ok(h) => h,
            Err(_) => unreachable!("hash node arena extension is sized for HashHeader"),
        }
    }

    fn header_mut(&mut self) -> &mut HashHeader {
        match HashHeader::mut_from_bytes(self.nodes.extension_mut()) {
            Ok(h) => h,
            Err(_) => unreachable!("hash node arena extension is sized for HashHeader"),
        }
    }

    /// Rows currently indexed.
    pub fn len(&self) -> u32 {
        self.header().row_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct keys currently indexed (top-level chain nodes).
    pub fn key_count(&self) -> u32 {
        self.header().key_count()
    }

    pub fn bucket_capacity(&self) -> u32 {
        self.buckets.capacity()
    }

    pub fn occupied_buckets(&self) -> u32 {
        self.header().occupied_buckets()
    }

    pub fn rehash_count(&self) -> u32 {
        self.header().rehash_count()
    }

    #[inline]
    pub fn node(&self, id: RowId) -> HashNode {
        if id > self.nodes.capacity() {
            return HashNode::default();
        }
        match HashNode::read_from_bytes(self.nodes.slot(id)) {
            Ok(n) => n,
            Err(_) => unreachable!("hash node slots are HASH_NODE_SIZE bytes"),
        }
    }

    #[inline]
    fn node_mut(&mut self, id: RowId) -> &mut HashNode {
        match HashNode::mut_from_bytes(self.nodes.slot_mut(id)) {
            Ok(n) => n,
            Err(_) => unreachable!("hash node slots are HASH_NODE_SIZE bytes"),
        }
    }

    #[inline]
    fn bucket(&self, b: u32) -> RowId {
        let slot = self.buckets.slot(b + 1);
        u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]])
    }

    #[inline]
    fn set_bucket(&mut self, b: u32, id: RowId) {
        self.buckets.slot_mut(b + 1).copy_from_slice(&id.to_le_bytes());
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> u32 {
        hash & (self.buckets.capacity() - 1)
    }

    pub fn contains(&self, id: RowId) -> bool {
        self.node(id).is_linked()
    }

    /// Links row `id` into the index. `rows` must already hold its payload.
    ///
    /// For a unique index, `uniqueness` names the view the check runs in;
    /// `None` skips the check (recovery replays rows that were unique when
    /// they committed).
    pub fn add(&mut self, id: RowId, rows: &Arena, uniqueness: Option<&dyn Visibility>) -> Result<()> {
        self.nodes.ensure_capacity(id)?;
        if self.occupied_buckets() > self.bucket_capacity() / 2 {
            self.rehash()?;
        }

        let row = rows.slot(id);
        let key = self.key.extract(row);
        let hash = self.key.hash(&key);
        let b = self.bucket_of(hash);
        let head = self.bucket(b);

        let mut top = head;
        while top != NULL_ROW {
            let n = self.node(top);
            if n.hash() == hash && self.key.row_matches(rows.slot(top), &key) {
                break;
            }
            top = n.next();
        }

        if top != NULL_ROW {
            if self.unique {
                if let Some(view) = uniqueness {
                    if let Some(existing) = self.first_visible_in_group(top, rows, view) {
                        bail!(CoreError::DuplicateKey {
                            index: self.name.clone(),
                            existing,
                        });
                    }
                }
            }

            let first = self.node(top).sibling();
            self.node_mut(top).set_sibling(id);
            {
                let n = self.node_mut(id);
                n.set_hash(hash);
                n.set_next(first);
                n.set_prev(0);
                n.set_sibling(top);
            }
            if first != NULL_ROW {
                let f = self.node_mut(first);
                f.set_prev(id);
                f.set_sibling(ROWID_MSB);
            }
        } else {
            {
                let n = self.node_mut(id);
                n.set_hash(hash);
                n.set_next(head);
                n.set_prev(ROWID_MSB | b);
                n.set_sibling(0);
            }
            self.set_bucket(b, id);
            let header = self.header_mut();
            header.set_key_count(header.key_count() + 1);
            if head == NULL_ROW {
                header.set_occupied_buckets(header.occupied_buckets() + 1);
            } else {
                self.node_mut(head).set_prev(id);
            }
        }

        let header = self.header_mut();
        header.set_row_count(header.row_count() + 1);
        Ok(())
    }

    fn first_visible_in_group(&self, top: RowId, rows: &Arena, view: &dyn Visibility) -> Option<RowId> {
        if view.is_visible(rows, top) {
            return Some(top);
        }
        let mut sib = self.node(top).sibling();
        while sib != NULL_ROW {
            if view.is_visible(rows, sib) {
                return Some(sib);
            }
            sib = self.node(sib).next();
        }
        None
    }

    /// Unlinks row `id`. No-op if it is not indexed.
    pub fn remove(&mut self, id: RowId) {
        let cur = self.node(id);
        if !cur.is_linked() {
            return;
        }

        if cur.sibling() & ROWID_MASK == 0 {
            // A top node without siblings, or a later sibling: plain splice.
            if cur.next() != NULL_ROW {
                self.node_mut(cur.next()).set_prev(cur.prev());
            }
            if let Some(b) = cur.owning_bucket() {
                self.set_bucket(b, cur.next());
                if cur.next() == NULL_ROW {
                    let header = self.header_mut();
                    header.set_occupied_buckets(header.occupied_buckets() - 1);
                }
            } else if cur.prev() != 0 {
                self.node_mut(cur.prev()).set_next(cur.next());
            }
            if cur.sibling() & ROWID_MSB == 0 {
                let header = self.header_mut();
                header.set_key_count(header.key_count() - 1);
            }
        } else if cur.prev() == 0 {
            // First sibling: the next sibling takes its place under the top.
            let top = cur.sibling();
            self.node_mut(top).set_sibling(cur.next());
            if cur.next() != NULL_ROW {
                let n = self.node_mut(cur.next());
                n.set_prev(0);
                n.set_sibling(top);
            }
        } else {
            // A top node with siblings: promote the first sibling into the
            // chain, the second sibling becomes the new first.
            let first = cur.sibling();
            let promoted = self.node(first);
            if promoted.next() != NULL_ROW {
                let second = self.node_mut(promoted.next());
                second.set_prev(0);
                second.set_sibling(first);
            }
            {
                let p = self.node_mut(first);
                p.set_sibling(promoted.next());
                p.set_next(cur.next());
                p.set_prev(cur.prev());
            }
            if cur.next() != NULL_ROW {
                self.node_mut(cur.next()).set_prev(first);
            }
            if let Some(b) = cur.owning_bucket() {
                self.set_bucket(b, first);
            } else {
                self.node_mut(cur.prev()).set_next(first);
            }
        }

        *self.node_mut(id) = HashNode::default();
        let header = self.header_mut();
        header.set_row_count(header.row_count() - 1);
    }

    /// Doubles the bucket table and redistributes every chain in one pass.
    fn rehash(&mut self) -> Result<()> {
        let old_capacity = self.bucket_capacity();
        let new_capacity = match old_capacity.checked_mul(2) {
            Some(c) if c <= ROWID_MSB => c,
            _ => return Ok(()),
        };
        self.buckets.truncate(new_capacity)?;
        let mask = new_capacity - 1;

        for b in 0..old_capacity {
            let mut id = self.bucket(b);
            while id != NULL_ROW {
                let cur = self.node(id);
                let next = cur.next();
                let target = cur.hash() & mask;
                if target != b {
                    if next != NULL_ROW {
                        self.node_mut(next).set_prev(cur.prev());
                    }
                    if cur.owning_bucket().is_some() {
                        self.set_bucket(b, next);
                        if next == NULL_ROW {
                            let header = self.header_mut();
                            header.set_occupied_buckets(header.occupied_buckets() - 1);
                        }
                    } else {
                        self.node_mut(cur.prev()).set_next(next);
                    }

                    let head = self.bucket(target);
                    self.set_bucket(target, id);
                    {
                        let n = self.node_mut(id);
                        n.set_next(head);
                        n.set_prev(ROWID_MSB | target);
                    }
                    if head == NULL_ROW {
                        let header = self.header_mut();
                        header.set_occupied_buckets(header.occupied_buckets() + 1);
                    } else {
                        self.node_mut(head).set_prev(id);
                    }
                }
                id = next;
            }
        }

        let header = self.header_mut();
        header.set_rehash_count(header.rehash_count() + 1);
        debug!(
            index = %self.name,
            buckets = new_capacity,
            occupied = self.occupied_buckets(),
            "hash index rehashed"
        );
        Ok(())
    }

    /// Rows whose key equals `key` and that `view` can see.
    pub fn query<'a, V>(&'a self, rows: &'a Arena, key: &[&'a [u8]], view: &'a V) -> HashMatches<'a, V>
    where
        V: Visibility + ?Sized,
    {
        let key: Key<'a> = key.iter().copied().collect();
        let hash = self.key.hash(&key);
        let head = self.bucket(self.bucket_of(hash));
        HashMatches {
            index: self,
            rows,
            view,
            key,
            hash,
            cursor: Cursor::Chain(head),
        }
    }

    /// [`HashIndex::query`] narrowed by row predicates.
    pub fn query_filtered<'a, V>(
        &'a self,
        rows: &'a Arena,
        key: &[&'a [u8]],
        view: &'a V,
        filters: &'a [&'a dyn Fn(&[u8]) -> bool],
    ) -> impl Iterator<Item = RowId> + 'a
    where
        V: Visibility + ?Sized + 'a,
    {
        self.query(rows, key, view)
            .filter(move |&id| filters.iter().all(|f| f(rows.slot(id))))
    }

    pub fn query_unique<V>(&self, rows: &Arena, key: &[&[u8]], view: &V) -> Option<RowId>
    where
        V: Visibility + ?Sized,
    {
        self.query(rows, key, view).next()
    }

    /// First visible row other than `exclude` whose key equals the key stored
    /// in `row`. Used to vet an update before any row is touched.
    pub fn find_conflict<V>(&self, rows: &Arena, row: &[u8], view: &V, exclude: RowId) -> Option<RowId>
    where
        V: Visibility + ?Sized,
    {
        let key = self.key.extract(row);
        self.query(rows, &key, view).find(|&id| id != exclude)
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    /// Next primary-chain node to compare.
    Chain(RowId),
    /// Next sibling of the matched key group.
    Siblings(RowId),
    Done,
}

/// Iterator over the visible rows of one key, produced by [`HashIndex::query`].
pub struct HashMatches<'a, V: ?Sized> {
    index: &'a HashIndex,
    rows: &'a Arena,
    view: &'a V,
    key: Key<'a>,
    hash: u32,
    cursor: Cursor,
}

impl<'a, V: Visibility + ?Sized> Iterator for HashMatches<'a, V> {
    type Item = RowId;

    fn next(&mut self) -> Option<RowId> {
        loop {
            match self.cursor {
                Cursor::Done => return None,
                Cursor::Chain(NULL_ROW) => {
                    self.cursor = Cursor::Done;
                }
                Cursor::Chain(id) => {
                    let n = self.index.node(id);
                    if n.hash() != self.hash
                        || !self.index.key.row_matches(self.rows.slot(id), &self.key)
                    {
                        self.cursor = Cursor::Chain(n.next());
                        continue;
                    }
                    // Equal keys never appear twice on a chain.
                    self.cursor = Cursor::Siblings(n.sibling() & ROWID_MASK);
                    if self.view.is_visible(self.rows, id) {
                        return Some(id);
                    }
                }
                Cursor::Siblings(NULL_ROW) => {
                    self.cursor = Cursor::Done;
                }
                Cursor::Siblings(id) => {
                    self.cursor = Cursor::Siblings(self.index.node(id).next());
                    if self.view.is_visible(self.rows, id) {
                        return Some(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key::KeyField;
    use crate::storage::RowState;
    use crate::txn::CommittedView;

    struct Fixture {
        rows: Arena,
        index: HashIndex,
    }

    impl Fixture {
        fn new(unique: bool) -> Self {
            let rows = Arena::open(
                Backing::Memory,
                &ArenaConfig::new(ArenaKind::Rows, 12, 8).with_control_offset(8),
            )
            .unwrap();
            let key = KeySpec::new([KeyField::binary(0, 4)]).unwrap();
            Self {
                rows,
                index: HashIndex::new("k", key, unique, 8).unwrap(),
            }
        }

        fn insert(&mut self, k: u32) -> Result<RowId> {
            let id = self.rows.allocate()?;
            self.rows.slot_mut(id)[..4].copy_from_slice(&k.to_le_bytes());
            self.rows.set_row_state(id, RowState::Committed);
            if let Err(e) = self.index.add(id, &self.rows, Some(&CommittedView)) {
                self.rows.free(id);
                return Err(e);
            }
            Ok(id)
        }

        fn delete(&mut self, id: RowId) {
            self.index.remove(id);
            self.rows.free(id);
        }

        fn lookup(&self, k: u32) -> Vec<RowId> {
            let bytes = k.to_le_bytes();
            let mut ids: Vec<_> = self
                .index
                .query(&self.rows, &[&bytes[..]], &CommittedView)
                .collect();
            ids.sort_unstable();
            ids
        }
    }

    #[test]
    fn empty_index_finds_nothing() {
        let f = Fixture::new(false);
        assert!(f.lookup(1).is_empty());
        assert!(f.index.is_empty());
    }

    #[test]
    fn duplicates_form_sibling_list() {
        let mut f = Fixture::new(false);
        let a = f.insert(7).unwrap();
        let b = f.insert(7).unwrap();
        let c = f.insert(7).unwrap();
        let other = f.insert(8).unwrap();

        assert_eq!(f.lookup(7), vec![a, b, c]);
        assert_eq!(f.lookup(8), vec![other]);
        assert_eq!(f.index.len(), 4);
        assert_eq!(f.index.key_count(), 2);

        // Newest duplicate becomes the first sibling.
        assert_eq!(f.index.node(a).sibling(), c);
        assert_eq!(f.index.node(c).sibling(), a);
        assert_eq!(f.index.node(b).sibling(), ROWID_MSB);
        assert_eq!(f.index.node(b).prev(), c);
    }

    #[test]
    fn remove_top_promotes_first_sibling() {
        let mut f = Fixture::new(false);
        let a = f.insert(7).unwrap();
        let b = f.insert(7).unwrap();
        let c = f.insert(7).unwrap();

        f.delete(a);
        assert_eq!(f.lookup(7), vec![b, c]);
        assert!(f.index.node(c).is_top());
        assert_eq!(f.index.key_count(), 1);

        f.delete(c);
        assert_eq!(f.lookup(7), vec![b]);
        f.delete(b);
        assert!(f.lookup(7).is_empty());
        assert_eq!(f.index.key_count(), 0);
        assert_eq!(f.index.occupied_buckets(), 0);
    }

    #[test]
    fn remove_first_and_later_siblings() {
        let mut f = Fixture::new(false);
        let a = f.insert(3).unwrap();
        let b = f.insert(3).unwrap();
        let c = f.insert(3).unwrap();
        let d = f.insert(3).unwrap();

        f.delete(d);
        assert_eq!(f.lookup(3), vec![a, b, c]);
        f.delete(b);
        assert_eq!(f.lookup(3), vec![a, c]);
        f.delete(c);
        assert_eq!(f.lookup(3), vec![a]);
        assert_eq!(f.index.node(a).sibling(), 0);
    }

    #[test]
    fn remove_is_noop_for_unindexed_row() {
        let mut f = Fixture::new(false);
        f.insert(1).unwrap();
        f.index.remove(5);
        f.index.remove(500);
        assert_eq!(f.index.len(), 1);
    }

    #[test]
    fn unique_rejects_visible_duplicate() {
        let mut f = Fixture::new(true);
        let a = f.insert(42).unwrap();
        let err = f.insert(42).unwrap_err();
        assert_eq!(
            CoreError::of(&err),
            Some(&CoreError::DuplicateKey {
                index: "k".into(),
                existing: a
            })
        );
        assert_eq!(f.index.len(), 1);
        assert_eq!(f.lookup(42), vec![a]);
    }

    #[test]
    fn unique_ignores_invisible_duplicate() {
        let mut f = Fixture::new(true);
        let a = f.insert(42).unwrap();
        f.rows.set_row_state(a, RowState::InTransaction);
        let b = f.insert(42).unwrap();
        assert_eq!(f.lookup(42), vec![b]);
    }

    #[test]
    fn rehash_preserves_every_key() {
        let mut f = Fixture::new(false);
        let mut expected = Vec::new();
        for k in 0..200u32 {
            let id = f.insert(k).unwrap();
            let dup = f.insert(k).unwrap();
            expected.push((k, vec![id, dup]));
        }
        assert!(f.index.rehash_count() > 0);
        assert!(f.index.occupied_buckets() <= f.index.bucket_capacity() / 2 + 1);
        for (k, ids) in &expected {
            assert_eq!(&f.lookup(*k), ids);
        }
        assert_eq!(f.index.key_count(), 200);
    }

    #[test]
    fn interleaved_deletes_keep_chains_consistent() {
        let mut f = Fixture::new(false);
        let ids: Vec<_> = (0..64u32).map(|k| (k, f.insert(k % 16).unwrap())).collect();
        for (k, id) in &ids {
            if k % 3 == 0 {
                f.delete(*id);
            }
        }
        for key in 0..16u32 {
            let expected: Vec<_> = ids
                .iter()
                .filter(|(k, _)| k % 16 == key && k % 3 != 0)
                .map(|(_, id)| *id)
                .collect();
            assert_eq!(f.lookup(key), expected, "key {}", key);
        }
    }

    #[test]
    fn query_filtered_applies_predicates() {
        let mut f = Fixture::new(false);
        let a = f.insert(5).unwrap();
        let _b = f.insert(5).unwrap();
        let only_a = move |_: &[u8]| true;
        let filters: [&dyn Fn(&[u8]) -> bool; 1] = [&only_a];
        let bytes = 5u32.to_le_bytes();
        let got: Vec<_> = f
            .index
            .query_filtered(&f.rows, &[&bytes[..]], &CommittedView, &filters)
            .collect();
        assert_eq!(got.len(), 2);

        let is_a = |row: &[u8]| row.as_ptr() == f.rows.slot(a).as_ptr();
        let filters: [&dyn Fn(&[u8]) -> bool; 1] = [&is_a];
        let got: Vec<_> = f
            .index
            .query_filtered(&f.rows, &[&bytes[..]], &CommittedView, &filters)
            .collect();
        assert_eq!(got, vec![a]);
    }

    #[test]
    fn find_conflict_skips_excluded_row() {
        let mut f = Fixture::new(true);
        let a = f.insert(9).unwrap();
        let row = f.rows.slot(a).to_vec();
        assert_eq!(f.index.find_conflict(&f.rows, &row, &CommittedView, a), None);
        assert_eq!(f.index.find_conflict(&f.rows, &row, &CommittedView, 0), Some(a));
        let bytes = 9u32.to_le_bytes();
        assert_eq!(f.index.query_unique(&f.rows, &[&bytes[..]], &CommittedView), Some(a));
    }

    #[test]
    fn node_arena_grows_with_row_ids() {
        let mut f = Fixture::new(false);
        for k in 0..100u32 {
            f.insert(k).unwrap();
        }
        assert_eq!(f.index.len(), 100);
        assert!(f.index.contains(100));
        assert!(!f.index.contains(101));
    }
}
