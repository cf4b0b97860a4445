//! # Hash Index Property Tests
//!
//! Random insert/remove sequences over a small key space, so that chains,
//! sibling lists and rehashes all get exercised, compared against a map from
//! key to the set of row ids holding it.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use slabdb::index::{HashIndex, KeyField, KeySpec};
use slabdb::storage::{Arena, ArenaConfig, ArenaKind, Backing, RowId, RowState};
use slabdb::txn::CommittedView;
use slabdb::CoreError;

struct Harness {
    rows: Arena,
    index: HashIndex,
    model: BTreeMap<u32, BTreeSet<RowId>>,
}

impl Harness {
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
            model: BTreeMap::new(),
        }
    }

    fn insert(&mut self, key: u32) -> bool {
        let id = self.rows.allocate().unwrap();
        self.rows.slot_mut(id)[..4].copy_from_slice(&key.to_le_bytes());
        self.rows.set_row_state(id, RowState::Committed);
        match self.index.add(id, &self.rows, Some(&CommittedView)) {
            Ok(()) => {
                self.model.entry(key).or_default().insert(id);
                true
            }
            Err(e) => {
                assert!(CoreError::is_duplicate_key(&e), "unexpected error: {e}");
                self.rows.free(id);
                false
            }
        }
    }

    fn remove_nth(&mut self, n: usize) {
        let live: Vec<(u32, RowId)> = self
            .model
            .iter()
            .flat_map(|(k, ids)| ids.iter().map(move |id| (*k, *id)))
            .collect();
        if live.is_empty() {
            return;
        }
        let (key, id) = live[n % live.len()];
        self.index.remove(id);
        self.rows.free(id);
        let ids = self.model.get_mut(&key).unwrap();
        ids.remove(&id);
        if ids.is_empty() {
            self.model.remove(&key);
        }
    }

    fn lookup(&self, key: u32) -> BTreeSet<RowId> {
        let bytes = key.to_le_bytes();
        self.index.query(&self.rows, &[&bytes[..]], &CommittedView).collect()
    }

    fn check(&self, key_space: u32) -> Result<(), TestCaseError> {
        let total: usize = self.model.values().map(BTreeSet::len).sum();
        prop_assert_eq!(self.index.len() as usize, total);
        prop_assert_eq!(self.index.key_count() as usize, self.model.len());
        for key in 0..key_space {
            let expected = self.model.get(&key).cloned().unwrap_or_default();
            prop_assert_eq!(self.lookup(key), expected, "key {}", key);
        }
        Ok(())
    }
}

fn ops(key_space: u32) -> impl Strategy<Value = Vec<(bool, u32, usize)>> {
    prop::collection::vec((prop::bool::weighted(0.65), 0..key_space, any::<usize>()), 1..300)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn non_unique_index_matches_model(ops in ops(24)) {
        let mut h = Harness::new(false);
        for (insert, key, n) in &ops {
            if *insert {
                prop_assert!(h.insert(*key));
            } else {
                h.remove_nth(*n);
            }
        }
        h.check(24)?;
    }

    #[test]
    fn unique_index_holds_one_row_per_key(ops in ops(64)) {
        let mut h = Harness::new(true);
        for (insert, key, n) in &ops {
            if *insert {
                let fresh = !h.model.contains_key(key);
                prop_assert_eq!(h.insert(*key), fresh);
            } else {
                h.remove_nth(*n);
            }
        }
        prop_assert!(h.model.values().all(|ids| ids.len() == 1));
        h.check(64)?;
    }

    #[test]
    fn growth_keeps_every_key_reachable(keys in prop::collection::btree_set(any::<u32>(), 1..500)) {
        let mut h = Harness::new(true);
        for key in &keys {
            prop_assert!(h.insert(*key));
        }
        prop_assert!(h.index.bucket_capacity() >= 8);
        prop_assert!(h.index.occupied_buckets() <= h.index.bucket_capacity());
        for key in &keys {
            prop_assert_eq!(h.lookup(*key).len(), 1);
        }
    }
}
