//! # End-to-End Scenario
//!
//! Drives the public API the way a query executor would: declare tables,
//! write through connections, read back through index lookups and scans,
//! checkpoint, close, and reopen.

use slabdb::index::write_text;
use slabdb::{
    CoreError, Engine, EngineOptions, IndexDef, KeyField, KeySpec, LockMode, SwitchOutcome, TableDef,
};
use tempfile::tempdir;

/// `id u32 | name text(12)`.
fn name_field() -> KeyField {
    KeyField::text(4, 12)
}

fn people() -> TableDef {
    TableDef::new("people", 16)
        .with_var_data()
        .with_index(IndexDef::new("id", KeySpec::new([KeyField::binary(0, 4)]).unwrap()).unique())
        .with_index(IndexDef::new("name", KeySpec::new([name_field()]).unwrap()))
}

fn person(id: u32, name: &str) -> [u8; 16] {
    let mut row = [0u8; 16];
    row[..4].copy_from_slice(&id.to_le_bytes());
    write_text(&mut row, &name_field(), name.as_bytes());
    row
}

fn name_of(row: &[u8]) -> &[u8] {
    let len = u16::from_le_bytes([row[4], row[5]]) as usize;
    &row[6..6 + len]
}

fn kv(k: u32, v: u8) -> [u8; 8] {
    let mut row = [0u8; 8];
    row[..4].copy_from_slice(&k.to_le_bytes());
    row[4] = v;
    row
}

#[test]
fn rollback_restores_deleted_key_and_drops_inserted_one() {
    let engine = Engine::default();
    let db = engine
        .database("kv")
        .table(TableDef::new("kv", 8).with_index(
            IndexDef::new("k", KeySpec::new([KeyField::binary(0, 4)]).unwrap()).unique(),
        ))
        .open()
        .unwrap();
    let kv_table = db.table("kv").unwrap();
    let k1 = 1u32.to_le_bytes();
    let k3 = 3u32.to_le_bytes();

    let mut conn = engine.connect();
    let a = conn.insert(&kv_table, &kv(1, b'a'), None).unwrap();
    conn.insert(&kv_table, &kv(2, b'b'), None).unwrap();

    conn.begin().unwrap();
    conn.insert(&kv_table, &kv(3, b'c'), None).unwrap();
    assert!(conn.delete(&kv_table, a).unwrap());
    assert_eq!(conn.read(&kv_table).unwrap().lookup_unique("k", &[&k1[..]]).unwrap(), None);
    conn.rollback().unwrap();

    let reader = conn.read(&kv_table).unwrap();
    let found = reader.lookup_unique("k", &[&k1[..]]).unwrap().unwrap();
    assert_eq!(reader.row(found).unwrap()[4], b'a');
    assert_eq!(reader.lookup_unique("k", &[&k3[..]]).unwrap(), None);
    assert_eq!(reader.row_count(), 2);
}

#[test]
fn catalog_lifecycle() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(EngineOptions::default()).unwrap();
        let db = engine.database("main").path(dir.path()).table(people()).open().unwrap();
        let people = db.table("people").unwrap();

        let mut conn = engine.connect();
        conn.begin().unwrap();
        for (id, name) in [(1, "ada"), (2, "grace"), (3, "ada")] {
            let bio = format!("bio of {name} #{id}");
            conn.insert(&people, &person(id, name), Some(bio.as_bytes())).unwrap();
        }
        conn.commit().unwrap();

        {
            let reader = conn.read(&people).unwrap();
            assert_eq!(reader.lookup("name", &[&b"ada"[..]]).unwrap().count(), 2);
            assert_eq!(reader.lookup("name", &[&b"ADA"[..]]).unwrap().count(), 2);
            assert!(reader.lookup("name", &[&b"adam"[..]]).unwrap().next().is_none());
            assert!(reader.lookup("missing", &[&b"ada"[..]]).is_err());
        }

        let grace = {
            let id = 2u32.to_le_bytes();
            conn.read(&people).unwrap().lookup_unique("id", &[&id[..]]).unwrap().unwrap()
        };
        let renamed = conn
            .update(&people, grace, &person(2, "hopper"), Some(b"rear admiral"))
            .unwrap();

        assert_eq!(db.checkpoint().unwrap(), SwitchOutcome::Switched);
        let reader = conn.read(&people).unwrap();
        assert_eq!(reader.var_data(renamed), Some(&b"rear admiral"[..]));
        drop(reader);
        engine.close().unwrap();
    }

    let engine = Engine::default();
    let db = engine.database("main").path(dir.path()).table(people()).open().unwrap();
    assert_eq!(db.recovery_report().commits, 0);
    let people = db.table("people").unwrap();
    let conn = engine.connect();
    let reader = conn.read(&people).unwrap();
    assert_eq!(reader.row_count(), 3);
    let names: Vec<&[u8]> = reader.scan().map(|(_, row)| name_of(row)).collect();
    assert!(names.contains(&&b"hopper"[..]));
    assert!(!names.contains(&&b"grace"[..]));
    assert_eq!(reader.lookup("name", &[&b"hopper"[..]]).unwrap().count(), 1);
}

#[test]
fn in_memory_table_inside_persistent_database() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::default();
        let db = engine
            .database("mixed")
            .path(dir.path())
            .table(people())
            .table(TableDef::new("scratch", 8).in_memory())
            .open()
            .unwrap();
        let scratch = db.table("scratch").unwrap();
        let people = db.table("people").unwrap();
        assert!(scratch.is_in_memory());
        assert!(!people.is_in_memory());

        let mut conn = engine.connect();
        conn.begin().unwrap();
        conn.insert(&scratch, &[7; 8], None).unwrap();
        conn.insert(&people, &person(1, "ada"), None).unwrap();
        let outcome = conn.commit().unwrap();
        assert_eq!(outcome.commit_ids.len(), 1);
        assert_eq!(outcome.inserted, 2);
    }

    let engine = Engine::default();
    let db = engine
        .database("mixed")
        .path(dir.path())
        .table(people())
        .table(TableDef::new("scratch", 8).in_memory())
        .open()
        .unwrap();
    let conn = engine.connect();
    assert_eq!(conn.read(&db.table("people").unwrap()).unwrap().row_count(), 1);
    assert_eq!(conn.read(&db.table("scratch").unwrap()).unwrap().row_count(), 0);
}

#[test]
fn tables_created_after_open_persist() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::default();
        let db = engine.database("late").path(dir.path()).open().unwrap();
        let people = db.create_table(people()).unwrap();
        engine.connect().insert(&people, &person(5, "linus"), None).unwrap();
        assert!(engine.close_database("late").unwrap());
    }

    let engine = Engine::default();
    let db = engine.database("late").path(dir.path()).table(people()).open().unwrap();
    let people = db.table("people").unwrap();
    let conn = engine.connect();
    let id = 5u32.to_le_bytes();
    assert!(conn.read(&people).unwrap().lookup_unique("id", &[&id[..]]).unwrap().is_some());
}

#[test]
fn rows_must_match_the_declared_size() {
    let engine = Engine::default();
    let db = engine.database("sizes").table(people()).open().unwrap();
    let people = db.table("people").unwrap();
    let mut conn = engine.connect();
    assert!(conn.insert(&people, &[0; 15], None).is_err());
    assert!(conn.insert(&people, &[0; 17], None).is_err());
    assert_eq!(conn.read(&people).unwrap().row_count(), 0);
}

#[test]
fn invalid_definitions_are_rejected() {
    let engine = Engine::default();
    assert!(engine.database("bad").table(TableDef::new("", 4)).open().is_err());
    assert!(engine.database("bad").table(TableDef::new("zero", 0)).open().is_err());
    let key_past_row =
        TableDef::new("short", 4).with_index(IndexDef::new("k", KeySpec::new([KeyField::binary(2, 4)]).unwrap()));
    assert!(engine.database("bad").table(key_past_row).open().is_err());
    assert!(engine.get_database("bad").is_none());
}

#[test]
fn unique_violation_reports_the_existing_row() {
    let engine = Engine::default();
    let db = engine.database("dupes").table(people()).open().unwrap();
    let people = db.table("people").unwrap();
    let mut conn = engine.connect();
    let first = conn.insert(&people, &person(1, "ada"), None).unwrap();
    let err = conn.insert(&people, &person(1, "bob"), None).unwrap_err();
    match CoreError::of(&err) {
        Some(CoreError::DuplicateKey { index, existing }) => {
            assert_eq!(index, "id");
            assert_eq!(*existing, first);
        }
        other => panic!("expected a duplicate key, got {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn process_lock_mode_round_trip() {
    let dir = tempdir().unwrap();
    let engine = Engine::default();
    let db = engine
        .database("shared")
        .path(dir.path())
        .lock_mode(LockMode::Process)
        .table(people())
        .open()
        .unwrap();
    let people = db.table("people").unwrap();
    assert_eq!(people.lock_mode(), LockMode::Process);
    assert!(dir.path().join(format!("T{:06}.lck", people.id())).exists());

    let mut conn = engine.connect();
    conn.begin().unwrap();
    conn.wrlock_table(&people).unwrap();
    conn.insert(&people, &person(1, "ada"), None).unwrap();
    conn.commit().unwrap();

    let reader = engine.connect();
    assert_eq!(reader.read(&people).unwrap().row_count(), 1);
}
