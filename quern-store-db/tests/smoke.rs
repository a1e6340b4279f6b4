// SPDX-License-Identifier: MIT

//! Smoke tests for the keyed-table layer and its transactions.

use quern_store_db::{read_schema_version, write_schema_version, StoreDb, Table, Tables};

#[test]
fn test_single_value_roundtrip() {
    let db = StoreDb::open_memory().unwrap();
    assert_eq!(db.query_string(Table::ValidPaths, "/p").unwrap(), None);

    db.set_string(Table::ValidPaths, "/p", "sha256:abcd").unwrap();
    assert_eq!(
        db.query_string(Table::ValidPaths, "/p").unwrap(),
        Some("sha256:abcd".to_string())
    );

    db.set_string(Table::ValidPaths, "/p", "sha256:ef01").unwrap();
    assert_eq!(
        db.query_string(Table::ValidPaths, "/p").unwrap(),
        Some("sha256:ef01".to_string())
    );
}

#[test]
fn test_string_list_preserves_order() {
    let db = StoreDb::open_memory().unwrap();
    let values = vec!["zeta".to_string(), "alpha".to_string(), "mid".to_string()];
    db.set_strings(Table::References, "/p", &values).unwrap();
    assert_eq!(db.query_strings(Table::References, "/p").unwrap(), values);
}

#[test]
fn test_empty_list_removes_pair() {
    let db = StoreDb::open_memory().unwrap();
    db.set_strings(Table::References, "/p", &["a".to_string()])
        .unwrap();
    db.set_strings(Table::References, "/p", &[]).unwrap();
    assert_eq!(db.enum_table(Table::References).unwrap(), Vec::<String>::new());
}

#[test]
fn test_del_pair_and_enum() {
    let db = StoreDb::open_memory().unwrap();
    db.set_string(Table::Derivers, "/b", "/drv1").unwrap();
    db.set_string(Table::Derivers, "/a", "/drv2").unwrap();
    assert_eq!(db.enum_table(Table::Derivers).unwrap(), vec!["/a", "/b"]);

    db.del_pair(Table::Derivers, "/a").unwrap();
    assert_eq!(db.enum_table(Table::Derivers).unwrap(), vec!["/b"]);
}

#[test]
fn test_tables_are_independent() {
    let db = StoreDb::open_memory().unwrap();
    db.set_string(Table::ValidPaths, "/p", "hash").unwrap();
    assert_eq!(db.query_string(Table::References, "/p").unwrap(), None);
    assert_eq!(db.query_string(Table::Substitutes, "/p").unwrap(), None);
}

#[test]
fn test_transaction_commit_and_rollback() {
    let mut db = StoreDb::open_memory().unwrap();

    {
        let txn = db.transaction().unwrap();
        txn.set_string(Table::ValidPaths, "/kept", "h").unwrap();
        txn.commit().unwrap();
    }
    {
        // Dropped without commit: rolled back.
        let txn = db.transaction().unwrap();
        txn.set_string(Table::ValidPaths, "/lost", "h").unwrap();
    }

    assert!(db.query_string(Table::ValidPaths, "/kept").unwrap().is_some());
    assert!(db.query_string(Table::ValidPaths, "/lost").unwrap().is_none());
}

#[test]
fn test_nested_transaction_rollback_is_contained() {
    let mut db = StoreDb::open_memory().unwrap();

    let mut txn = db.transaction().unwrap();
    txn.set_string(Table::ValidPaths, "/outer", "h").unwrap();
    {
        let inner = txn.nested().unwrap();
        inner.set_string(Table::ValidPaths, "/inner", "h").unwrap();
        // inner dropped: rolled back
    }
    txn.commit().unwrap();

    assert!(db.query_string(Table::ValidPaths, "/outer").unwrap().is_some());
    assert!(db.query_string(Table::ValidPaths, "/inner").unwrap().is_none());
}

#[test]
fn test_schema_version_file() {
    let dir = tempfile::TempDir::new().unwrap();
    assert_eq!(read_schema_version(dir.path()).unwrap(), None);

    write_schema_version(dir.path(), 2).unwrap();
    assert_eq!(read_schema_version(dir.path()).unwrap(), Some(2));

    std::fs::write(dir.path().join("schema"), "not a number").unwrap();
    assert!(read_schema_version(dir.path()).is_err());
}

#[test]
fn test_open_on_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut db = StoreDb::open(dir.path()).unwrap();
    {
        let txn = db.transaction().unwrap();
        txn.set_string(Table::ValidPaths, "/p", "sha256:00").unwrap();
        txn.commit().unwrap();
    }
    drop(db);

    // Reopen and observe the committed row.
    let db = StoreDb::open(dir.path()).unwrap();
    assert_eq!(
        db.query_string(Table::ValidPaths, "/p").unwrap(),
        Some("sha256:00".to_string())
    );
}
