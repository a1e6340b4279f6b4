// SPDX-License-Identifier: MIT

//! Store-level tests: content addressing, reference symmetry, the cleanup
//! invariant, and verification.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;

use quern_store_core::store_path::PathSet;
use quern_store_db::{Table, Tables};

use super::test_store::TestStore;
use crate::archive;

#[test]
fn test_add_to_store_trivial_source() {
    let ts = TestStore::new();
    let src = ts.scratch().join("greeting.txt");
    fs::write(&src, "hi\n").unwrap();

    let path = ts.store.add_to_store(&src).unwrap();

    // The destination is the content-addressed path for this source tree.
    let expected = ts.store.store_dir().make_store_path(
        "source",
        &archive::hash_path(&src).unwrap(),
        "greeting.txt",
    );
    assert_eq!(path, expected);
    assert!(path.file_name().unwrap().to_str().unwrap().ends_with("-greeting.txt"));

    assert!(ts.store.is_valid_path(&path));
    assert_eq!(fs::read(&path).unwrap(), b"hi\n");
    assert_eq!(ts.store.query_references(&path).unwrap(), PathSet::new());

    // Canonicalised on the way in.
    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o444);

    // The recorded hash matches the on-disk content.
    assert_eq!(
        ts.store.query_path_hash(&path).unwrap(),
        archive::hash_path(&path).unwrap()
    );
}

#[test]
fn test_add_to_store_is_idempotent_and_content_addressed() {
    let ts = TestStore::new();
    let elsewhere = ts.scratch().join("elsewhere");
    fs::create_dir_all(&elsewhere).unwrap();
    let a = ts.scratch().join("same.txt");
    let b = elsewhere.join("same.txt");
    fs::write(&a, "identical contents").unwrap();
    fs::write(&b, "identical contents").unwrap();

    let p1 = ts.store.add_to_store(&a).unwrap();
    let p2 = ts.store.add_to_store(&a).unwrap();
    let p3 = ts.store.add_to_store(&b).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(p1, p3);

    fs::write(&a, "different contents").unwrap();
    let p4 = ts.store.add_to_store(&a).unwrap();
    assert_ne!(p1, p4);
}

#[test]
fn test_add_text_with_references() {
    let ts = TestStore::new();

    let dep = ts.store.add_text_to_store("dep", "the dep", &PathSet::new()).unwrap();
    let refs = PathSet::from([dep.clone()]);
    let user = ts.store.add_text_to_store("user", "uses the dep", &refs).unwrap();

    assert_eq!(ts.store.query_references(&user).unwrap(), refs);
    assert!(ts.store.query_referers(&dep).unwrap().contains(&user));
}

#[test]
fn test_register_rejects_invalid_reference() {
    let ts = TestStore::new();
    let ghost = ts.output_path("ghost");

    let result = ts
        .store
        .add_text_to_store("broken", "refs a ghost", &PathSet::from([ghost]));
    assert!(result.is_err());
}

#[test]
fn test_set_references_keeps_referer_symmetry() {
    let ts = TestStore::new();
    let a = ts.store.add_text_to_store("a", "a", &PathSet::new()).unwrap();
    let b = ts.store.add_text_to_store("b", "b", &PathSet::new()).unwrap();
    let c = ts.store.add_text_to_store("c", "c", &PathSet::new()).unwrap();

    let refs = PathSet::from([a.clone(), b.clone()]);
    ts.store
        .with_txn(|txn| ts.store.set_references(txn, &c, &refs))
        .unwrap();

    assert_eq!(ts.store.query_references(&c).unwrap(), refs);
    assert_eq!(ts.store.query_referers(&a).unwrap(), PathSet::from([c.clone()]));
    assert_eq!(ts.store.query_referers(&b).unwrap(), PathSet::from([c.clone()]));

    // Dropping an edge removes the inverse mapping.
    let only_a = PathSet::from([a.clone()]);
    ts.store
        .with_txn(|txn| ts.store.set_references(txn, &c, &only_a))
        .unwrap();
    assert_eq!(ts.store.query_referers(&b).unwrap(), PathSet::new());
    assert_eq!(ts.store.query_referers(&a).unwrap(), PathSet::from([c]));
}

#[test]
fn test_invalidate_preserves_cleanup_invariant() {
    let ts = TestStore::new();
    let dep = ts.store.add_text_to_store("dep", "dep", &PathSet::new()).unwrap();
    let top = ts
        .store
        .add_text_to_store("top", "top", &PathSet::from([dep.clone()]))
        .unwrap();

    // The dep is in use, so deleting it is refused.
    assert!(ts.store.delete_from_store(&dep).is_err());
    assert!(ts.store.is_valid_path(&dep));

    // Delete top first, then dep.
    ts.store.delete_from_store(&top).unwrap();
    assert!(!ts.store.is_valid_path(&top));
    ts.store.delete_from_store(&dep).unwrap();
    assert!(!ts.store.is_valid_path(&dep));

    // No table entries survive for either path.
    for path in [&top, &dep] {
        assert_eq!(ts.store.query_references(path).unwrap(), PathSet::new());
        assert_eq!(ts.store.query_referers(path).unwrap(), PathSet::new());
        assert_eq!(ts.store.query_deriver(path).unwrap(), None);
    }
}

#[test]
fn test_compute_fs_closure() {
    let ts = TestStore::new();
    let a = ts.store.add_text_to_store("a", "a", &PathSet::new()).unwrap();
    let b = ts
        .store
        .add_text_to_store("b", "b", &PathSet::from([a.clone()]))
        .unwrap();
    let c = ts
        .store
        .add_text_to_store("c", "c", &PathSet::from([b.clone()]))
        .unwrap();

    let mut closure = PathSet::new();
    ts.store.compute_fs_closure(&c, &mut closure).unwrap();
    assert_eq!(closure, PathSet::from([a, b, c]));
}

#[test]
fn test_verify_store_is_noop_on_untampered_store() {
    let ts = TestStore::new();
    let dep = ts.store.add_text_to_store("dep", "dep", &PathSet::new()).unwrap();
    let top = ts
        .store
        .add_text_to_store("top", "top", &PathSet::from([dep.clone()]))
        .unwrap();

    ts.store.verify_store(true).unwrap();

    assert!(ts.store.is_valid_path(&dep));
    assert!(ts.store.is_valid_path(&top));
    assert_eq!(
        ts.store.query_references(&top).unwrap(),
        PathSet::from([dep.clone()])
    );
    assert_eq!(ts.store.query_referers(&dep).unwrap(), PathSet::from([top]));
}

#[test]
fn test_verify_store_prunes_missing_and_orphaned_entries() {
    let ts = TestStore::new();
    let kept = ts.store.add_text_to_store("kept", "kept", &PathSet::new()).unwrap();

    // A valid-paths entry whose file never existed, and a references entry
    // for a path that is neither valid nor substitutable.
    let ghost = ts.output_path("ghost");
    let orphan = ts.output_path("orphan");
    ts.store
        .with_txn(|txn| {
            txn.set_string(
                Table::ValidPaths,
                &ghost.to_string_lossy(),
                "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            )?;
            txn.set_strings(
                Table::References,
                &orphan.to_string_lossy(),
                &[kept.to_string_lossy().into_owned()],
            )?;
            Ok(())
        })
        .unwrap();

    ts.store.verify_store(false).unwrap();

    assert!(!ts.store.is_valid_path(&ghost));
    assert_eq!(ts.store.query_references(&orphan).unwrap(), PathSet::new());
    assert!(ts.store.is_valid_path(&kept));
}

#[test]
fn test_read_only_mode_writes_nothing() {
    let ts = TestStore::with_settings(|s| s.read_only = true);
    let src = ts.scratch().join("file.txt");
    fs::write(&src, "contents").unwrap();

    let path = ts.store.add_to_store(&src).unwrap();

    // The computed path comes back, but nothing was copied or registered.
    assert!(!path.exists());
    assert!(!ts.store.is_valid_path(&path));
}

#[test]
fn test_schema_version_recorded() {
    let ts = TestStore::new();
    let schema = fs::read_to_string(ts.store.settings().db_dir().join("schema")).unwrap();
    assert_eq!(schema.trim(), "2");
}

#[test]
fn test_substitute_registry_order_and_dedup() {
    let ts = TestStore::new();
    let path = ts.output_path("wanted");
    let older = ts.write_script("older.sh", "exit 0\n");
    let newer = ts.write_script("newer.sh", "exit 0\n");

    ts.register_substitute(&path, &older, &[]);
    ts.register_substitute(&path, &newer, &[]);

    let subs = ts.store.query_substitutes(&path).unwrap();
    assert_eq!(
        subs.iter().map(|s| s.program.clone()).collect::<Vec<_>>(),
        vec![newer.clone(), older.clone()]
    );

    // Re-registering moves an existing invocation to the front.
    ts.register_substitute(&path, &older, &[]);
    let subs = ts.store.query_substitutes(&path).unwrap();
    assert_eq!(
        subs.iter().map(|s| s.program.clone()).collect::<Vec<_>>(),
        vec![older, newer]
    );
}

#[test]
fn test_clear_substitutes_empties_the_registry() {
    let ts = TestStore::new();
    let fetch = ts.write_script("fetch.sh", "exit 0\n");
    let a = ts.output_path("a");
    let b = ts.output_path("b");
    ts.register_substitute(&a, &fetch, &[]);
    ts.register_substitute(&b, &fetch, &[]);

    ts.store.clear_substitutes().unwrap();

    assert!(ts.store.query_substitutes(&a).unwrap().is_empty());
    assert!(ts.store.query_substitutes(&b).unwrap().is_empty());
}

#[test]
fn test_malformed_substitute_entries_are_skipped() {
    let ts = TestStore::new();
    let path = ts.output_path("wanted");
    let good = ts.write_script("good.sh", "exit 0\n");

    ts.register_substitute(&path, &good, &[]);
    ts.store
        .with_txn(|txn| {
            let key = path.to_string_lossy().into_owned();
            let mut values = txn.query_strings(Table::Substitutes, &key)?;
            values.push("not a packed substitute".to_string());
            txn.set_strings(Table::Substitutes, &key, &values)?;
            Ok(())
        })
        .unwrap();

    let subs = ts.store.query_substitutes(&path).unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].program, good);
}

#[test]
fn test_store_path_helpers_roundtrip() {
    let ts = TestStore::new();
    let path = ts.store.add_text_to_store("thing", "thing", &PathSet::new()).unwrap();

    let dir = ts.store.store_dir();
    assert!(dir.is_store_path(&path));
    let inner: PathBuf = path.join("does/not/matter");
    assert_eq!(dir.to_store_path(&inner).unwrap(), path);
}
