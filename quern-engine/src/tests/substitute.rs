// SPDX-License-Identifier: MIT

//! Substitution tests driving real substituter scripts.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;

use quern_store_core::store_path::PathSet;

use super::test_store::TestStore;
use crate::worker::ensure_path;

#[test]
fn test_substitute_realises_a_path() {
    let ts = TestStore::new();
    let wanted = ts.output_path("wanted");
    let fetch = ts.write_script("fetch.sh", "echo fetched > $1\n");

    ts.register_substitute(&wanted, &fetch, &[]);
    ensure_path(&ts.store, &wanted).unwrap();

    assert!(ts.store.is_valid_path(&wanted));
    assert_eq!(fs::read(&wanted).unwrap(), b"fetched\n");
    // Canonicalised like any other store object.
    let mode = fs::metadata(&wanted).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o444);
}

#[test]
fn test_substituter_receives_extra_args() {
    let ts = TestStore::new();
    let wanted = ts.output_path("payload");
    let fetch = ts.write_script("fetch.sh", "echo payload-is-$2 > $1\n");

    ts.register_substitute(&wanted, &fetch, &["alpha"]);
    ensure_path(&ts.store, &wanted).unwrap();

    assert_eq!(fs::read(&wanted).unwrap(), b"payload-is-alpha\n");
}

#[test]
fn test_failing_substitute_falls_through_to_next() {
    let ts = TestStore::new();
    let wanted = ts.output_path("contested");

    let works = ts.write_script("works.sh", "echo from-backup > $1\n");
    let broken = ts.write_script("broken.sh", "echo no luck >&2\nexit 1\n");

    // Newest first: the broken one is consulted before the backup.
    ts.register_substitute(&wanted, &works, &[]);
    ts.register_substitute(&wanted, &broken, &[]);

    ensure_path(&ts.store, &wanted).unwrap();
    assert_eq!(fs::read(&wanted).unwrap(), b"from-backup\n");
}

#[test]
fn test_substitute_that_produces_nothing_counts_as_failed() {
    let ts = TestStore::new();
    let wanted = ts.output_path("phantom");

    let silent = ts.write_script("silent.sh", "exit 0\n");
    let works = ts.write_script("works.sh", "echo real > $1\n");

    ts.register_substitute(&wanted, &works, &[]);
    ts.register_substitute(&wanted, &silent, &[]);

    ensure_path(&ts.store, &wanted).unwrap();
    assert_eq!(fs::read(&wanted).unwrap(), b"real\n");
}

#[test]
fn test_no_substitutes_left_fails() {
    let ts = TestStore::new();
    let wanted = ts.output_path("hopeless");
    let broken = ts.write_script("broken.sh", "exit 1\n");

    ts.register_substitute(&wanted, &broken, &[]);
    assert!(ensure_path(&ts.store, &wanted).is_err());
    assert!(!ts.store.is_valid_path(&wanted));
}

#[test]
fn test_unsubstitutable_path_fails() {
    let ts = TestStore::new();
    let wanted = ts.output_path("nowhere");
    assert!(ensure_path(&ts.store, &wanted).is_err());
}

#[test]
fn test_references_are_realised_before_the_path() {
    let ts = TestStore::new();
    let dep = ts.output_path("dep");
    let top = ts.output_path("top");

    let fetch_dep = ts.write_script("fetch-dep.sh", "echo dep > $1\n");
    // The top substituter refuses to run unless the dependency is already
    // present, which is exactly what the closure ordering guarantees.
    let fetch_top = ts.write_script(
        "fetch-top.sh",
        &format!("[ -e {} ] || exit 1\necho top > $1\n", dep.display()),
    );

    ts.register_substitute(&dep, &fetch_dep, &[]);
    ts.register_substitute(&top, &fetch_top, &[]);
    ts.store
        .with_txn(|txn| ts.store.set_references(txn, &top, &PathSet::from([dep.clone()])))
        .unwrap();

    ensure_path(&ts.store, &top).unwrap();

    assert!(ts.store.is_valid_path(&dep));
    assert!(ts.store.is_valid_path(&top));
    // The declared references survive realisation.
    assert_eq!(
        ts.store.query_references(&top).unwrap(),
        PathSet::from([dep.clone()])
    );
    assert!(ts.store.query_referers(&dep).unwrap().contains(&top));
}

#[test]
fn test_ensure_path_on_valid_path_is_a_noop() {
    let ts = TestStore::new();
    let path = ts
        .store
        .add_text_to_store("already", "here", &PathSet::new())
        .unwrap();
    ensure_path(&ts.store, &path).unwrap();
    assert!(ts.store.is_valid_path(&path));
}
