// SPDX-License-Identifier: MIT

//! End-to-end build tests driving real `/bin/sh` builders through the
//! worker.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use quern_store_core::hash::{hash_string, Algorithm};
use quern_store_core::store_path::PathSet;

use super::test_store::TestStore;
use crate::worker::build_derivations;

#[test]
fn test_simple_build() {
    let ts = TestStore::new();
    let drv = ts.sh_derivation("hello", "echo hello > $out");
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("hello", &drv);

    build_derivations(&ts.store, &PathSet::from([drv_path.clone()])).unwrap();

    assert!(ts.store.is_valid_path(&out_path));
    assert_eq!(fs::read(&out_path).unwrap(), b"hello\n");
    assert_eq!(ts.store.query_references(&out_path).unwrap(), PathSet::new());
    assert_eq!(ts.store.query_deriver(&out_path).unwrap(), Some(drv_path.clone()));

    // The build log went to <log_dir>/<drv base name>.
    let log_path = ts
        .store
        .settings()
        .log_dir
        .join(drv_path.file_name().unwrap());
    assert!(log_path.exists());
}

#[test]
fn test_realise_twice_does_not_rebuild() {
    let ts = TestStore::new();
    let counter = ts.scratch().join("counter");
    let drv = ts.sh_derivation(
        "counted",
        &format!("echo ran >> {}; echo out > $out", counter.display()),
    );
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("counted", &drv);

    build_derivations(&ts.store, &PathSet::from([drv_path.clone()])).unwrap();
    build_derivations(&ts.store, &PathSet::from([drv_path])).unwrap();

    assert!(ts.store.is_valid_path(&out_path));
    // The builder ran exactly once.
    assert_eq!(fs::read_to_string(&counter).unwrap(), "ran\n");
}

#[test]
fn test_builder_failure_fails_the_goal() {
    let ts = TestStore::new();
    let drv = ts.sh_derivation("doomed", "echo it went wrong >&2; exit 1");
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("doomed", &drv);

    assert!(build_derivations(&ts.store, &PathSet::from([drv_path])).is_err());
    assert!(!ts.store.is_valid_path(&out_path));
}

#[test]
fn test_missing_output_fails_the_build() {
    let ts = TestStore::new();
    let drv = ts.sh_derivation("lazy", "true");
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("lazy", &drv);

    assert!(build_derivations(&ts.store, &PathSet::from([drv_path])).is_err());
    assert!(!ts.store.is_valid_path(&out_path));
}

#[test]
fn test_platform_mismatch_fails_the_build() {
    let ts = TestStore::new();
    let mut drv = ts.sh_derivation("alien", "echo hi > $out");
    drv.platform = "mips64-plan9".to_string();
    let drv_path = ts.write_derivation("alien", &drv);

    assert!(build_derivations(&ts.store, &PathSet::from([drv_path])).is_err());
}

#[test]
fn test_fixed_output_hash_mismatch() {
    let ts = TestStore::new();
    let mut drv = ts.sh_derivation("fetched", "printf 'unexpected contents' > $out");
    let declared = hash_string(Algorithm::Sha256, "the contents we promised");
    {
        let out = drv.outputs.get_mut("out").unwrap();
        out.hash_algo = "sha256".to_string();
        out.hash = declared.to_hex();
    }
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("fetched", &drv);

    // The builder exits 0, but the declared hash does not match.
    assert!(build_derivations(&ts.store, &PathSet::from([drv_path])).is_err());
    assert!(!ts.store.is_valid_path(&out_path));
}

#[test]
fn test_fixed_output_success() {
    let ts = TestStore::new();
    let mut drv = ts.sh_derivation("fetched-ok", "printf 'exact payload' > $out");
    let declared = hash_string(Algorithm::Sha256, "exact payload");
    {
        let out = drv.outputs.get_mut("out").unwrap();
        out.hash_algo = "sha256".to_string();
        out.hash = declared.to_hex();
    }
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("fetched-ok", &drv);

    build_derivations(&ts.store, &PathSet::from([drv_path])).unwrap();
    assert!(ts.store.is_valid_path(&out_path));
    assert_eq!(fs::read(&out_path).unwrap(), b"exact payload");
}

#[test]
fn test_input_derivation_closure_and_reference_scan() {
    let ts = TestStore::new();

    let dep_drv = ts.sh_derivation("dep", "echo the dependency > $out");
    let dep_out = dep_drv.outputs["out"].path.clone();
    let dep_drv_path = ts.write_derivation("dep", &dep_drv);

    // The top builder embeds the dependency's store path in its output,
    // which the reference scanner must discover.
    let mut top_drv = ts.sh_derivation("top", &format!("echo {} > $out", dep_out.display()));
    top_drv.input_drvs = BTreeMap::from([(
        dep_drv_path.clone(),
        std::collections::BTreeSet::from(["out".to_string()]),
    )]);
    let top_out = top_drv.outputs["out"].path.clone();
    let top_drv_path = ts.write_derivation("top", &top_drv);

    build_derivations(&ts.store, &PathSet::from([top_drv_path])).unwrap();

    // The input was built first, and the scan recorded the edge.
    assert!(ts.store.is_valid_path(&dep_out));
    assert!(ts.store.is_valid_path(&top_out));
    assert_eq!(
        ts.store.query_references(&top_out).unwrap(),
        PathSet::from([dep_out.clone()])
    );
    assert!(ts.store.query_referers(&dep_out).unwrap().contains(&top_out));
}

#[test]
fn test_unregistered_output_artifact_is_cleared() {
    let ts = TestStore::new();
    let drv = ts.sh_derivation("fresh", "echo fresh > $out");
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("fresh", &drv);

    // Debris from a crashed build: on disk but not registered.
    fs::write(&out_path, "stale debris").unwrap();

    build_derivations(&ts.store, &PathSet::from([drv_path])).unwrap();
    assert_eq!(fs::read(&out_path).unwrap(), b"fresh\n");
}

#[test]
fn test_max_build_jobs_serialises_builders() {
    let ts = TestStore::with_settings(|s| s.max_build_jobs = 1);
    let trace = ts.scratch().join("trace");

    let mut drv_paths = PathSet::new();
    let mut outputs = Vec::new();
    for name in ["one", "two"] {
        let mut drv = ts.sh_derivation(
            name,
            &format!(
                "echo start-{name} >> {trace}; sleep 0.3; echo end-{name} >> {trace}; \
                 echo done > $out",
                trace = trace.display()
            ),
        );
        // `sleep` is no shell builtin, and the scrubbed PATH points
        // nowhere; the derivation has to bring its own.
        drv.env.insert("PATH".to_string(), "/bin:/usr/bin".to_string());
        outputs.push(drv.outputs["out"].path.clone());
        drv_paths.insert(ts.write_derivation(name, &drv));
    }

    build_derivations(&ts.store, &drv_paths).unwrap();
    for out in outputs {
        assert!(ts.store.is_valid_path(&out));
    }

    // With a single build slot the builders must not overlap: each start
    // is immediately followed by its own end.
    let lines: Vec<String> = fs::read_to_string(&trace)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(lines.len(), 4);
    for pair in lines.chunks(2) {
        let started = pair[0].strip_prefix("start-").unwrap();
        let ended = pair[1].strip_prefix("end-").unwrap();
        assert_eq!(started, ended, "builders overlapped: {lines:?}");
    }
}

#[test]
fn test_keep_going_builds_the_survivor() {
    let ts = TestStore::with_settings(|s| s.keep_going = true);

    let bad = ts.sh_derivation("bad", "exit 1");
    let bad_path = ts.write_derivation("bad", &bad);

    let good = ts.sh_derivation("good", "echo good > $out");
    let good_out = good.outputs["out"].path.clone();
    let good_path = ts.write_derivation("good", &good);

    // The aggregate result is a failure, but the good build completed.
    assert!(build_derivations(&ts.store, &PathSet::from([bad_path, good_path])).is_err());
    assert!(ts.store.is_valid_path(&good_out));
}

#[test]
fn test_declining_build_hook_falls_back_to_local_build() {
    let hook_body = "echo hook consulted for $4\necho decline >&3\n";
    let ts = TestStore::new();
    let hook = ts.write_script("hook.sh", hook_body);

    // Settings are fixed at open time, so make a second store view with
    // the hook enabled.
    let mut settings = ts.store.settings().clone();
    settings.build_hook = Some(hook);
    let store = crate::store::Store::open(settings).unwrap();

    let drv = ts.sh_derivation("hooked", "echo built locally > $out");
    let out_path = drv.outputs["out"].path.clone();
    let drv_path = ts.write_derivation("hooked", &drv);

    build_derivations(&store, &PathSet::from([drv_path])).unwrap();
    assert!(store.is_valid_path(&out_path));
    assert_eq!(fs::read(&out_path).unwrap(), b"built locally\n");
}

#[test]
fn test_missing_derivation_fails_cleanly() {
    let ts = TestStore::new();
    let ghost_drv: PathBuf = ts.output_path("ghost.drv");

    assert!(build_derivations(&ts.store, &PathSet::from([ghost_drv])).is_err());
}
