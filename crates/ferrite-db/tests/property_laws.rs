//! Store-level behavior the rest of the system leans on: identity
//! uniqueness, reversible mutation, index self-healing.

use ferrite_db::{DbError, Depends, FileEntry, Manifest, ManifestStore, Stage};
use std::fs;
use std::path::Path;

fn store(dir: &Path) -> ManifestStore {
    ManifestStore::new(dir.join("db"), dir.join("backup"), 5)
}

fn manifest(name: &str, version: &str, run_deps: &[&str]) -> Manifest {
    Manifest {
        name: name.into(),
        version: version.into(),
        stage: Stage::Normal,
        origin: None,
        description: None,
        install_prefix: Some("/usr".into()),
        files: vec![FileEntry::Path(format!("/usr/bin/{name}-{version}"))],
        depends: Depends {
            build: Vec::new(),
            run: run_deps.iter().map(|s| s.to_string()).collect(),
        },
        provides: Vec::new(),
        replaces: Vec::new(),
        build_date: None,
    }
}

#[test]
fn add_then_remove_restores_initial_state() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());
    s.init().unwrap();

    let listing = |dir: &Path| {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    };

    let before = listing(s.db_dir());
    s.add(&manifest("alpha", "1.0", &[]), false).unwrap();
    s.remove("alpha-1.0", false).unwrap();
    let after = listing(s.db_dir());

    // same database contents (the backup area is allowed to differ)
    assert_eq!(before, after);
    assert!(s.list(None).unwrap().is_empty());
}

#[test]
fn no_two_manifests_share_an_identity() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());

    let m = manifest("alpha", "1.0", &[]);
    s.add(&m, false).unwrap();
    s.add(&m, true).unwrap();
    s.add(&m, true).unwrap();

    let entries = s.index().unwrap();
    assert_eq!(entries.len(), 1);

    // every index entry references a file that exists and parses
    for entry in entries {
        let path = s.db_dir().join(&entry.manifest);
        assert!(path.exists());
        let parsed = Manifest::load(&path).unwrap();
        assert_eq!(parsed.name, entry.name);
        assert_eq!(parsed.version, entry.version);
    }
}

#[test]
fn every_orphan_has_no_reverse_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());
    s.add(&manifest("core", "1.0", &[]), false).unwrap();
    s.add(&manifest("lib", "1.0", &["core"]), false).unwrap();
    s.add(&manifest("app", "1.0", &["lib"]), false).unwrap();
    s.add(&manifest("stray", "1.0", &[]), false).unwrap();

    for orphan in s.orphans().unwrap() {
        assert!(
            s.revdeps(&orphan.name).unwrap().is_empty(),
            "{orphan} reported as orphan but has dependents"
        );
    }

    // and conversely, the depended-upon packages are not reported
    let orphan_names: Vec<String> = s
        .orphans()
        .unwrap()
        .into_iter()
        .map(|o| o.name)
        .collect();
    assert!(!orphan_names.contains(&"core".to_string()));
    assert!(!orphan_names.contains(&"lib".to_string()));
}

#[test]
fn reindex_recovers_after_simulated_crash() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());
    s.add(&manifest("alpha", "1.0", &[]), false).unwrap();

    // crash between the manifest write and the index update: a manifest
    // lands on disk that the index has never seen
    let stray = manifest("beta", "2.0", &[]);
    fs::write(
        s.db_dir().join("beta-2.0.json"),
        serde_json::to_string_pretty(&stray).unwrap(),
    )
    .unwrap();
    assert_eq!(s.index().unwrap().len(), 1);

    let entries = s.reindex().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.name == "beta"));
}

#[test]
fn removal_of_missing_package_leaves_store_intact() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());
    s.add(&manifest("alpha", "1.0", &[]), false).unwrap();

    assert!(matches!(
        s.remove("ghost", false),
        Err(DbError::NotFound(_))
    ));
    assert_eq!(s.list(None).unwrap().len(), 1);
}

#[test]
fn dependency_satisfaction_via_provides() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());

    let mut provider = manifest("zlib-ng", "2.1", &[]);
    provider.provides = vec!["zlib".into()];
    s.add(&provider, false).unwrap();
    s.add(&manifest("libpng", "1.6", &["zlib"]), false).unwrap();

    // libpng's dependency on zlib is satisfied by zlib-ng's provides
    let satisfied = s
        .query("zlib-ng")
        .unwrap()
        .iter()
        .any(|m| m.satisfies("zlib"));
    assert!(satisfied);
}
