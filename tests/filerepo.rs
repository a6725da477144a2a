mod util;

use std::fs;

use pkgstore::prelude::*;
use pkgstore::repo::filerepo::FileCommitError;
use pkgstore::repo::filerepo::FileListError;
use pkgstore::repo::filerepo::FileRepo;
use pkgstore::repo::StructuralError;
use tempfile::tempdir;
use util::*;

#[test]
fn content_survives_reopening() {
    let dir = tempdir().unwrap();
    {
        let repo = FileRepo::open(dir.path()).unwrap();
        commit_with_resources(
            &repo,
            "alpha",
            "1.0",
            vec![decl("x", "1")],
            &[("lib/a.so", &b"elf"[..])],
        );
    }

    let reopened = FileRepo::open(dir.path()).unwrap();
    assert_eq!(read(&reopened, "alpha", "1.0"), vec![decl("x", "1")]);
    assert_eq!(
        read_resource(&reopened, "alpha", "1.0", "lib/a.so"),
        Some(b"elf".to_vec())
    );
    assert_eq!(listed(&reopened), vec![descriptor("alpha", "1.0")]);
}

#[test]
fn failed_commit_keeps_buffer_for_retry() {
    let dir = tempdir().unwrap();
    let repo = FileRepo::open(dir.path()).unwrap();

    // A plain file where the package directory belongs makes the commit fail.
    let blocker = dir.path().join("alpha");
    fs::write(&blocker, b"in the way").unwrap();

    let mut writer = repo.package_writer(&name("alpha"), &version("1.0"));
    writer.write_statements(vec![decl("x", "1")]);
    {
        use std::io::Write;
        writer
            .open_resource("data.bin")
            .unwrap()
            .write_all(b"payload")
            .unwrap();
    }
    assert!(matches!(writer.commit(), Err(FileCommitError::Io(_))));

    fs::remove_file(&blocker).unwrap();
    writer.commit().unwrap();
    writer.close();

    assert_eq!(read(&repo, "alpha", "1.0"), vec![decl("x", "1")]);
    assert_eq!(
        read_resource(&repo, "alpha", "1.0", "data.bin"),
        Some(b"payload".to_vec())
    );
}

#[test]
fn malformed_entries_are_reported_without_stopping_enumeration() {
    let dir = tempdir().unwrap();
    let repo = FileRepo::open(dir.path()).unwrap();
    commit(&repo, "alpha", "1.0", vec![decl("x", "1")]);
    commit(&repo, "beta", "2.0", vec![decl("y", "2")]);

    fs::write(dir.path().join("stray-file"), b"").unwrap();
    fs::create_dir_all(dir.path().join("has space").join("1.0")).unwrap();
    fs::write(dir.path().join("beta").join("notes.txt"), b"").unwrap();

    let mut descriptors = Vec::new();
    let mut problems = Vec::new();
    for item in repo.list_packages() {
        match item {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(FileListError::Structure(err)) => problems.push(err),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    descriptors.sort();

    assert_eq!(
        descriptors,
        vec![descriptor("alpha", "1.0"), descriptor("beta", "2.0")]
    );
    assert_eq!(problems.len(), 3);
    assert_eq!(
        problems
            .iter()
            .filter(|err| matches!(err, StructuralError::InvalidName { .. }))
            .count(),
        1
    );
}

#[test]
fn listing_a_removed_root_reports_an_error() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = FileRepo::open(&root).unwrap();
    fs::remove_dir(&root).unwrap();

    let listed: Vec<_> = repo.list_packages().collect();
    assert_eq!(listed.len(), 1);
    assert!(matches!(listed[0], Err(FileListError::Io(_))));
}

#[test]
fn two_handles_share_the_directory() {
    let dir = tempdir().unwrap();
    let first = FileRepo::open(dir.path()).unwrap();
    let second = FileRepo::open(dir.path()).unwrap();

    commit(&first, "alpha", "1.0", vec![decl("x", "1")]);
    assert_eq!(read(&second, "alpha", "1.0"), vec![decl("x", "1")]);
}
