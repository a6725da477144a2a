mod util;

use pkgstore::prelude::*;
use pkgstore::repo::filerepo::FileRepo;
use pkgstore::repo::memoryrepo::MemoryRepo;
use pkgstore::repo::objectstore::ObjectStoreRepo;
use url::Url;
use util::*;

fn removed_identity_reads_as_absent<R, F>(repo: &R, remove: F)
where
    R: Repository,
    F: Fn(&R, &PackageName, &VersionName) -> bool,
{
    commit_with_resources(
        repo,
        "alpha",
        "1.0",
        vec![decl("x", "1")],
        &[("lib/a.so", &b"elf"[..])],
    );
    commit(repo, "alpha", "2.0", vec![decl("x", "2")]);
    let reader = repo.package_reader(&name("alpha"), &version("1.0"));
    assert_eq!(reader.read_statements().unwrap(), vec![decl("x", "1")]);

    assert!(remove(repo, &name("alpha"), &version("1.0")));

    assert_eq!(listed(repo), vec![descriptor("alpha", "2.0")]);
    assert!(read(repo, "alpha", "1.0").is_empty());
    assert_eq!(read_resource(repo, "alpha", "1.0", "lib/a.so"), None);
    // A reader opened before the removal sees it as well.
    assert!(reader.read_statements().unwrap().is_empty());
    assert!(reader.resources().unwrap().is_empty());
    assert_eq!(read(repo, "alpha", "2.0"), vec![decl("x", "2")]);

    assert!(!remove(repo, &name("alpha"), &version("1.0")));
    assert!(!remove(repo, &name("ghost"), &version("0.1")));

    // The identity can be written again afterwards.
    commit(repo, "alpha", "1.0", vec![decl("x", "again")]);
    assert_eq!(read(repo, "alpha", "1.0"), vec![decl("x", "again")]);
}

#[test]
fn memory_remove() {
    removed_identity_reads_as_absent(&MemoryRepo::new(), |repo, package, version| {
        repo.remove(package, version)
    });
}

#[test]
fn file_remove() {
    let dir = tempfile::tempdir().unwrap();
    removed_identity_reads_as_absent(
        &FileRepo::open(dir.path()).unwrap(),
        |repo, package, version| repo.remove(package, version).unwrap(),
    );
}

#[test]
fn objectstore_remove() {
    let url = Url::parse("memory:///packages").unwrap();
    removed_identity_reads_as_absent(
        &ObjectStoreRepo::with_url(&url).unwrap(),
        |repo, package, version| repo.remove(package, version).unwrap(),
    );
}
