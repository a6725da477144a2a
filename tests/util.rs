#![allow(dead_code)]

use std::fmt::Debug;
use std::io::Read;
use std::io::Write;

use pkgstore::prelude::*;

pub fn name(package: &str) -> PackageName {
    PackageName::new(package).unwrap()
}

pub fn version(version: &str) -> VersionName {
    VersionName::new(version).unwrap()
}

pub fn decl(key: &str, value: &str) -> PackageStatement {
    PackageStatement::new("decl", [key, value])
}

pub fn commit<R>(repo: &R, package: &str, ver: &str, statements: Vec<PackageStatement>)
where
    R: Repository,
{
    let mut writer = repo.package_writer(&name(package), &version(ver));
    writer.write_statements(statements);
    writer.commit().unwrap();
    writer.close();
}

pub fn commit_with_resources<R>(
    repo: &R,
    package: &str,
    ver: &str,
    statements: Vec<PackageStatement>,
    resources: &[(&str, &[u8])],
) where
    R: Repository,
{
    let mut writer = repo.package_writer(&name(package), &version(ver));
    writer.write_statements(statements);
    for (path, bytes) in resources {
        writer.open_resource(path).unwrap().write_all(bytes).unwrap();
    }
    writer.commit().unwrap();
    writer.close();
}

pub fn read<R>(repo: &R, package: &str, ver: &str) -> Vec<PackageStatement>
where
    R: Repository,
{
    let reader = repo.package_reader(&name(package), &version(ver));
    let statements = reader.read_statements().unwrap();
    reader.close();
    statements
}

pub fn read_resource<R>(repo: &R, package: &str, ver: &str, path: &str) -> Option<Vec<u8>>
where
    R: Repository,
{
    let reader = repo.package_reader(&name(package), &version(ver));
    let mut resource = reader.open_resource(path).unwrap()?;
    let mut bytes = Vec::new();
    resource.read_to_end(&mut bytes).unwrap();
    Some(bytes)
}

pub fn listed<R>(repo: &R) -> Vec<Descriptor>
where
    R: Repository,
    R::ListError: Debug,
{
    let mut descriptors: Vec<_> = repo.list_packages().map(Result::unwrap).collect();
    descriptors.sort();
    descriptors
}

pub fn descriptor(package: &str, ver: &str) -> Descriptor {
    Descriptor::new(name(package), version(ver), None)
}
