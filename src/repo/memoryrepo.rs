use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use bytes::Bytes;

use crate::id::Descriptor;
use crate::id::PackageName;
use crate::id::VersionName;
use crate::repo::PackageContent;
use crate::repo::PackageList;
use crate::repo::PackageReader;
use crate::repo::PackageWriter;
use crate::repo::Repository;
use crate::repo::ResourceSink;
use crate::repo::WriteBuffer;
use crate::statement::PackageStatement;

type Identity = (PackageName, VersionName);
type Packages = HashMap<Identity, Arc<PackageContent>>;

/// Simple in-memory implementation of [`Repository`].
///
/// Useful for unit tests or ephemeral repositories where persistence is not
/// required. Every `MemoryRepo::new()` is an independent store; clones share
/// the store they were cloned from.
#[derive(Debug, Default, Clone)]
pub struct MemoryRepo {
    packages: Arc<RwLock<Packages>>,
}

// Stored content is only ever swapped as a whole `Arc`, so a panic while a
// lock was held cannot leave a torn entry behind and poisoning is ignored.
fn read(packages: &RwLock<Packages>) -> RwLockReadGuard<'_, Packages> {
    packages.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(packages: &RwLock<Packages>) -> RwLockWriteGuard<'_, Packages> {
    packages.write().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities currently stored.
    pub fn len(&self) -> usize {
        read(&self.packages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops whatever is stored for the identity and returns whether there
    /// was anything.
    pub fn remove(&self, package: &PackageName, version: &VersionName) -> bool {
        let removed = write(&self.packages)
            .remove(&(package.clone(), version.clone()))
            .is_some();
        if removed {
            tracing::debug!(%package, %version, "removed package from memory repository");
        }
        removed
    }
}

impl Repository for MemoryRepo {
    type ListError = Infallible;
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn list_packages(&self) -> PackageList<Self::ListError> {
        let snapshot: Vec<Identity> = read(&self.packages).keys().cloned().collect();
        PackageList::new(snapshot.into_iter().map(|identity| Ok(Descriptor::from(identity))))
    }

    fn package_reader(&self, package: &PackageName, version: &VersionName) -> Self::Reader {
        MemoryReader {
            packages: self.packages.clone(),
            identity: (package.clone(), version.clone()),
        }
    }

    fn package_writer(&self, package: &PackageName, version: &VersionName) -> Self::Writer {
        MemoryWriter {
            packages: self.packages.clone(),
            identity: (package.clone(), version.clone()),
            buffer: WriteBuffer::new(),
        }
    }
}

#[derive(Debug)]
pub struct MemoryReader {
    packages: Arc<RwLock<Packages>>,
    identity: Identity,
}

impl MemoryReader {
    fn current(&self) -> Option<Arc<PackageContent>> {
        read(&self.packages).get(&self.identity).cloned()
    }
}

impl PackageReader for MemoryReader {
    type ReadError = Infallible;
    type Resource = Cursor<Bytes>;

    fn read_statements(&self) -> Result<Vec<PackageStatement>, Self::ReadError> {
        Ok(self
            .current()
            .map(|content| content.statements.clone())
            .unwrap_or_default())
    }

    fn open_resource(&self, path: &str) -> Result<Option<Self::Resource>, Self::ReadError> {
        Ok(self
            .current()
            .and_then(|content| content.resources.get(path).cloned())
            .map(Cursor::new))
    }

    fn resources(&self) -> Result<Vec<String>, Self::ReadError> {
        Ok(self
            .current()
            .map(|content| content.resources.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug)]
pub struct MemoryWriter {
    packages: Arc<RwLock<Packages>>,
    identity: Identity,
    buffer: WriteBuffer,
}

impl PackageWriter for MemoryWriter {
    type CommitError = Infallible;

    fn write_statements(&mut self, statements: Vec<PackageStatement>) {
        self.buffer.write_statements(statements);
    }

    fn open_resource(&mut self, path: &str) -> Option<ResourceSink<'_>> {
        self.buffer.open_resource(path)
    }

    fn commit(&mut self) -> Result<(), Self::CommitError> {
        let content = Arc::new(self.buffer.to_content());
        write(&self.packages).insert(self.identity.clone(), content);
        self.buffer.mark_committed();
        tracing::debug!(
            package = %self.identity.0,
            version = %self.identity.1,
            "committed package to memory repository"
        );
        Ok(())
    }

    fn close(mut self) {
        self.buffer.discard(&self.identity.0, &self.identity.1);
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.buffer.discard(&self.identity.0, &self.identity.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::io::Write;

    fn identity(package: &str, version: &str) -> Identity {
        (
            PackageName::new(package).unwrap(),
            VersionName::new(version).unwrap(),
        )
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let a = MemoryRepo::new();
        let b = MemoryRepo::new();
        let (package, version) = identity("alpha", "1.0");

        let mut writer = a.package_writer(&package, &version);
        writer.write_statements(vec![PackageStatement::new("set", ["A=1"])]);
        writer.commit().unwrap();

        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert!(b
            .package_reader(&package, &version)
            .read_statements()
            .unwrap()
            .is_empty());

        let shared = a.clone();
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn resources_are_replaced_on_commit() {
        let repo = MemoryRepo::new();
        let (package, version) = identity("alpha", "1.0");

        let mut first = repo.package_writer(&package, &version);
        first.open_resource("a.txt").unwrap().write_all(b"a").unwrap();
        first.open_resource("b.txt").unwrap().write_all(b"b").unwrap();
        first.commit().unwrap();
        first.close();

        let mut second = repo.package_writer(&package, &version);
        second.open_resource("c.txt").unwrap().write_all(b"c").unwrap();
        second.commit().unwrap();
        second.close();

        let reader = repo.package_reader(&package, &version);
        assert_eq!(reader.resources().unwrap(), vec!["c.txt"]);
        assert!(reader.open_resource("a.txt").unwrap().is_none());
        let mut contents = String::new();
        reader
            .open_resource("c.txt")
            .unwrap()
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "c");
    }

    #[test]
    fn dropped_writer_publishes_nothing() {
        let repo = MemoryRepo::new();
        let (package, version) = identity("alpha", "1.0");
        {
            let mut writer = repo.package_writer(&package, &version);
            writer.write_statements(vec![PackageStatement::new("set", ["A=1"])]);
        }
        assert!(repo.is_empty());
    }
}
