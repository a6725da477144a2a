//! This module defines the storage contract for package repositories and
//! the backends that implement it.
//!
//! A repository maps an identity, the pair of a [`PackageName`] and a
//! [`VersionName`], to the content of that package version: an ordered
//! sequence of [`PackageStatement`]s and a set of named binary resources.
//! All access goes through short-lived sessions bound to one identity:
//!
//! - a [`PackageReader`] sees whatever is stored for its identity at the
//!   time of each call; an identity that was never written reads as empty.
//! - a [`PackageWriter`] buffers statements and resources privately. Nothing
//!   it does is visible to anyone until [`PackageWriter::commit`], which
//!   replaces the stored content of the identity in full. Closing or dropping
//!   a writer without committing discards the buffer.
//!
//! Enumeration through [`Repository::list_packages`] hands descriptors from a
//! background producer to the caller through a bounded channel. Dropping the
//! returned [`PackageList`] stops and joins the producer.
//!
//! Three backends are provided:
//!
//! - [`memoryrepo::MemoryRepo`] keeps everything in memory and is useful for
//!   tests and ephemeral repositories.
//! - [`filerepo::FileRepo`] stores one archive file per identity in a
//!   directory tree.
//! - [`objectstore::ObjectStoreRepo`] stores one archive object per identity
//!   in any [`object_store`] service.
//!
//! Two writers committing to the same identity race; the last successful
//! commit wins and nothing is merged.
//!
//! ## Basic usage
//!
//! ```rust
//! use pkgstore::prelude::*;
//! use pkgstore::repo::memoryrepo::MemoryRepo;
//!
//! let repo = MemoryRepo::new();
//! let name = PackageName::new("alpha").unwrap();
//! let version = VersionName::new("1.0").unwrap();
//!
//! let mut writer = repo.package_writer(&name, &version);
//! writer.write_statements(vec![PackageStatement::new("set", ["X=1"])]);
//! writer.commit().unwrap();
//! writer.close();
//!
//! let reader = repo.package_reader(&name, &version);
//! assert_eq!(reader.read_statements().unwrap().len(), 1);
//! ```
pub mod archive;
pub mod filerepo;
pub mod memoryrepo;
pub mod objectstore;

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::Receiver;

use crate::id::Descriptor;
use crate::id::NameError;
use crate::id::PackageName;
use crate::id::VersionName;
use crate::statement::PackageStatement;

/// Default number of descriptors buffered between a list producer and its
/// consumer.
pub const LIST_CAPACITY: usize = 100;

/// A registry of package versions.
pub trait Repository {
    /// Error yielded for a single entry that could not be listed.
    type ListError: Error + Send + 'static;
    type Reader: PackageReader;
    type Writer: PackageWriter;

    /// Lists every identity currently stored, in no particular order.
    ///
    /// Each call scans the current state again. A failing entry is yielded
    /// as an `Err` item and does not end the enumeration.
    fn list_packages(&self) -> PackageList<Self::ListError>;

    /// Opens a reader for the identity. Never fails and does not check that
    /// the identity exists.
    fn package_reader(&self, package: &PackageName, version: &VersionName) -> Self::Reader;

    /// Opens a writer for the identity with an empty buffer.
    fn package_writer(&self, package: &PackageName, version: &VersionName) -> Self::Writer;
}

/// Read-only session bound to one identity.
pub trait PackageReader {
    type ReadError: Error;
    type Resource: Read;

    /// Returns the statements stored for the identity, or an empty sequence
    /// if nothing was ever committed.
    fn read_statements(&self) -> Result<Vec<PackageStatement>, Self::ReadError>;

    /// Opens the resource stored under `path`, `Ok(None)` if there is none.
    fn open_resource(&self, path: &str) -> Result<Option<Self::Resource>, Self::ReadError>;

    /// Paths of all resources stored for the identity, sorted.
    fn resources(&self) -> Result<Vec<String>, Self::ReadError>;

    /// Releases the session. Has no effect on the repository.
    fn close(self)
    where
        Self: Sized,
    {
    }
}

/// Buffered, transactional session bound to one identity.
pub trait PackageWriter {
    type CommitError: Error;

    /// Replaces the buffered statements.
    fn write_statements(&mut self, statements: Vec<PackageStatement>);

    /// Opens a sink for the resource at `path`, truncating anything buffered
    /// there before. Returns `None` if `path` is not a valid resource path.
    fn open_resource(&mut self, path: &str) -> Option<ResourceSink<'_>>;

    /// Publishes the buffered content, replacing whatever the identity held.
    ///
    /// On failure the buffer is untouched and the commit can be retried.
    fn commit(&mut self) -> Result<(), Self::CommitError>;

    /// Releases the writer, discarding anything not committed.
    fn close(self)
    where
        Self: Sized;
}

/// Content of one package version as stored by a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageContent {
    pub statements: Vec<PackageStatement>,
    pub resources: BTreeMap<String, Bytes>,
}

/// Checks that `path` is a relative, normalized, `/`-separated path.
pub fn is_valid_resource_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Pending state of a writer.
///
/// Backends embed one of these in their writer and publish its contents on
/// commit. The buffer tracks whether it holds changes that were not
/// committed yet so that discarding them can be reported.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    statements: Vec<PackageStatement>,
    resources: BTreeMap<String, Vec<u8>>,
    dirty: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_statements(&mut self, statements: Vec<PackageStatement>) {
        self.statements = statements;
        self.dirty = true;
    }

    pub fn open_resource(&mut self, path: &str) -> Option<ResourceSink<'_>> {
        if !is_valid_resource_path(path) {
            tracing::debug!(path, "rejected invalid resource path");
            return None;
        }
        self.dirty = true;
        let buffer = self.resources.entry(path.to_owned()).or_default();
        buffer.clear();
        Some(ResourceSink { buffer })
    }

    pub fn statements(&self) -> &[PackageStatement] {
        &self.statements
    }

    pub fn resources(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.resources
            .iter()
            .map(|(path, bytes)| (path.as_str(), bytes.as_slice()))
    }

    /// Whether the buffer holds changes that have not been committed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copies the buffer into a [`PackageContent`].
    pub fn to_content(&self) -> PackageContent {
        PackageContent {
            statements: self.statements.clone(),
            resources: self
                .resources
                .iter()
                .map(|(path, bytes)| (path.clone(), Bytes::copy_from_slice(bytes)))
                .collect(),
        }
    }

    /// Marks the current contents as published.
    pub fn mark_committed(&mut self) {
        self.dirty = false;
    }

    /// Drops the buffered contents, warning if they were never committed.
    pub fn discard(&mut self, package: &PackageName, version: &VersionName) {
        if self.dirty {
            tracing::warn!(
                package = %package,
                version = %version,
                statements = self.statements.len(),
                resources = self.resources.len(),
                "discarding uncommitted package writer changes"
            );
        }
        self.statements = Vec::new();
        self.resources = BTreeMap::new();
        self.dirty = false;
    }
}

/// Byte sink for a resource buffered in a writer.
#[derive(Debug)]
pub struct ResourceSink<'a> {
    buffer: &'a mut Vec<u8>,
}

impl Write for ResourceSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A stored entry whose location cannot be decomposed into a package and a
/// version.
#[derive(Debug)]
pub enum StructuralError {
    InvalidName { entry: String, source: NameError },
    Layout { entry: String },
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName { entry, source } => {
                write!(f, "malformed repository entry {entry:?}: {source}")
            }
            Self::Layout { entry } => {
                write!(f, "repository entry {entry:?} is not a package/version pair")
            }
        }
    }
}

impl Error for StructuralError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidName { source, .. } => Some(source),
            Self::Layout { .. } => None,
        }
    }
}

type BoxedListIter<E> = Box<dyn Iterator<Item = Result<Descriptor, E>> + Send>;

enum ListSource<E> {
    Channel {
        receiver: Option<Receiver<Result<Descriptor, E>>>,
        producer: Option<JoinHandle<()>>,
    },
    Inline(BoxedListIter<E>),
}

/// Lazy enumeration of stored identities.
///
/// A producer thread drains the backend's listing into a bounded channel,
/// so it never runs further ahead of the consumer than the channel
/// capacity. Dropping the list disconnects the channel, which makes the
/// producer stop at its next hand-off, and then joins the producer.
pub struct PackageList<E> {
    source: ListSource<E>,
}

impl<E> fmt::Debug for PackageList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.source {
            ListSource::Channel { .. } => "channel",
            ListSource::Inline(_) => "inline",
        };
        f.debug_struct("PackageList").field("mode", &mode).finish()
    }
}

impl<E> PackageList<E>
where
    E: Send + 'static,
{
    /// Spawns a producer for `source` with [`LIST_CAPACITY`] buffered items.
    pub fn new<I>(source: I) -> Self
    where
        I: IntoIterator<Item = Result<Descriptor, E>>,
        I::IntoIter: Send + 'static,
    {
        Self::with_capacity(LIST_CAPACITY, source)
    }

    /// Spawns a producer for `source` buffering at most `capacity` items.
    ///
    /// A capacity of zero makes every hand-off a rendezvous.
    pub fn with_capacity<I>(capacity: usize, source: I) -> Self
    where
        I: IntoIterator<Item = Result<Descriptor, E>>,
        I::IntoIter: Send + 'static,
    {
        let iter: BoxedListIter<E> = Box::new(source.into_iter());
        // The producer takes the iterator out of this slot when it starts,
        // so it can be recovered if the thread never does.
        let slot = Arc::new(Mutex::new(Some(iter)));
        let (sender, receiver) = crossbeam_channel::bounded(capacity);

        let producer_slot = slot.clone();
        let spawned = std::thread::Builder::new()
            .name("package-list".into())
            .spawn(move || {
                let taken = producer_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                let Some(iter) = taken else {
                    return;
                };
                tracing::debug!("package list producer started");
                for item in iter {
                    if sender.send(item).is_err() {
                        tracing::debug!("package list abandoned by consumer");
                        return;
                    }
                }
                tracing::debug!("package list producer finished");
            });

        match spawned {
            Ok(producer) => Self {
                source: ListSource::Channel {
                    receiver: Some(receiver),
                    producer: Some(producer),
                },
            },
            Err(err) => {
                tracing::warn!(error = %err, "could not spawn package list producer, listing inline");
                let iter = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                Self {
                    source: ListSource::Inline(iter.unwrap_or_else(|| Box::new(std::iter::empty()))),
                }
            }
        }
    }
}

impl<E> Iterator for PackageList<E> {
    type Item = Result<Descriptor, E>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            ListSource::Channel { receiver, .. } => receiver.as_ref()?.recv().ok(),
            ListSource::Inline(iter) => iter.next(),
        }
    }
}

impl<E> Drop for PackageList<E> {
    fn drop(&mut self) {
        if let ListSource::Channel { receiver, producer } = &mut self.source {
            drop(receiver.take());
            if let Some(producer) = producer.take() {
                if producer.join().is_err() {
                    tracing::warn!("package list producer panicked");
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum TransferError<ListErr, LoadErr, StoreErr> {
    List(ListErr),
    Load(LoadErr),
    Copy(io::Error),
    /// The target refused a resource path the source stores.
    InvalidPath(String),
    Store(StoreErr),
}

impl<ListErr, LoadErr, StoreErr> fmt::Display for TransferError<ListErr, LoadErr, StoreErr>
where
    ListErr: fmt::Display,
    LoadErr: fmt::Display,
    StoreErr: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(e) => write!(f, "failed to transfer package: list failed: {e}"),
            Self::Load(e) => write!(f, "failed to transfer package: load failed: {e}"),
            Self::Copy(e) => write!(f, "failed to transfer package: copy failed: {e}"),
            Self::InvalidPath(path) => {
                write!(f, "failed to transfer package: invalid resource path {path:?}")
            }
            Self::Store(e) => write!(f, "failed to transfer package: store failed: {e}"),
        }
    }
}

impl<ListErr, LoadErr, StoreErr> Error for TransferError<ListErr, LoadErr, StoreErr>
where
    ListErr: Error + 'static,
    LoadErr: Error + 'static,
    StoreErr: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::List(e) => Some(e),
            Self::Load(e) => Some(e),
            Self::Copy(e) => Some(e),
            Self::InvalidPath(_) => None,
            Self::Store(e) => Some(e),
        }
    }
}

/// Error type of [`transfer`] for a given source and target.
pub type TransferErrorFor<S, T> = TransferError<
    <S as Repository>::ListError,
    <<S as Repository>::Reader as PackageReader>::ReadError,
    <<T as Repository>::Writer as PackageWriter>::CommitError,
>;

/// Copies every package version listed by `source` into `target`.
///
/// Each identity is copied with its statements and all of its resources and
/// committed with its own writer, so a failure affects only that identity.
/// The returned iterator yields one result per listed entry; copying happens
/// as it is advanced.
pub fn transfer<'a, S, T>(
    source: &'a S,
    target: &'a T,
) -> impl Iterator<Item = Result<Descriptor, TransferErrorFor<S, T>>> + 'a
where
    S: Repository,
    T: Repository,
{
    source.list_packages().map(move |listed| -> Result<_, TransferErrorFor<S, T>> {
        let descriptor = listed.map_err(TransferError::List)?;
        copy_package(source, target, &descriptor)?;
        Ok(descriptor)
    })
}

fn copy_package<S, T>(
    source: &S,
    target: &T,
    descriptor: &Descriptor,
) -> Result<(), TransferErrorFor<S, T>>
where
    S: Repository,
    T: Repository,
{
    let (package, version) = descriptor.identity();
    let reader = source.package_reader(package, version);
    let mut writer = target.package_writer(package, version);

    writer.write_statements(reader.read_statements().map_err(TransferError::Load)?);
    for path in reader.resources().map_err(TransferError::Load)? {
        let Some(mut resource) = reader.open_resource(&path).map_err(TransferError::Load)? else {
            // Removed by a concurrent commit since the listing.
            continue;
        };
        let mut bytes = Vec::new();
        resource
            .read_to_end(&mut bytes)
            .map_err(TransferError::Copy)?;
        let Some(mut sink) = writer.open_resource(&path) else {
            return Err(TransferError::InvalidPath(path));
        };
        sink.write_all(&bytes).map_err(TransferError::Copy)?;
    }
    writer.commit().map_err(TransferError::Store)?;
    tracing::debug!(%descriptor, "transferred package");
    writer.close();
    reader.close();
    Ok(())
}
