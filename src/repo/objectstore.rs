use std::error::Error;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use bytes::Bytes;
use futures::executor::block_on;
use futures::executor::block_on_stream;
use futures::future;
use futures::StreamExt;
use object_store::parse_url;
use object_store::path::Path;
use object_store::GetOptions;
use object_store::ObjectStore;
use url::Url;

use crate::id::Descriptor;
use crate::id::PackageName;
use crate::id::VersionName;
use crate::repo::archive;
use crate::repo::archive::Archive;
use crate::repo::archive::DecodeError;
use crate::repo::archive::EncodeError;
use crate::repo::archive::ValidationError;
use crate::repo::PackageList;
use crate::repo::PackageReader;
use crate::repo::PackageWriter;
use crate::repo::Repository;
use crate::repo::ResourceSink;
use crate::repo::StructuralError;
use crate::repo::WriteBuffer;
use crate::statement::PackageStatement;

/// Object name of the archive below `<prefix>/<package>/<version>/`.
pub const ARCHIVE_OBJECT: &str = "package.archive";

/// Repository backed by an [`object_store`] compatible storage backend.
///
/// All data is stored in an external service (e.g. S3, local filesystem) via
/// the `object_store` crate, one archive object per identity. A commit is a
/// single `put`, which object stores apply atomically.
#[derive(Clone)]
pub struct ObjectStoreRepo {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl fmt::Debug for ObjectStoreRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreRepo")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStoreRepo {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    /// Creates a repository pointing at the object store described by `url`.
    pub fn with_url(url: &Url) -> Result<Self, object_store::Error> {
        let (store, prefix) = parse_url(url)?;
        Ok(Self {
            store: Arc::from(store),
            prefix,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Deletes the archive object of the identity and returns whether there
    /// was one.
    pub fn remove(
        &self,
        package: &PackageName,
        version: &VersionName,
    ) -> Result<bool, object_store::Error> {
        let path = self.archive_path(package, version);
        match block_on(async { self.store.head(&path).await }) {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        match block_on(async { self.store.delete(&path).await }) {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        tracing::debug!(%package, %version, "removed package archive from object store");
        Ok(true)
    }

    fn archive_path(&self, package: &PackageName, version: &VersionName) -> Path {
        self.prefix
            .child(package.as_str())
            .child(version.as_str())
            .child(ARCHIVE_OBJECT)
    }
}

/// Maps a listed object location back to its identity. Objects that are not
/// archives are not ours and yield `None`.
fn descriptor_from(prefix: &Path, location: &Path) -> Option<Result<Descriptor, ObjectListError>> {
    if location.filename() != Some(ARCHIVE_OBJECT) {
        return None;
    }
    let entry = location.to_string();
    let Some(parts) = location.prefix_match(prefix) else {
        return Some(Err(StructuralError::Layout { entry }.into()));
    };
    let parts: Vec<String> = parts.map(|part| part.as_ref().to_owned()).collect();
    let Ok([package, version, _archive]) = <[String; 3]>::try_from(parts) else {
        return Some(Err(StructuralError::Layout { entry }.into()));
    };
    let package = match PackageName::new(package) {
        Ok(package) => package,
        Err(source) => return Some(Err(StructuralError::InvalidName { entry, source }.into())),
    };
    let version = match VersionName::new(version) {
        Ok(version) => version,
        Err(source) => return Some(Err(StructuralError::InvalidName { entry, source }.into())),
    };
    Some(Ok(Descriptor::new(package, version, None)))
}

impl Repository for ObjectStoreRepo {
    type ListError = ObjectListError;
    type Reader = ObjectStoreReader;
    type Writer = ObjectStoreWriter;

    fn list_packages(&self) -> PackageList<Self::ListError> {
        let prefix = self.prefix.clone();
        let stream = self
            .store
            .list(Some(&self.prefix))
            .filter_map(move |listed| {
                future::ready(match listed {
                    Ok(meta) => descriptor_from(&prefix, &meta.location),
                    Err(err) => Some(Err(ObjectListError::List(err))),
                })
            })
            .boxed();
        // The listing is drained here so it reflects the store at call time.
        let snapshot: Vec<_> = block_on_stream(stream).collect();
        PackageList::new(snapshot)
    }

    fn package_reader(&self, package: &PackageName, version: &VersionName) -> Self::Reader {
        ObjectStoreReader {
            store: self.store.clone(),
            path: self.archive_path(package, version),
            cached: Mutex::new(None),
        }
    }

    fn package_writer(&self, package: &PackageName, version: &VersionName) -> Self::Writer {
        ObjectStoreWriter {
            store: self.store.clone(),
            path: self.archive_path(package, version),
            package: package.clone(),
            version: version.clone(),
            buffer: WriteBuffer::new(),
        }
    }
}

#[derive(Debug)]
pub struct ObjectStoreReader {
    store: Arc<dyn ObjectStore>,
    path: Path,
    cached: Mutex<Option<(String, Arc<Archive>)>>,
}

impl ObjectStoreReader {
    /// Returns the current archive. The last decoded archive is kept with
    /// its e-tag and reused for as long as the store reports it unmodified.
    fn load(&self) -> Result<Option<Arc<Archive>>, ObjectReadError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let options = GetOptions {
            if_none_match: cached.as_ref().map(|(e_tag, _)| e_tag.clone()),
            ..GetOptions::default()
        };
        let object = match block_on(async { self.store.get_opts(&self.path, options).await }) {
            Ok(object) => object,
            Err(object_store::Error::NotModified { .. }) => {
                return Ok(cached.as_ref().map(|(_, archive)| archive.clone()));
            }
            Err(object_store::Error::NotFound { .. }) => {
                *cached = None;
                return Ok(None);
            }
            Err(e) => return Err(ObjectReadError::Store(e)),
        };
        let e_tag = object.meta.e_tag.clone();
        let bytes = block_on(object.bytes())?;
        let archive = Arc::new(Archive::decode(bytes)?);
        *cached = e_tag.map(|e_tag| (e_tag, archive.clone()));
        Ok(Some(archive))
    }
}

impl PackageReader for ObjectStoreReader {
    type ReadError = ObjectReadError;
    type Resource = Cursor<Bytes>;

    fn read_statements(&self) -> Result<Vec<PackageStatement>, Self::ReadError> {
        Ok(self
            .load()?
            .map(|archive| archive.statements().to_vec())
            .unwrap_or_default())
    }

    fn open_resource(&self, path: &str) -> Result<Option<Self::Resource>, Self::ReadError> {
        let Some(archive) = self.load()? else {
            return Ok(None);
        };
        Ok(archive.resource(path)?.map(Cursor::new))
    }

    fn resources(&self) -> Result<Vec<String>, Self::ReadError> {
        Ok(self
            .load()?
            .map(|archive| archive.resource_paths())
            .unwrap_or_default())
    }
}

#[derive(Debug)]
pub struct ObjectStoreWriter {
    store: Arc<dyn ObjectStore>,
    path: Path,
    package: PackageName,
    version: VersionName,
    buffer: WriteBuffer,
}

impl PackageWriter for ObjectStoreWriter {
    type CommitError = ObjectCommitError;

    fn write_statements(&mut self, statements: Vec<PackageStatement>) {
        self.buffer.write_statements(statements);
    }

    fn open_resource(&mut self, path: &str) -> Option<ResourceSink<'_>> {
        self.buffer.open_resource(path)
    }

    fn commit(&mut self) -> Result<(), Self::CommitError> {
        let encoded = archive::encode(self.buffer.statements(), self.buffer.resources())?;
        let len = encoded.len();
        block_on(async { self.store.put(&self.path, Bytes::from(encoded).into()).await })?;
        self.buffer.mark_committed();
        tracing::debug!(
            package = %self.package,
            version = %self.version,
            bytes = len,
            "committed package archive to object store"
        );
        Ok(())
    }

    fn close(mut self) {
        self.buffer.discard(&self.package, &self.version);
    }
}

impl Drop for ObjectStoreWriter {
    fn drop(&mut self) {
        self.buffer.discard(&self.package, &self.version);
    }
}

#[derive(Debug)]
pub enum ObjectListError {
    List(object_store::Error),
    Structure(StructuralError),
}

impl fmt::Display for ObjectListError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::List(e) => write!(f, "list failed: {e}"),
            Self::Structure(e) => write!(f, "list failed: {e}"),
        }
    }
}

impl Error for ObjectListError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::List(e) => Some(e),
            Self::Structure(e) => Some(e),
        }
    }
}

impl From<StructuralError> for ObjectListError {
    fn from(err: StructuralError) -> Self {
        Self::Structure(err)
    }
}

#[derive(Debug)]
pub enum ObjectReadError {
    Store(object_store::Error),
    Decode(DecodeError),
    Validation(ValidationError),
}

impl fmt::Display for ObjectReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "read failed: {e}"),
            Self::Decode(e) => write!(f, "read failed: {e}"),
            Self::Validation(e) => write!(f, "read failed: {e}"),
        }
    }
}

impl Error for ObjectReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Validation(e) => Some(e),
        }
    }
}

impl From<object_store::Error> for ObjectReadError {
    fn from(err: object_store::Error) -> Self {
        Self::Store(err)
    }
}

impl From<DecodeError> for ObjectReadError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<ValidationError> for ObjectReadError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

#[derive(Debug)]
pub enum ObjectCommitError {
    Store(object_store::Error),
    Encode(EncodeError),
}

impl fmt::Display for ObjectCommitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "commit failed: {e}"),
            Self::Encode(e) => write!(f, "commit failed: {e}"),
        }
    }
}

impl Error for ObjectCommitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Encode(e) => Some(e),
        }
    }
}

impl From<object_store::Error> for ObjectCommitError {
    fn from(err: object_store::Error) -> Self {
        Self::Store(err)
    }
}

impl From<EncodeError> for ObjectCommitError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err)
    }
}
