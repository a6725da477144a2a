//! A repository stored in a directory tree on the local filesystem.
//!
//! Every identity owns one archive file (see [`archive`](super::archive)):
//!
//! ```text
//! <root>/<package>/<version>/package.archive
//! ```
//!
//! A commit writes the new archive to a temporary file next to the current
//! one and renames it into place, so readers observe either the previous or
//! the new archive and never a partial one. Readers memory-map the archive
//! they find; because archives are only ever replaced by rename and never
//! modified in place, an open mapping stays valid after a concurrent commit.
//!
//! Listing walks the whole tree when it is called, so it reports the
//! identities stored at that moment. Version directories without an archive,
//! e.g. left behind by a commit that failed before the rename, are not
//! listed. Entries starting with `.` are
//! ignored; any other entry that does not fit the layout is reported as a
//! [`StructuralError`].

use std::error::Error;
use std::fmt;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Cursor;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::SystemTime;

use bytes::Bytes;
use memmap2::Mmap;
use tempfile::NamedTempFile;
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

/// File name of the archive inside a version directory.
pub const ARCHIVE_FILE: &str = "package.archive";

#[derive(Debug, Clone)]
pub struct FileRepo {
    root: PathBuf,
}

impl FileRepo {
    /// Opens the repository rooted at `root`, creating the directory if
    /// needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, OpenError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Opens the repository described by a `file://` URL.
    pub fn with_url(url: &Url) -> Result<Self, OpenError> {
        if url.scheme() != "file" {
            return Err(OpenError::UnsupportedScheme(url.scheme().to_owned()));
        }
        let path = url
            .to_file_path()
            .map_err(|()| OpenError::InvalidPath(url.to_string()))?;
        Self::open(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, package: &PackageName, version: &VersionName) -> PathBuf {
        self.root.join(package.as_str()).join(version.as_str())
    }

    /// Deletes the archive stored for the identity and returns whether there
    /// was one. The version and package directories are removed too once
    /// they are empty.
    pub fn remove(&self, package: &PackageName, version: &VersionName) -> io::Result<bool> {
        let dir = self.version_dir(package, version);
        match fs::remove_file(dir.join(ARCHIVE_FILE)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        }
        remove_if_empty(&dir)?;
        remove_if_empty(&self.root.join(package.as_str()))?;
        tracing::debug!(%package, %version, "removed package archive");
        Ok(true)
    }
}

fn remove_if_empty(dir: &Path) -> io::Result<()> {
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::NotFound
            ) =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

impl Repository for FileRepo {
    type ListError = FileListError;
    type Reader = FileReader;
    type Writer = FileWriter;

    fn list_packages(&self) -> PackageList<Self::ListError> {
        let snapshot: Vec<_> = FileListing::new(&self.root).collect();
        PackageList::new(snapshot)
    }

    fn package_reader(&self, package: &PackageName, version: &VersionName) -> Self::Reader {
        FileReader {
            path: self.version_dir(package, version).join(ARCHIVE_FILE),
            cached: Mutex::new(None),
        }
    }

    fn package_writer(&self, package: &PackageName, version: &VersionName) -> Self::Writer {
        let dir = self.version_dir(package, version);
        FileWriter {
            path: dir.join(ARCHIVE_FILE),
            dir,
            package: package.clone(),
            version: version.clone(),
            buffer: WriteBuffer::new(),
        }
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.as_encoded_bytes().first() == Some(&b'.')
}

enum Step {
    Yield(Result<Descriptor, FileListError>),
    Skip,
    NextPackage,
}

/// Walks `<root>/<package>/<version>` one entry at a time.
struct FileListing {
    packages: Option<fs::ReadDir>,
    current: Option<(PackageName, fs::ReadDir)>,
    pending: Option<io::Error>,
}

impl FileListing {
    fn new(root: &Path) -> Self {
        match fs::read_dir(root) {
            Ok(packages) => Self {
                packages: Some(packages),
                current: None,
                pending: None,
            },
            Err(err) => Self {
                packages: None,
                current: None,
                pending: Some(err),
            },
        }
    }

    fn package_entry(&mut self, entry: fs::DirEntry) -> Step {
        let name = entry.file_name();
        if is_hidden(&name) {
            return Step::Skip;
        }
        let entry_name = name.to_string_lossy().into_owned();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {}
            Ok(_) => {
                return Step::Yield(Err(StructuralError::Layout { entry: entry_name }.into()));
            }
            Err(err) => return Step::Yield(Err(err.into())),
        }
        let package = match PackageName::new(entry_name.clone()) {
            Ok(package) => package,
            Err(source) => {
                return Step::Yield(Err(StructuralError::InvalidName {
                    entry: entry_name,
                    source,
                }
                .into()));
            }
        };
        match fs::read_dir(entry.path()) {
            Ok(versions) => {
                self.current = Some((package, versions));
                Step::Skip
            }
            Err(err) => Step::Yield(Err(err.into())),
        }
    }

    fn version_entry(package: &PackageName, entry: fs::DirEntry) -> Step {
        let name = entry.file_name();
        if is_hidden(&name) {
            return Step::Skip;
        }
        let entry_name = format!("{package}/{}", name.to_string_lossy());
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {}
            Ok(_) => {
                return Step::Yield(Err(StructuralError::Layout { entry: entry_name }.into()));
            }
            Err(err) => return Step::Yield(Err(err.into())),
        }
        let version = match name.to_str().map(VersionName::new) {
            Some(Ok(version)) => version,
            Some(Err(source)) => {
                return Step::Yield(Err(StructuralError::InvalidName {
                    entry: entry_name,
                    source,
                }
                .into()));
            }
            None => {
                return Step::Yield(Err(StructuralError::Layout { entry: entry_name }.into()));
            }
        };
        if !entry.path().join(ARCHIVE_FILE).is_file() {
            return Step::Skip;
        }
        Step::Yield(Ok(Descriptor::new(package.clone(), version, None)))
    }
}

impl Iterator for FileListing {
    type Item = Result<Descriptor, FileListError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending.take() {
            return Some(Err(err.into()));
        }
        loop {
            let step = if let Some((package, versions)) = &mut self.current {
                match versions.next() {
                    Some(Ok(entry)) => Self::version_entry(package, entry),
                    Some(Err(err)) => Step::Yield(Err(err.into())),
                    None => Step::NextPackage,
                }
            } else {
                match self.packages.as_mut()?.next()? {
                    Ok(entry) => self.package_entry(entry),
                    Err(err) => Step::Yield(Err(err.into())),
                }
            };
            match step {
                Step::Yield(item) => return Some(item),
                Step::Skip => {}
                Step::NextPackage => self.current = None,
            }
        }
    }
}

/// Identifies one archive file on disk.
///
/// Commits rename a fresh file into place, so on unix every commit changes
/// the inode. A cached archive keeps its mapping, and with it its inode,
/// alive, so the inode cannot be handed to a newer archive while cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    node: (u64, u64),
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(meta: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let node = {
            use std::os::unix::fs::MetadataExt;
            (meta.dev(), meta.ino())
        };
        #[cfg(not(unix))]
        let node = (0, 0);
        Self {
            node,
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

#[derive(Debug)]
pub struct FileReader {
    path: PathBuf,
    cached: Mutex<Option<(FileStamp, Arc<Archive>)>>,
}

impl FileReader {
    /// Returns the current archive, reusing the last decoded one while the
    /// file on disk is unchanged.
    fn load(&self) -> Result<Option<Arc<Archive>>, FileReadError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                *cached = None;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let meta = file.metadata()?;
        let stamp = FileStamp::of(&meta);
        if let Some((seen, archive)) = cached.as_ref() {
            if *seen == stamp {
                return Ok(Some(archive.clone()));
            }
        }
        if meta.len() == 0 {
            return Err(DecodeError::Truncated.into());
        }
        // Safety: archives are replaced by rename and never written in place,
        // so the mapped file does not change underneath us.
        let mmap = unsafe { Mmap::map(&file)? };
        let archive = Arc::new(Archive::decode(Bytes::from_owner(mmap))?);
        *cached = Some((stamp, archive.clone()));
        Ok(Some(archive))
    }
}

impl PackageReader for FileReader {
    type ReadError = FileReadError;
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
pub struct FileWriter {
    dir: PathBuf,
    path: PathBuf,
    package: PackageName,
    version: VersionName,
    buffer: WriteBuffer,
}

impl PackageWriter for FileWriter {
    type CommitError = FileCommitError;

    fn write_statements(&mut self, statements: Vec<PackageStatement>) {
        self.buffer.write_statements(statements);
    }

    fn open_resource(&mut self, path: &str) -> Option<ResourceSink<'_>> {
        self.buffer.open_resource(path)
    }

    fn commit(&mut self) -> Result<(), Self::CommitError> {
        let encoded = archive::encode(self.buffer.statements(), self.buffer.resources())?;
        fs::create_dir_all(&self.dir)?;
        let mut staged = NamedTempFile::new_in(&self.dir)?;
        staged.write_all(&encoded)?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|err| err.error)?;
        self.buffer.mark_committed();
        tracing::debug!(
            package = %self.package,
            version = %self.version,
            bytes = encoded.len(),
            "committed package archive"
        );
        Ok(())
    }

    fn close(mut self) {
        self.buffer.discard(&self.package, &self.version);
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.buffer.discard(&self.package, &self.version);
    }
}

#[derive(Debug)]
pub enum OpenError {
    Io(io::Error),
    UnsupportedScheme(String),
    InvalidPath(String),
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to open repository: {e}"),
            Self::UnsupportedScheme(scheme) => {
                write!(f, "failed to open repository: unsupported scheme {scheme:?}")
            }
            Self::InvalidPath(url) => {
                write!(f, "failed to open repository: {url} is not a local path")
            }
        }
    }
}

impl Error for OpenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OpenError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[derive(Debug)]
pub enum FileListError {
    Io(io::Error),
    Structure(StructuralError),
}

impl fmt::Display for FileListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "list failed: {e}"),
            Self::Structure(e) => write!(f, "list failed: {e}"),
        }
    }
}

impl Error for FileListError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Structure(e) => Some(e),
        }
    }
}

impl From<io::Error> for FileListError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<StructuralError> for FileListError {
    fn from(err: StructuralError) -> Self {
        Self::Structure(err)
    }
}

#[derive(Debug)]
pub enum FileReadError {
    Io(io::Error),
    Decode(DecodeError),
    Validation(ValidationError),
}

impl fmt::Display for FileReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "read failed: {e}"),
            Self::Decode(e) => write!(f, "read failed: {e}"),
            Self::Validation(e) => write!(f, "read failed: {e}"),
        }
    }
}

impl Error for FileReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Validation(e) => Some(e),
        }
    }
}

impl From<io::Error> for FileReadError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DecodeError> for FileReadError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<ValidationError> for FileReadError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

#[derive(Debug)]
pub enum FileCommitError {
    Io(io::Error),
    Encode(EncodeError),
}

impl fmt::Display for FileCommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "commit failed: {e}"),
            Self::Encode(e) => write!(f, "commit failed: {e}"),
        }
    }
}

impl Error for FileCommitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
        }
    }
}

impl From<io::Error> for FileCommitError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<EncodeError> for FileCommitError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err)
    }
}
