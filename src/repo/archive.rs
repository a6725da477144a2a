//! Single-blob encoding of one package version.
//!
//! Backends that persist packages to a medium store each identity as one
//! archive so that publishing it is a single atomic replace. An archive is
//! laid out as
//!
//! ```text
//! +----------------+------------------+---------------------------+
//! | ArchiveHeader  | manifest (JSON)  | resource bytes ...        |
//! | 24 bytes       | manifest_len     |                           |
//! +----------------+------------------+---------------------------+
//! ```
//!
//! The manifest lists the statements in order and, for every resource, its
//! path together with the offset, length and blake3 hash of its bytes
//! relative to the start of the resource section. Resource bytes are checked
//! against their hash when they are opened.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Bytes;
use hex_literal::hex;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::repo::is_valid_resource_path;
use crate::statement::PackageStatement;

const MAGIC_MARKER: [u8; 16] = hex!("6F1C2A94D0E35B7788A1F4C2093E6DB5");

const HEADER_LEN: usize = std::mem::size_of::<ArchiveHeader>();

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone)]
#[repr(C)]
struct ArchiveHeader {
    magic_marker: [u8; 16],
    manifest_len: [u8; 8],
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    statements: Vec<PackageStatement>,
    resources: Vec<ResourceEntry>,
}

#[derive(Serialize, Deserialize)]
struct ResourceEntry {
    path: String,
    offset: u64,
    len: u64,
    hash: String,
}

#[derive(Debug, Clone, Copy)]
enum ValidationState {
    Validated,
    Invalid,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    range: Range<usize>,
    hash: blake3::Hash,
    state: Arc<OnceLock<ValidationState>>,
}

/// Encodes statements and resources into archive bytes.
pub fn encode<'a, R>(statements: &[PackageStatement], resources: R) -> Result<Vec<u8>, EncodeError>
where
    R: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut entries = Vec::new();
    let mut body = Vec::new();
    for (path, bytes) in resources {
        if !is_valid_resource_path(path) {
            return Err(EncodeError::InvalidPath {
                path: path.to_owned(),
            });
        }
        entries.push(ResourceEntry {
            path: path.to_owned(),
            offset: body.len() as u64,
            len: bytes.len() as u64,
            hash: blake3::hash(bytes).to_hex().to_string(),
        });
        body.extend_from_slice(bytes);
    }

    #[derive(Serialize)]
    struct ManifestRef<'m> {
        statements: &'m [PackageStatement],
        resources: &'m [ResourceEntry],
    }
    let manifest = serde_json::to_vec(&ManifestRef {
        statements,
        resources: &entries,
    })
    .map_err(EncodeError::Manifest)?;

    let header = ArchiveHeader {
        magic_marker: MAGIC_MARKER,
        manifest_len: (manifest.len() as u64).to_le_bytes(),
    };
    let mut out = Vec::with_capacity(HEADER_LEN + manifest.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&manifest);
    out.extend_from_slice(&body);
    Ok(out)
}

/// A decoded archive.
///
/// Holds on to the archive bytes; resources are returned as slices of them.
#[derive(Debug, Clone)]
pub struct Archive {
    statements: Vec<PackageStatement>,
    resources: BTreeMap<String, IndexEntry>,
    bytes: Bytes,
}

impl Archive {
    pub fn decode(bytes: Bytes) -> Result<Self, DecodeError> {
        let (header, rest) =
            ArchiveHeader::read_from_prefix(&bytes).map_err(|_| DecodeError::Truncated)?;
        if header.magic_marker != MAGIC_MARKER {
            return Err(DecodeError::BadMagic);
        }
        let manifest_len = usize::try_from(u64::from_le_bytes(header.manifest_len))
            .map_err(|_| DecodeError::Truncated)?;
        if manifest_len > rest.len() {
            return Err(DecodeError::Truncated);
        }
        let manifest: Manifest =
            serde_json::from_slice(&rest[..manifest_len]).map_err(DecodeError::Manifest)?;

        let body_start = HEADER_LEN + manifest_len;
        let body_len = bytes.len() - body_start;
        let mut resources = BTreeMap::new();
        for entry in manifest.resources {
            if !is_valid_resource_path(&entry.path) {
                return Err(DecodeError::InvalidPath { path: entry.path });
            }
            let start = usize::try_from(entry.offset).map_err(|_| DecodeError::OutOfBounds {
                path: entry.path.clone(),
            })?;
            let len = usize::try_from(entry.len).map_err(|_| DecodeError::OutOfBounds {
                path: entry.path.clone(),
            })?;
            let end = start.checked_add(len).filter(|end| *end <= body_len).ok_or_else(|| {
                DecodeError::OutOfBounds {
                    path: entry.path.clone(),
                }
            })?;
            let hash = blake3::Hash::from_hex(&entry.hash).map_err(|_| DecodeError::BadHash {
                path: entry.path.clone(),
            })?;
            resources.insert(
                entry.path,
                IndexEntry {
                    range: body_start + start..body_start + end,
                    hash,
                    state: Arc::new(OnceLock::new()),
                },
            );
        }

        Ok(Self {
            statements: manifest.statements,
            resources,
            bytes,
        })
    }

    pub fn statements(&self) -> &[PackageStatement] {
        &self.statements
    }

    pub fn resource_paths(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    /// Returns the bytes of the resource at `path`, validating them against
    /// the recorded hash on first access.
    pub fn resource(&self, path: &str) -> Result<Option<Bytes>, ValidationError> {
        let Some(entry) = self.resources.get(path) else {
            return Ok(None);
        };
        let bytes = self.bytes.slice(entry.range.clone());
        let state = entry.state.get_or_init(|| {
            if blake3::hash(&bytes) == entry.hash {
                ValidationState::Validated
            } else {
                ValidationState::Invalid
            }
        });
        match state {
            ValidationState::Validated => Ok(Some(bytes)),
            ValidationState::Invalid => Err(ValidationError {
                path: path.to_owned(),
            }),
        }
    }
}

#[derive(Debug)]
pub enum EncodeError {
    Manifest(serde_json::Error),
    InvalidPath { path: String },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manifest(e) => write!(f, "failed to encode archive manifest: {e}"),
            Self::InvalidPath { path } => {
                write!(f, "cannot archive resource with invalid path {path:?}")
            }
        }
    }
}

impl Error for EncodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Manifest(e) => Some(e),
            Self::InvalidPath { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum DecodeError {
    Truncated,
    BadMagic,
    Manifest(serde_json::Error),
    OutOfBounds { path: String },
    BadHash { path: String },
    InvalidPath { path: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "archive is truncated"),
            Self::BadMagic => write!(f, "not a package archive"),
            Self::Manifest(e) => write!(f, "malformed archive manifest: {e}"),
            Self::OutOfBounds { path } => {
                write!(f, "resource {path:?} lies outside the archive")
            }
            Self::BadHash { path } => write!(f, "resource {path:?} has a malformed hash"),
            Self::InvalidPath { path } => write!(f, "resource path {path:?} is not valid"),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Manifest(e) => Some(e),
            _ => None,
        }
    }
}

/// Resource bytes did not match their recorded hash.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource {:?} failed hash validation", self.path)
    }
}

impl Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements() -> Vec<PackageStatement> {
        vec![
            PackageStatement::new("resource", ["lib/a.so"]),
            PackageStatement::new("set", ["A=1"]),
            PackageStatement::new("set", ["A=1"]),
        ]
    }

    #[test]
    fn decode_preserves_statements_and_resources() {
        let encoded = encode(
            &statements(),
            [("lib/a.so", &b"elf"[..]), ("empty", &b""[..])],
        )
        .unwrap();
        let archive = Archive::decode(Bytes::from(encoded)).unwrap();
        assert_eq!(archive.statements(), &statements()[..]);
        assert_eq!(archive.resource_paths(), vec!["empty", "lib/a.so"]);
        assert_eq!(
            archive.resource("lib/a.so").unwrap(),
            Some(Bytes::from_static(b"elf"))
        );
        assert_eq!(archive.resource("empty").unwrap(), Some(Bytes::new()));
        assert_eq!(archive.resource("missing").unwrap(), None);
    }

    #[test]
    fn rejects_foreign_bytes() {
        assert!(matches!(
            Archive::decode(Bytes::from_static(b"short")),
            Err(DecodeError::Truncated)
        ));
        let mut encoded = encode(&statements(), Vec::<(&str, &[u8])>::new()).unwrap();
        encoded[0] ^= 0xFF;
        assert!(matches!(
            Archive::decode(Bytes::from(encoded)),
            Err(DecodeError::BadMagic)
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let mut encoded = encode(&[], [("blob", &b"0123456789"[..])]).unwrap();
        encoded.truncate(encoded.len() - 3);
        assert!(matches!(
            Archive::decode(Bytes::from(encoded)),
            Err(DecodeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn detects_corrupted_resource() {
        let mut encoded = encode(&[], [("blob", &b"0123456789"[..])]).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        let archive = Archive::decode(Bytes::from(encoded)).unwrap();
        let err = archive.resource("blob").unwrap_err();
        assert_eq!(err.path, "blob");
    }

    #[test]
    fn encode_rejects_invalid_resource_paths() {
        for path in ["lib//a.so", "../escape", "/abs", ""] {
            assert!(matches!(
                encode(&[], [(path, &b"x"[..])]),
                Err(EncodeError::InvalidPath { path: rejected }) if rejected == path
            ));
        }
    }

    #[test]
    fn decode_rejects_invalid_manifest_paths() {
        let mut encoded = encode(&[], [("lib/xa.so", &b"payload"[..])]).unwrap();
        // Same length, so the manifest length in the header stays correct.
        let at = encoded
            .windows(9)
            .position(|window| window == b"lib/xa.so")
            .unwrap();
        encoded[at..at + 9].copy_from_slice(b"lib//a.so");

        assert!(matches!(
            Archive::decode(Bytes::from(encoded)),
            Err(DecodeError::InvalidPath { path }) if path == "lib//a.so"
        ));
    }
}
