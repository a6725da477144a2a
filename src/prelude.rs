//! This module re-exports the most commonly used types and traits from the `pkgstore` crate.
//! It is intended to be glob imported as `use pkgstore::prelude::*;`.

pub use crate::id::Descriptor;
pub use crate::id::PackageName;
pub use crate::id::VersionName;
pub use crate::repo::PackageList;
pub use crate::repo::PackageReader;
pub use crate::repo::PackageWriter;
pub use crate::repo::Repository;
pub use crate::statement::PackageStatement;
