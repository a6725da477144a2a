//! Package identities.
//!
//! Stored content is keyed by the pair of a [`PackageName`] and a
//! [`VersionName`]. Both are validated when they are constructed so that
//! every backend can use them verbatim as a path component or object key
//! segment, and so that neither can ever contain the [`KEY_SEPARATOR`].
//! Enumeration returns [`Descriptor`]s built from those structured parts,
//! never from a combined string.

use std::error::Error;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Separator used when an identity is rendered as a single string.
pub const KEY_SEPARATOR: char = '/';

/// Separator introducing the qualifier in a rendered [`Descriptor`].
pub const QUALIFIER_SEPARATOR: char = ':';

/// Which half of an identity a [`NameError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Package,
    Version,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Package => write!(f, "package name"),
            Self::Version => write!(f, "version name"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    Empty(NameKind),
    LeadingDot(NameKind, String),
    InvalidChar(NameKind, String, char),
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty(kind) => write!(f, "{kind} must not be empty"),
            Self::LeadingDot(kind, name) => write!(f, "{kind} {name:?} must not start with '.'"),
            Self::InvalidChar(kind, name, c) => {
                write!(f, "{kind} {name:?} contains invalid character {c:?}")
            }
        }
    }
}

impl Error for NameError {}

fn validate(kind: NameKind, name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty(kind));
    }
    if name.starts_with('.') {
        return Err(NameError::LeadingDot(kind, name.to_owned()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(NameError::InvalidChar(kind, name.to_owned(), c));
    }
    Ok(())
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
                let name = name.into();
                validate($kind, &name)?;
                Ok(Self(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = NameError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.0
            }
        }
    };
}

name_type!(
    /// Name of a package, e.g. `alpha`.
    ///
    /// Consists of ASCII letters, digits, `_`, `.` and `-`, is non-empty and
    /// does not start with `.`.
    PackageName,
    NameKind::Package
);

name_type!(
    /// Name of one version of a package, e.g. `1.0`.
    ///
    /// Follows the same character rules as [`PackageName`].
    VersionName,
    NameKind::Version
);

/// One stored identity, as returned by enumeration.
///
/// The qualifier is reserved; the backends in this crate always leave it
/// empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor {
    pub package_name: PackageName,
    pub version_name: VersionName,
    pub qualifier: Option<String>,
}

impl Descriptor {
    pub fn new(
        package_name: PackageName,
        version_name: VersionName,
        qualifier: Option<String>,
    ) -> Self {
        Self {
            package_name,
            version_name,
            qualifier,
        }
    }

    /// The (package, version) pair this descriptor names.
    pub fn identity(&self) -> (&PackageName, &VersionName) {
        (&self.package_name, &self.version_name)
    }
}

impl From<(PackageName, VersionName)> for Descriptor {
    fn from((package_name, version_name): (PackageName, VersionName)) -> Self {
        Self::new(package_name, version_name, None)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.package_name, self.version_name)?;
        if let Some(qualifier) = &self.qualifier {
            write!(f, "{QUALIFIER_SEPARATOR}{qualifier}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["alpha", "libfoo-bar", "1.0", "2.3.4-rc1", "under_score"] {
            assert!(PackageName::new(name).is_ok(), "{name}");
            assert!(VersionName::new(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_separator() {
        assert_eq!(
            PackageName::new("a/b"),
            Err(NameError::InvalidChar(
                NameKind::Package,
                "a/b".to_owned(),
                KEY_SEPARATOR
            ))
        );
        assert!(VersionName::new("1:0").is_err());
    }

    #[test]
    fn rejects_empty_and_hidden() {
        assert_eq!(
            VersionName::new(""),
            Err(NameError::Empty(NameKind::Version))
        );
        assert!(PackageName::new(".").is_err());
        assert!(PackageName::new("..").is_err());
        assert!(PackageName::new(".tmp123").is_err());
    }

    #[test]
    fn descriptor_display() {
        let name = PackageName::new("alpha").unwrap();
        let version = VersionName::new("1.0").unwrap();
        let plain = Descriptor::new(name.clone(), version.clone(), None);
        assert_eq!(plain.to_string(), "alpha/1.0");
        let qualified = Descriptor::new(name, version, Some("default".into()));
        assert_eq!(qualified.to_string(), "alpha/1.0:default");
    }

    #[test]
    fn descriptors_sort_by_name_then_version() {
        let d = |n: &str, v: &str| -> Descriptor {
            (PackageName::new(n).unwrap(), VersionName::new(v).unwrap()).into()
        };
        let mut list = vec![d("beta", "1.0"), d("alpha", "2.0"), d("alpha", "1.0")];
        list.sort();
        assert_eq!(list, vec![d("alpha", "1.0"), d("alpha", "2.0"), d("beta", "1.0")]);
    }

    #[test]
    fn names_deserialize_with_validation() {
        let ok: PackageName = serde_json::from_str("\"alpha\"").unwrap();
        assert_eq!(ok.as_str(), "alpha");
        assert!(serde_json::from_str::<PackageName>("\"a/b\"").is_err());
    }
}
