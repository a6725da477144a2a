//! Package statements.
//!
//! A package version's manifest is an ordered sequence of statements. The
//! repository layer never interprets them: it stores and returns sequences
//! verbatim, preserving order and duplicates. Producing and understanding
//! statements is the business of the statement language that sits on top.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// An opaque unit of package content: a keyword followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageStatement {
    pub keyword: String,
    pub arguments: Vec<String>,
}

impl PackageStatement {
    pub fn new<K, I, A>(keyword: K, arguments: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            keyword: keyword.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for PackageStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keyword)?;
        for argument in &self.arguments {
            write!(f, " {argument}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_arguments() {
        let statement = PackageStatement::new("set", ["FOO=bar"]);
        assert_eq!(statement.to_string(), "set FOO=bar");
        let bare = PackageStatement::new("end", Vec::<String>::new());
        assert_eq!(bare.to_string(), "end");
    }
}
