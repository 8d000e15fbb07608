//! Absolute hierarchical resource paths.
//!
//! A path is `/`-separated and always absolute, e.g. `/db/a/doc.xml`.
//! Empty segments, `.` and `..` are rejected so two spellings never name
//! the same resource.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the top-level collection every store starts with.
pub const ROOT_COLLECTION_NAME: &str = "db";

/// An absolute path naming a collection or a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Parse and normalize an absolute path.
    ///
    /// A single trailing `/` is tolerated and stripped.
    ///
    /// # Errors
    ///
    /// Returns error if the path is empty, relative, or contains empty,
    /// `.` or `..` segments.
    pub fn parse(input: &str) -> Result<Self, PathError> {
        if input.is_empty() {
            return Err(PathError::Empty);
        }
        if !input.starts_with('/') {
            return Err(PathError::NotAbsolute(input.to_string()));
        }

        let trimmed = if input.len() > 1 {
            input.strip_suffix('/').unwrap_or(input)
        } else {
            input
        };
        if trimmed == "/" {
            return Ok(Self::root());
        }

        for segment in trimmed[1..].split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(PathError::InvalidSegment {
                    path: input.to_string(),
                    segment: segment.to_string(),
                });
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    /// The root path `/`.
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// The top-level collection, `/db`.
    #[must_use]
    pub fn root_collection() -> Self {
        Self(format!("/{ROOT_COLLECTION_NAME}"))
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments from the top down.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The last segment, empty for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Split into parent collection and last segment.
    ///
    /// # Errors
    ///
    /// Returns error for the root path, which has no parent.
    pub fn split_last(&self) -> Result<(Self, &str), PathError> {
        let parent = self.parent().ok_or(PathError::NoParent)?;
        Ok((parent, self.name()))
    }

    /// Append a single segment.
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not a valid single segment.
    pub fn join(&self, name: &str) -> Result<Self, PathError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(PathError::InvalidSegment {
                path: self.0.clone(),
                segment: name.to_string(),
            });
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Whether `self` lies strictly below `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// Re-home `self` from under `from` to under `to`.
    ///
    /// Returns `None` if `self` is neither `from` nor below it.
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if self == from {
            return Some(to.clone());
        }
        if !self.is_descendant_of(from) {
            return None;
        }
        let suffix = if from.is_root() {
            &self.0[1..]
        } else {
            &self.0[from.0.len() + 1..]
        };
        if to.is_root() {
            Some(Self(format!("/{suffix}")))
        } else {
            Some(Self(format!("{}/{suffix}", to.0)))
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.0
    }
}

impl std::str::FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Errors that can occur parsing or manipulating paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Path was empty
    #[error("empty path")]
    Empty,
    /// Path did not start with `/`
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    /// Path contained an empty, `.` or `..` segment
    #[error("invalid segment '{segment}' in path {path}")]
    InvalidSegment {
        /// The offending path
        path: String,
        /// The offending segment
        segment: String,
    },
    /// The root path has no parent
    #[error("root path has no parent")]
    NoParent,
}
