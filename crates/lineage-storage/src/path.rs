//! Materialized hierarchy paths.
//!
//! A path is a dot-delimited sequence of labels (`root.region.country`).
//! Its depth is the number of labels, so the root of a taxonomy has depth 1.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Separator between labels.
pub const PATH_SEPARATOR: char = '.';

/// Maximum accepted length of a single label.
pub const MAX_LABEL_LEN: usize = 128;

/// A validated, dot-delimited hierarchy path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityPath(String);

impl EntityPath {
    /// Parses and validates a path.
    ///
    /// Labels must be non-empty and consist of ASCII alphanumerics, `_` or `-`.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        if raw.is_empty() {
            return Err(StorageError::invalid_path(raw, "path is empty"));
        }
        for label in raw.split(PATH_SEPARATOR) {
            validate_label(raw, label)?;
        }
        Ok(Self(raw.to_string()))
    }

    /// Builds a single-label root path.
    pub fn root(label: &str) -> Result<Self, StorageError> {
        validate_label(label, label)?;
        Ok(Self(label.to_string()))
    }

    /// Returns the path text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of labels in the path.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.0.split(PATH_SEPARATOR).count() as u32
    }

    /// Iterates labels root-first.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.split(PATH_SEPARATOR)
    }

    /// The final label.
    #[must_use]
    pub fn leaf_label(&self) -> &str {
        self.0
            .rsplit_once(PATH_SEPARATOR)
            .map_or(self.0.as_str(), |(_, last)| last)
    }

    /// Path of the parent, or `None` for a root.
    #[must_use]
    pub fn parent(&self) -> Option<EntityPath> {
        self.0
            .rsplit_once(PATH_SEPARATOR)
            .map(|(parent, _)| Self(parent.to_string()))
    }

    /// All proper prefixes, root-first, excluding `self`.
    #[must_use]
    pub fn ancestors(&self) -> Vec<EntityPath> {
        self.0
            .char_indices()
            .filter(|(_, ch)| *ch == PATH_SEPARATOR)
            .map(|(idx, _)| Self(self.0[..idx].to_string()))
            .collect()
    }

    /// Appends a label.
    pub fn child(&self, label: &str) -> Result<EntityPath, StorageError> {
        validate_label(label, label)?;
        Ok(Self(format!("{}{PATH_SEPARATOR}{label}", self.0)))
    }

    /// `true` when `self` equals `other` or is a label-wise prefix of it.
    ///
    /// `root.ac` is not a prefix of `root.acme`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &EntityPath) -> bool {
        other.0 == self.0
            || (other.0.len() > self.0.len()
                && other.0.starts_with(&self.0)
                && other.0.as_bytes()[self.0.len()] == PATH_SEPARATOR as u8)
    }

    /// `true` when `self` is strictly below `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &EntityPath) -> bool {
        self != ancestor && ancestor.is_prefix_of(self)
    }

    /// `true` when one path is a prefix of the other.
    #[must_use]
    pub fn intersects(&self, other: &EntityPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Replaces the leading `old_prefix` with `new_prefix`.
    ///
    /// Returns `None` when `old_prefix` is not a prefix of `self`.
    #[must_use]
    pub fn rebase(&self, old_prefix: &EntityPath, new_prefix: &EntityPath) -> Option<EntityPath> {
        if !old_prefix.is_prefix_of(self) {
            return None;
        }
        let rest = &self.0[old_prefix.0.len()..];
        Some(Self(format!("{}{rest}", new_prefix.0)))
    }

    /// SQL `LIKE` pattern matching strict descendants of this path.
    #[must_use]
    pub fn descendant_like_pattern(&self) -> String {
        let escaped = self
            .0
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        format!("{escaped}{PATH_SEPARATOR}%")
    }
}

fn validate_label(path: &str, label: &str) -> Result<(), StorageError> {
    if label.is_empty() {
        return Err(StorageError::invalid_path(path, "empty label"));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(StorageError::invalid_path(
            path,
            format!("label longer than {MAX_LABEL_LEN} characters"),
        ));
    }
    if let Some(bad) = label
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(StorageError::invalid_path(
            path,
            format!("invalid character '{bad}' in label '{label}'"),
        ));
    }
    Ok(())
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityPath {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityPath {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityPath> for String {
    fn from(path: EntityPath) -> Self {
        path.0
    }
}

impl AsRef<str> for EntityPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
