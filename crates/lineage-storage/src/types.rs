//! Core types for the hierarchy storage abstraction layer.
//!
//! This module defines the data structures used for entities, materialized
//! answers and mutation outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::path::EntityPath;

/// Opaque entity identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wraps an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Monotone stamp describing the store state an answer was computed from.
///
/// It is the store's global revision read immediately before computation, so
/// an answer computed after a mutation always carries a stamp greater than or
/// equal to that mutation's revision.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SourceHash(pub u64);

impl SourceHash {
    /// `true` when this stamp predates the given mutation revision.
    #[must_use]
    pub fn predates(self, revision: u64) -> bool {
        self.0 < revision
    }
}

impl fmt::Display for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node of the entity taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub entity_type: String,
    pub path: EntityPath,
    pub depth: u32,
    /// SHA-256 over name, type tag and path.
    pub content_hash: String,
    pub confidence: Option<f64>,
    pub active: bool,
    /// Store revision of the last change affecting this entity's answer.
    pub revision: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Entity {
    /// Computes the change-detection hash for an entity's identifying content.
    #[must_use]
    pub fn compute_content_hash(name: &str, entity_type: &str, path: &EntityPath) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(entity_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(path.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Recomputes `content_hash` and `depth` after name or path changes.
    pub fn refresh_derived(&mut self) {
        self.depth = self.path.depth();
        self.content_hash = Self::compute_content_hash(&self.name, &self.entity_type, &self.path);
    }
}

/// Input for creating an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntity {
    /// Identity; the store generates one when absent.
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    pub entity_type: String,
    pub path: EntityPath,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl NewEntity {
    /// Creates an entity input whose display name is the leaf label.
    pub fn new(path: EntityPath, entity_type: impl Into<String>) -> Self {
        Self {
            id: None,
            name: path.leaf_label().to_string(),
            entity_type: entity_type.into(),
            path,
            confidence: None,
        }
    }

    /// Sets an explicit identity.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the confidence score.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Validates and clamps a confidence score to `[0, 1]`.
pub fn normalize_confidence(confidence: Option<f64>) -> Result<Option<f64>, StorageError> {
    match confidence {
        Some(value) if value.is_nan() => {
            Err(StorageError::invalid_entity("confidence must be a number"))
        }
        Some(value) => Ok(Some(value.clamp(0.0, 1.0))),
        None => Ok(None),
    }
}

/// Precomputed hierarchy answer for one entity.
///
/// Written only by the view materializer; every cache tier holds read-only
/// copies of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedAnswer {
    pub entity_id: EntityId,
    pub path: EntityPath,
    /// Ancestor display names, root first, excluding the entity itself.
    pub ancestors: Vec<String>,
    pub descendant_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    pub source_hash: SourceHash,
}

/// What a mutation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Renamed,
    Moved,
    Deactivated,
    Updated,
}

impl MutationKind {
    /// `true` when descendants' cached answers change as well.
    #[must_use]
    pub fn affects_descendants(self) -> bool {
        matches!(self, Self::Renamed | Self::Moved)
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Renamed => "renamed",
            Self::Moved => "moved",
            Self::Deactivated => "deactivated",
            Self::Updated => "updated",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a store write.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Entity state after the write.
    pub entity: Entity,
    pub kind: MutationKind,
    /// Revision assigned to the write.
    pub revision: u64,
    /// Paths whose subtree and ancestors are affected (old and new path on moves).
    pub affected_prefixes: Vec<EntityPath>,
}

/// Column used to join entities to materialized answers.
///
/// The correct value is the identity column of the entity primary key,
/// `entity_id`. Anything else compiles into a join that never matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JoinColumn(String);

impl JoinColumn {
    /// The identity column shared with the entity primary key.
    pub const ENTITY_ID: &'static str = "entity_id";

    /// Validates a column identifier (`[a-z_][a-z0-9_]*`).
    pub fn new(column: impl Into<String>) -> Result<Self, StorageError> {
        let column = column.into();
        let mut chars = column.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_head || !valid_tail || column.len() > 63 {
            return Err(StorageError::invalid_entity(format!(
                "invalid join column identifier '{column}'"
            )));
        }
        Ok(Self(column))
    }

    /// The identity column.
    #[must_use]
    pub fn entity_id() -> Self {
        Self(Self::ENTITY_ID.to_string())
    }

    /// Column name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` when joining on the identity column.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.0 == Self::ENTITY_ID
    }
}

impl Default for JoinColumn {
    fn default() -> Self {
        Self::entity_id()
    }
}

impl fmt::Display for JoinColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JoinColumn {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JoinColumn> for String {
    fn from(column: JoinColumn) -> Self {
        column.0
    }
}
