//! Common types used throughout recordsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Name of a record type (for example `Patient` or `Observation`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordType(String);

impl RecordType {
    /// Create a record type from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Stable identity of a remote or local record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    /// Type of the record.
    pub record_type: RecordType,
    /// Identifier, unique within the type.
    pub id: String,
}

impl RecordRef {
    /// Create a reference from a type and an id.
    pub fn new(record_type: impl Into<RecordType>, id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
        }
    }

    /// Parse a reference string.
    ///
    /// Accepts `Type/id`, absolute URLs ending in `Type/id` and versioned
    /// forms ending in `Type/id/_history/<version>`. Query strings and
    /// fragments are ignored.
    ///
    /// # Errors
    /// - `MalformedReference` if no non-empty type and id can be extracted
    pub fn parse(reference: &str) -> crate::Result<Self> {
        let malformed = || crate::Error::MalformedReference(reference.to_string());

        let path = reference
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let segments = match segments.iter().position(|s| *s == "_history") {
            Some(pos) => &segments[..pos],
            None => &segments[..],
        };

        let [.., record_type, id] = segments else {
            return Err(malformed());
        };

        if !RecordType::is_valid_name(record_type) || id.chars().any(char::is_whitespace) {
            return Err(malformed());
        }

        Ok(Self::new(*record_type, *id))
    }

    /// Same type, different id.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            record_type: self.record_type.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.id)
    }
}

/// Server-assigned freshness information for a record.
///
/// Owned by the local store; only the upload consolidator writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Opaque version tag (ETag value without weak marker or quotes).
    pub version_tag: String,
    /// Last modification time reported by the server.
    pub last_modified: DateTime<Utc>,
}

/// Sequence token of a journal entry.
///
/// Tokens are allocated in strictly increasing order, one per mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(pub u64);

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Record created locally.
    Insert,
    /// Existing record modified.
    Update,
    /// Record removed.
    Delete,
}

/// A pending local mutation, as kept in the change journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    /// Journal sequence token.
    pub token: ChangeToken,
    /// Record the change applies to.
    pub record: RecordRef,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Record state after the change (`None` for deletes).
    pub payload: Option<Value>,
    /// Record state before the change, when known (updates only).
    pub base: Option<Value>,
    /// When the change was journaled.
    pub created_at: DateTime<Utc>,
}
