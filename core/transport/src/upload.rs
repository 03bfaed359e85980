//! Upload envelopes and the outcomes the server reports for them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use recordsync_common::{ChangeKind, ChangeToken, RecordRef};

/// Network verb of an upload operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpVerb {
    /// Create; the server assigns the id.
    Post,
    /// Create or replace at a client-chosen id.
    Put,
    /// Partial update with a JSON patch body.
    Patch,
    /// Remove.
    Delete,
}

impl HttpVerb {
    /// Method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Patch => "PATCH",
            HttpVerb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One network operation inside an upload envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOperation {
    /// Verb to use.
    pub verb: HttpVerb,
    /// Kind of the squashed local change behind this operation.
    pub kind: ChangeKind,
    /// Record targeted (local id for inserts).
    pub target: RecordRef,
    /// Full payload, JSON patch document, or `Null` for deletes.
    pub body: Value,
}

impl UploadOperation {
    /// Relative request URL: the type collection for POST, the instance otherwise.
    pub fn relative_url(&self) -> String {
        match self.verb {
            HttpVerb::Post => self.target.record_type.to_string(),
            _ => self.target.to_string(),
        }
    }

    /// Serialized size of the body in bytes.
    pub fn body_size(&self) -> usize {
        match &self.body {
            Value::Null => 0,
            body => body.to_string().len(),
        }
    }
}

/// A batch of upload operations submitted as one network exchange.
///
/// Every operation carries the set of journal tokens it resolves; the two
/// sequences are kept positionally aligned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadEnvelope {
    operations: Vec<UploadOperation>,
    source_change_groups: Vec<Vec<ChangeToken>>,
}

impl UploadEnvelope {
    /// Create an empty envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation together with the tokens it resolves.
    pub fn push(&mut self, operation: UploadOperation, tokens: Vec<ChangeToken>) {
        self.operations.push(operation);
        self.source_change_groups.push(tokens);
    }

    /// Operations in submission order.
    pub fn operations(&self) -> &[UploadOperation] {
        &self.operations
    }

    /// Token groups, one per operation.
    pub fn source_change_groups(&self) -> &[Vec<ChangeToken>] {
        &self.source_change_groups
    }

    /// Operations paired with their token groups.
    pub fn iter(&self) -> impl Iterator<Item = (&UploadOperation, &[ChangeToken])> {
        self.operations
            .iter()
            .zip(self.source_change_groups.iter().map(Vec::as_slice))
    }

    /// Every token covered by the envelope.
    pub fn all_tokens(&self) -> Vec<ChangeToken> {
        self.source_change_groups.iter().flatten().copied().collect()
    }

    /// Cumulative serialized body size.
    pub fn body_size(&self) -> usize {
        self.operations.iter().map(UploadOperation::body_size).sum()
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the envelope has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Server result for a single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResult {
    /// The operation was applied.
    Success {
        /// Id of the stored record, when the server reports it.
        resource_id: Option<String>,
        /// Location of the new version (`.../Type/id/_history/v`).
        location: Option<String>,
        /// Raw version tag (`W/"3"` or `"3"`).
        etag: Option<String>,
        /// Raw last-modified timestamp.
        last_modified: Option<String>,
    },
    /// The operation was refused.
    Failure {
        /// Status code, when known.
        status: Option<u16>,
        /// Diagnostics reported by the server.
        diagnostics: String,
    },
}

impl OperationResult {
    /// A success without any metadata.
    pub fn accepted() -> Self {
        OperationResult::Success {
            resource_id: None,
            location: None,
            etag: None,
            last_modified: None,
        }
    }

    /// A success carrying location, tag and timestamp.
    pub fn created(
        location: impl Into<String>,
        etag: impl Into<String>,
        last_modified: impl Into<String>,
    ) -> Self {
        OperationResult::Success {
            resource_id: None,
            location: Some(location.into()),
            etag: Some(etag.into()),
            last_modified: Some(last_modified.into()),
        }
    }

    /// A failure with a status code.
    pub fn failed(status: u16, diagnostics: impl Into<String>) -> Self {
        OperationResult::Failure {
            status: Some(status),
            diagnostics: diagnostics.into(),
        }
    }

    /// Check if the operation was applied.
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success { .. })
    }
}

/// What the server returned for a whole envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UploadOutcome {
    /// One result for the envelope as a whole.
    Aggregate(OperationResult),
    /// One result per operation, positionally aligned.
    PerOperation(Vec<OperationResult>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(verb: HttpVerb, kind: ChangeKind, id: &str, body: Value) -> UploadOperation {
        UploadOperation {
            verb,
            kind,
            target: RecordRef::new("Patient", id),
            body,
        }
    }

    #[test]
    fn test_relative_url_by_verb() {
        let post = op(HttpVerb::Post, ChangeKind::Insert, "tmp-1", json!({}));
        let put = op(HttpVerb::Put, ChangeKind::Insert, "1", json!({}));
        assert_eq!(post.relative_url(), "Patient");
        assert_eq!(put.relative_url(), "Patient/1");
    }

    #[test]
    fn test_envelope_groups_stay_aligned() {
        let mut envelope = UploadEnvelope::new();
        envelope.push(
            op(HttpVerb::Put, ChangeKind::Insert, "1", json!({"id": "1"})),
            vec![ChangeToken(1), ChangeToken(2)],
        );
        envelope.push(
            op(HttpVerb::Delete, ChangeKind::Delete, "2", Value::Null),
            vec![ChangeToken(3)],
        );

        assert_eq!(envelope.len(), 2);
        assert_eq!(envelope.operations().len(), envelope.source_change_groups().len());
        assert_eq!(
            envelope.all_tokens(),
            vec![ChangeToken(1), ChangeToken(2), ChangeToken(3)]
        );

        let pairs: Vec<_> = envelope.iter().map(|(o, t)| (o.target.id.clone(), t.len())).collect();
        assert_eq!(pairs, vec![("1".to_string(), 2), ("2".to_string(), 1)]);
    }

    #[test]
    fn test_delete_has_no_body_size() {
        let delete = op(HttpVerb::Delete, ChangeKind::Delete, "2", Value::Null);
        assert_eq!(delete.body_size(), 0);

        let put = op(HttpVerb::Put, ChangeKind::Update, "1", json!({"a": 1}));
        assert_eq!(put.body_size(), r#"{"a":1}"#.len());
    }
}
