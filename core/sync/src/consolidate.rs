//! Reconciling upload outcomes into the journal and record metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use recordsync_common::{
    ChangeKind, ChangeToken, Error, RecordMetadata, RecordRef, Result,
};
use recordsync_transport::{OperationResult, UploadEnvelope, UploadOperation, UploadOutcome};

use crate::store::LocalStore;

/// What to do when an acknowledgement carries no readable version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleTagPolicy {
    /// Leave the record as is.
    #[default]
    Ignore,
    /// Flag the record stale.
    MarkStale,
}

/// What to do with the journal entries of an operation the server refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadFailurePolicy {
    /// Delete them; the change is not retried.
    #[default]
    Drop,
    /// Keep them for the next push.
    Retain,
}

/// An operation the server refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFailure {
    /// Targeted record.
    pub record: RecordRef,
    /// Status code, when known.
    pub status: Option<u16>,
    /// Server diagnostics.
    pub diagnostics: String,
    /// Whether the journal entries were kept.
    pub retained: bool,
}

/// Result of consolidating one envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Journal tokens removed.
    pub tokens_removed: Vec<ChangeToken>,
    /// Local identities replaced by server identities.
    pub ids_rewritten: Vec<(RecordRef, RecordRef)>,
    /// Records whose metadata was written.
    pub metadata_written: Vec<RecordRef>,
    /// Records acknowledged without a readable version.
    pub unversioned: Vec<RecordRef>,
    /// Refused operations.
    pub failures: Vec<UploadFailure>,
}

impl ConsolidationReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: ConsolidationReport) {
        self.tokens_removed.extend(other.tokens_removed);
        self.ids_rewritten.extend(other.ids_rewritten);
        self.metadata_written.extend(other.metadata_written);
        self.unversioned.extend(other.unversioned);
        self.failures.extend(other.failures);
    }
}

/// Strip the weak marker and quotes from an entity tag.
///
/// Accepts `W/"abc"`, `"abc"` and bare `abc`.
///
/// # Errors
/// - `UnparsableVersionTag` for empty or unbalanced tags
pub fn parse_version_tag(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let unweakened = trimmed
        .strip_prefix("W/")
        .or_else(|| trimmed.strip_prefix("w/"))
        .unwrap_or(trimmed);

    let tag = match unweakened.strip_prefix('"') {
        Some(rest) => rest
            .strip_suffix('"')
            .ok_or_else(|| Error::UnparsableVersionTag(raw.to_string()))?,
        None => unweakened,
    };

    if tag.is_empty() || tag.contains('"') || tag.chars().any(char::is_whitespace) {
        return Err(Error::UnparsableVersionTag(raw.to_string()));
    }
    Ok(tag.to_string())
}

/// Version segment of a `.../Type/id/_history/<version>` location.
pub fn location_version(location: &str) -> Option<String> {
    let path = location.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/');
    segments.find(|segment| *segment == "_history")?;
    segments
        .next()
        .filter(|version| !version.is_empty())
        .map(str::to_string)
}

/// Parse a server timestamp (RFC 3339 or RFC 2822 HTTP date).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Read metadata from an acknowledgement.
///
/// The tag comes from the ETag when it parses, otherwise from the location's
/// history version.
///
/// # Errors
/// - `UnparsableVersionTag` if no version or no timestamp can be read
pub fn metadata_from(
    etag: Option<&str>,
    location: Option<&str>,
    last_modified: Option<&str>,
) -> Result<RecordMetadata> {
    let version_tag = match etag.map(parse_version_tag) {
        Some(Ok(tag)) => tag,
        other => location
            .and_then(location_version)
            .ok_or_else(|| match other {
                Some(Err(e)) => e,
                _ => Error::UnparsableVersionTag("no version tag".to_string()),
            })?,
    };

    let last_modified = last_modified.and_then(parse_timestamp).ok_or_else(|| {
        Error::UnparsableVersionTag(format!(
            "unreadable timestamp: {}",
            last_modified.unwrap_or("none")
        ))
    })?;

    Ok(RecordMetadata {
        version_tag,
        last_modified,
    })
}

/// Server id reported for a created record.
fn assigned_id(resource_id: Option<&str>, location: Option<&str>) -> Option<String> {
    resource_id
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| {
            location
                .and_then(|l| RecordRef::parse(l).ok())
                .map(|r| r.id)
        })
}

/// Applies upload outcomes to a local store.
#[derive(Debug, Clone, Copy, Default)]
pub struct Consolidator {
    stale_policy: StaleTagPolicy,
    failure_policy: UploadFailurePolicy,
}

impl Consolidator {
    /// Create a consolidator with the given policies.
    pub fn new(stale_policy: StaleTagPolicy, failure_policy: UploadFailurePolicy) -> Self {
        Self {
            stale_policy,
            failure_policy,
        }
    }

    /// Pair every operation with the result that applies to it.
    fn align<'a>(
        envelope: &'a UploadEnvelope,
        outcome: &'a UploadOutcome,
    ) -> Result<Vec<Option<&'a OperationResult>>> {
        match outcome {
            UploadOutcome::PerOperation(results) => {
                if results.len() != envelope.len() {
                    return Err(Error::Protocol(format!(
                        "{} results for {} operations",
                        results.len(),
                        envelope.len()
                    )));
                }
                Ok(results.iter().map(Some).collect())
            }
            UploadOutcome::Aggregate(result) => {
                let target = match result {
                    OperationResult::Failure { .. } => None,
                    OperationResult::Success { location, .. } => location
                        .as_deref()
                        .and_then(|l| RecordRef::parse(l).ok())
                        .and_then(|reference| {
                            envelope
                                .operations()
                                .iter()
                                .position(|op| op.target == reference)
                        }),
                };
                let target = target.unwrap_or(0);

                Ok((0..envelope.len())
                    .map(|index| match result {
                        OperationResult::Failure { .. } => Some(result),
                        OperationResult::Success { .. } if index == target => Some(result),
                        OperationResult::Success { .. } => None,
                    })
                    .collect())
            }
        }
    }

    /// Consolidate one envelope's outcome.
    ///
    /// Once the outcome is aligned, every token group that ends up removed is
    /// deleted in a single `delete_changes` call before any id rewrite or
    /// metadata write. A failing per-operation write does not stop the others;
    /// the first such error is returned after all operations were processed.
    ///
    /// # Errors
    /// - `Protocol` if per-operation results do not match the envelope; the
    ///   journal is left untouched
    /// - store errors
    pub async fn consolidate<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        envelope: &UploadEnvelope,
        outcome: &UploadOutcome,
    ) -> Result<ConsolidationReport> {
        let aligned = Self::align(envelope, outcome)?;

        let mut removed = Vec::new();
        for ((_, tokens), result) in envelope.iter().zip(&aligned) {
            let retained = matches!(result, Some(OperationResult::Failure { .. }))
                && self.failure_policy == UploadFailurePolicy::Retain;
            if !retained {
                removed.extend_from_slice(tokens);
            }
        }
        store.delete_changes(&removed).await?;

        let mut report = ConsolidationReport {
            tokens_removed: removed,
            ..ConsolidationReport::default()
        };
        let mut first_error = None;

        for ((operation, _), result) in envelope.iter().zip(aligned) {
            match result {
                Some(OperationResult::Failure {
                    status,
                    diagnostics,
                }) => {
                    warn!(
                        "{} {} refused ({}): {}",
                        operation.verb,
                        operation.target,
                        status.map_or_else(|| "no status".to_string(), |s| s.to_string()),
                        diagnostics
                    );
                    report.failures.push(UploadFailure {
                        record: operation.target.clone(),
                        status: *status,
                        diagnostics: diagnostics.clone(),
                        retained: self.failure_policy == UploadFailurePolicy::Retain,
                    });
                }
                Some(OperationResult::Success {
                    resource_id,
                    location,
                    etag,
                    last_modified,
                }) => {
                    let ack = Acknowledgement {
                        resource_id: resource_id.as_deref(),
                        location: location.as_deref(),
                        etag: etag.as_deref(),
                        last_modified: last_modified.as_deref(),
                    };
                    if let Err(e) = self.apply_success(store, operation, ack, &mut report).await {
                        warn!(
                            "Failed to record acknowledgement of {}: {}",
                            operation.target, e
                        );
                        first_error.get_or_insert(e);
                    }
                }
                None => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn apply_success<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        operation: &UploadOperation,
        ack: Acknowledgement<'_>,
        report: &mut ConsolidationReport,
    ) -> Result<()> {
        if operation.kind == ChangeKind::Delete {
            return Ok(());
        }

        let mut record = operation.target.clone();
        if operation.kind == ChangeKind::Insert {
            if let Some(id) = assigned_id(ack.resource_id, ack.location) {
                if id != record.id {
                    let rewritten = store.rewrite_id(&record, &id).await?;
                    report.ids_rewritten.push((record, rewritten.clone()));
                    record = rewritten;
                }
            }
        }

        match metadata_from(ack.etag, ack.location, ack.last_modified) {
            Ok(metadata) => {
                debug!("{} is now at version {}", record, metadata.version_tag);
                store.write_metadata(&record, metadata).await?;
                report.metadata_written.push(record);
            }
            Err(e) => {
                debug!("No metadata for {}: {}", record, e);
                if self.stale_policy == StaleTagPolicy::MarkStale {
                    store.mark_stale(&record).await?;
                }
                report.unversioned.push(record);
            }
        }
        Ok(())
    }
}

/// Fields of a successful operation result.
#[derive(Debug, Clone, Copy)]
struct Acknowledgement<'a> {
    resource_id: Option<&'a str>,
    location: Option<&'a str>,
    etag: Option<&'a str>,
    last_modified: Option<&'a str>,
}
