//! Extraction rules: follow-up requests derived from downloaded pages.
//!
//! Rules are keyed by the record type of the page they inspect. They are pure
//! functions of the page and the limits in [`RuleContext`], so every rule can
//! be tested on its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use recordsync_common::{RecordRef, RecordType};
use recordsync_transport::{FetchRequest, SearchPage, SearchRequest};

/// Limits a rule may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleContext {
    /// Desired page size of emitted searches.
    pub page_size: u32,
    /// Maximum number of ids joined into one search.
    pub id_batch_size: usize,
    /// Maximum number of searches in one batch envelope.
    pub max_requests_per_envelope: usize,
}

impl Default for RuleContext {
    fn default() -> Self {
        Self {
            page_size: 100,
            id_batch_size: 50,
            max_requests_per_envelope: 10,
        }
    }
}

/// Output of running rules against a page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Requests to enqueue.
    pub requests: Vec<FetchRequest>,
    /// Foreign records to look up in the resolution pass.
    pub discovered: Vec<RecordRef>,
    /// Reference strings that could not be parsed.
    pub malformed: Vec<String>,
}

impl Extraction {
    /// Append another extraction.
    pub fn merge(&mut self, other: Extraction) {
        self.requests.extend(other.requests);
        self.discovered.extend(other.discovered);
        self.malformed.extend(other.malformed);
    }

    /// Check if nothing was extracted.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.discovered.is_empty() && self.malformed.is_empty()
    }
}

/// A rule deriving follow-up work from one page.
pub trait ExtractionRule: Send + Sync {
    /// Inspect a page of the rule's source type.
    fn extract(&self, page: &SearchPage, ctx: &RuleContext) -> Extraction;
}

impl<F> ExtractionRule for F
where
    F: Fn(&SearchPage, &RuleContext) -> Extraction + Send + Sync,
{
    fn extract(&self, page: &SearchPage, ctx: &RuleContext) -> Extraction {
        self(page, ctx)
    }
}

/// Group searches into batch envelopes of at most `per_envelope` items.
pub fn into_batches(searches: Vec<SearchRequest>, per_envelope: usize) -> Vec<FetchRequest> {
    searches
        .chunks(per_envelope.max(1))
        .map(|chunk| FetchRequest::Batch(chunk.to_vec()))
        .collect()
}

/// A related type searched by a foreign key pointing at the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutTarget {
    /// Type to search.
    pub record_type: RecordType,
    /// Search parameter holding the reference to the source (e.g. `subject`).
    pub search_param: String,
}

impl FanOutTarget {
    /// Create a target.
    pub fn new(record_type: impl Into<RecordType>, search_param: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            search_param: search_param.into(),
        }
    }
}

/// For every source record in the page, search the related types by foreign key.
///
/// Source ids are chunked; every chunk produces one search per target
/// (`<param>=Source/a,Source/b`), grouped into batch envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyFanOut {
    /// Related types.
    pub targets: Vec<FanOutTarget>,
    /// Source ids per search; `0` uses the context's id batch size.
    pub ids_per_request: usize,
    /// Searches per envelope; `0` uses the context's limit.
    pub requests_per_envelope: usize,
    /// Sort parameter, `-_lastUpdated` by default.
    pub sort: Option<String>,
}

impl ForeignKeyFanOut {
    /// Create a fan-out with context limits and newest-first sorting.
    pub fn new(targets: Vec<FanOutTarget>) -> Self {
        Self {
            targets,
            ids_per_request: 0,
            requests_per_envelope: 0,
            sort: Some(default_sort()),
        }
    }
}

impl ExtractionRule for ForeignKeyFanOut {
    fn extract(&self, page: &SearchPage, ctx: &RuleContext) -> Extraction {
        let source = &page.record_type;
        let ids: BTreeSet<&str> = page
            .records()
            .filter(|record| &record.reference.record_type == source)
            .map(|record| record.reference.id.as_str())
            .collect();
        if ids.is_empty() || self.targets.is_empty() {
            return Extraction::default();
        }

        let ids: Vec<&str> = ids.into_iter().collect();
        let per_request = match self.ids_per_request {
            0 => ctx.id_batch_size,
            n => n,
        };
        let per_envelope = match self.requests_per_envelope {
            0 => ctx.max_requests_per_envelope,
            n => n,
        };

        let mut searches = Vec::new();
        for chunk in ids.chunks(per_request.max(1)) {
            let value = chunk
                .iter()
                .map(|id| format!("{}/{}", source, id))
                .collect::<Vec<_>>()
                .join(",");
            for target in &self.targets {
                let mut search = SearchRequest::new(target.record_type.clone())
                    .with_param(target.search_param.clone(), value.clone());
                if let Some(sort) = &self.sort {
                    search = search.with_param("_sort", sort.clone());
                }
                searches.push(search.with_count(ctx.page_size));
            }
        }

        Extraction {
            requests: into_batches(searches, per_envelope),
            ..Extraction::default()
        }
    }
}

/// Collect outbound references to the target types for the resolution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredReferences {
    /// Types whose references are collected.
    pub targets: BTreeSet<RecordType>,
    /// Name of the member holding reference strings.
    pub field: String,
}

impl DeferredReferences {
    /// Collect references to `targets` from `reference` members.
    pub fn new(targets: impl IntoIterator<Item = RecordType>) -> Self {
        Self {
            targets: targets.into_iter().collect(),
            field: default_field(),
        }
    }

    fn walk(&self, value: &Value, out: &mut Extraction) {
        match value {
            Value::Object(members) => {
                for (key, member) in members {
                    match member {
                        Value::String(raw) if key == &self.field => {
                            match RecordRef::parse(raw) {
                                Ok(reference) if self.targets.contains(&reference.record_type) => {
                                    out.discovered.push(reference)
                                }
                                Ok(_) => {}
                                Err(_) => out.malformed.push(raw.clone()),
                            }
                        }
                        other => self.walk(other, out),
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, out);
                }
            }
            _ => {}
        }
    }
}

impl ExtractionRule for DeferredReferences {
    fn extract(&self, page: &SearchPage, _ctx: &RuleContext) -> Extraction {
        let mut out = Extraction::default();
        for record in page.records() {
            self.walk(&record.body, &mut out);
        }
        out
    }
}

fn default_sort() -> String {
    "-_lastUpdated".to_string()
}

fn default_sort_option() -> Option<String> {
    Some(default_sort())
}

fn default_field() -> String {
    "reference".to_string()
}

/// Serializable description of a built-in rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    /// See [`ForeignKeyFanOut`].
    ForeignKeyFanOut {
        source: RecordType,
        targets: Vec<FanOutTarget>,
        #[serde(default)]
        ids_per_request: usize,
        #[serde(default)]
        requests_per_envelope: usize,
        #[serde(default = "default_sort_option")]
        sort: Option<String>,
    },
    /// See [`DeferredReferences`].
    DeferredReferences {
        source: RecordType,
        targets: Vec<RecordType>,
        #[serde(default = "default_field")]
        field: String,
    },
}

impl RuleSpec {
    /// Type of the pages the rule inspects.
    pub fn source(&self) -> &RecordType {
        match self {
            RuleSpec::ForeignKeyFanOut { source, .. } | RuleSpec::DeferredReferences { source, .. } => {
                source
            }
        }
    }

    /// Build the rule.
    pub fn build(&self) -> Box<dyn ExtractionRule> {
        match self {
            RuleSpec::ForeignKeyFanOut {
                targets,
                ids_per_request,
                requests_per_envelope,
                sort,
                ..
            } => Box::new(ForeignKeyFanOut {
                targets: targets.clone(),
                ids_per_request: *ids_per_request,
                requests_per_envelope: *requests_per_envelope,
                sort: sort.clone(),
            }),
            RuleSpec::DeferredReferences { targets, field, .. } => Box::new(DeferredReferences {
                targets: targets.iter().cloned().collect(),
                field: field.clone(),
            }),
        }
    }
}

/// Rules keyed by source record type.
#[derive(Default)]
pub struct ExtractionTable {
    rules: HashMap<RecordType, Vec<Box<dyn ExtractionRule>>>,
}

impl ExtractionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from rule descriptions.
    pub fn from_specs(specs: &[RuleSpec]) -> Self {
        let mut table = Self::new();
        for spec in specs {
            table
                .rules
                .entry(spec.source().clone())
                .or_default()
                .push(spec.build());
        }
        table
    }

    /// Register a rule for pages of `source`.
    pub fn register(&mut self, source: impl Into<RecordType>, rule: impl ExtractionRule + 'static) {
        self.rules
            .entry(source.into())
            .or_default()
            .push(Box::new(rule));
    }

    /// Rules registered for a type.
    pub fn rules_for(&self, source: &RecordType) -> &[Box<dyn ExtractionRule>] {
        self.rules.get(source).map(Vec::as_slice).unwrap_or_default()
    }

    /// Run every rule registered for the page's type.
    pub fn extract(&self, page: &SearchPage, ctx: &RuleContext) -> Extraction {
        let mut out = Extraction::default();
        for rule in self.rules_for(&page.record_type) {
            out.merge(rule.extract(page, ctx));
        }
        if !out.is_empty() {
            debug!(
                "Rules for {} produced {} request(s), {} reference(s)",
                page.record_type,
                out.requests.len(),
                out.discovered.len()
            );
        }
        out
    }

    /// Number of source types with rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordsync_transport::RemoteRecord;
    use serde_json::json;

    fn patients(ids: &[&str]) -> SearchPage {
        SearchPage::of_records(
            "Patient",
            ids.iter()
                .map(|id| RemoteRecord::new(RecordRef::new("Patient", *id), json!({"id": id})))
                .collect(),
        )
    }

    fn searches(requests: &[FetchRequest]) -> Vec<Vec<SearchRequest>> {
        requests
            .iter()
            .map(|request| match request {
                FetchRequest::Batch(items) => items.clone(),
                other => panic!("expected batch, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_fan_out_chunks_and_batches() {
        let rule = ForeignKeyFanOut {
            targets: vec![
                FanOutTarget::new("Observation", "subject"),
                FanOutTarget::new("Encounter", "patient"),
            ],
            ids_per_request: 2,
            requests_per_envelope: 3,
            sort: Some(default_sort()),
        };
        let ctx = RuleContext::default();

        let out = rule.extract(&patients(&["1", "2", "3"]), &ctx);
        let batches = searches(&out.requests);

        // 2 chunks x 2 targets = 4 searches, 3 per envelope.
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 1]);
        let first = &batches[0][0];
        assert_eq!(first.record_type.as_str(), "Observation");
        assert_eq!(
            first.params,
            vec![
                ("subject".to_string(), "Patient/1,Patient/2".to_string()),
                ("_sort".to_string(), "-_lastUpdated".to_string()),
            ]
        );
        assert_eq!(first.count, Some(ctx.page_size));
        assert_eq!(batches[1][0].params[0].1, "Patient/3");
    }

    #[test]
    fn test_fan_out_ignores_foreign_records() {
        let mut page = patients(&[]);
        page.entries.push(recordsync_transport::PageEntry::Record(RemoteRecord::new(
            RecordRef::new("Practitioner", "x"),
            json!({}),
        )));
        let rule = ForeignKeyFanOut::new(vec![FanOutTarget::new("Observation", "subject")]);
        assert!(rule.extract(&page, &RuleContext::default()).is_empty());
    }

    #[test]
    fn test_deferred_references() {
        let page = SearchPage::of_records(
            "Encounter",
            vec![RemoteRecord::new(
                RecordRef::new("Encounter", "e1"),
                json!({
                    "subject": {"reference": "Patient/1"},
                    "participant": [
                        {"individual": {"reference": "Practitioner/7"}},
                        {"individual": {"reference": "https://host/fhir/Practitioner/8/_history/2"}}
                    ],
                    "serviceProvider": {"reference": "Organization/3"},
                    "partOf": {"reference": "#contained"}
                }),
            )],
        );
        let rule = DeferredReferences::new(["Practitioner".into(), "Organization".into()]);

        let out = rule.extract(&page, &RuleContext::default());
        assert!(out.requests.is_empty());
        let mut found: Vec<String> = out.discovered.iter().map(ToString::to_string).collect();
        found.sort();
        assert_eq!(found, vec!["Organization/3", "Practitioner/7", "Practitioner/8"]);
        assert_eq!(out.malformed, vec!["#contained".to_string()]);
    }

    #[test]
    fn test_table_dispatch_and_closures() {
        let mut table = ExtractionTable::new();
        table.register("Patient", |page: &SearchPage, _ctx: &RuleContext| Extraction {
            requests: page
                .records()
                .map(|r| FetchRequest::Read(r.reference.clone()))
                .collect(),
            ..Extraction::default()
        });

        let ctx = RuleContext::default();
        assert_eq!(table.extract(&patients(&["1", "2"]), &ctx).requests.len(), 2);
        assert!(table.extract(&SearchPage::empty("Observation"), &ctx).is_empty());
        assert_eq!(table.rules_for(&"Observation".into()).len(), 0);
    }

    #[test]
    fn test_rule_specs_from_json() {
        let specs: Vec<RuleSpec> = serde_json::from_value(json!([
            {
                "kind": "foreign_key_fan_out",
                "source": "Patient",
                "targets": [{"record_type": "Observation", "search_param": "subject"}]
            },
            {
                "kind": "deferred_references",
                "source": "Encounter",
                "targets": ["Practitioner"]
            }
        ]))
        .unwrap();

        match &specs[0] {
            RuleSpec::ForeignKeyFanOut { sort, ids_per_request, .. } => {
                assert_eq!(sort.as_deref(), Some("-_lastUpdated"));
                assert_eq!(*ids_per_request, 0);
            }
            other => panic!("unexpected spec {other:?}"),
        }
        match &specs[1] {
            RuleSpec::DeferredReferences { field, .. } => assert_eq!(field, "reference"),
            other => panic!("unexpected spec {other:?}"),
        }

        let table = ExtractionTable::from_specs(&specs);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rules_for(&"Patient".into()).len(), 1);
    }
}
