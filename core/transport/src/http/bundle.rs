//! Conversion between wire bundles and transport types.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tracing::warn;

use recordsync_common::{Error, RecordRef, RecordType, Result};

use crate::request::{FetchRequest, PageCursor, SearchRequest};
use crate::response::{PageEntry, RemoteRecord, ResponseEnvelope, SearchPage};
use crate::upload::{HttpVerb, OperationResult, UploadEnvelope, UploadOutcome};

/// Content type of JSON patch documents.
pub const JSON_PATCH: &str = "application/json-patch+json";

fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

fn entries(bundle: &Value) -> &[Value] {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn str_field(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

/// Leading status code of a status line such as `201 Created`.
fn status_code(status: &str) -> Option<u16> {
    status.split_whitespace().next()?.parse().ok()
}

/// Identity of a resource from its `resourceType` and `id`.
pub fn record_from_resource(resource: &Value) -> Result<RemoteRecord> {
    let record_type = resource_type(resource)
        .ok_or_else(|| Error::Protocol("resource has no resourceType".to_string()))?;
    let id = resource
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("{} resource has no id", record_type)))?;

    Ok(RemoteRecord::new(RecordRef::new(record_type, id), resource.clone()))
}

/// Joined diagnostics of an outcome resource.
pub fn outcome_diagnostics(outcome: &Value) -> Option<String> {
    let issues = outcome.get("issue").and_then(Value::as_array)?;
    let messages: Vec<&str> = issues
        .iter()
        .filter_map(|issue| {
            issue
                .get("diagnostics")
                .and_then(Value::as_str)
                .or_else(|| issue.pointer("/details/text").and_then(Value::as_str))
        })
        .collect();

    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}

fn next_link(bundle: &Value) -> Option<String> {
    bundle
        .get("link")
        .and_then(Value::as_array)?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
        .and_then(|link| link.get("url").and_then(Value::as_str))
        .map(str::to_string)
}

/// Parse a search bundle. Bundles nested inside become sub-pages, one level deep.
fn parse_search_page(record_type: &RecordType, bundle: &Value, nested: bool) -> SearchPage {
    let mut page = SearchPage::empty(record_type.clone());
    page.next_link = next_link(bundle);

    for entry in entries(bundle) {
        let Some(resource) = entry.get("resource") else {
            continue;
        };
        match resource_type(resource) {
            Some("OperationOutcome") => {
                if let Some(diagnostics) = outcome_diagnostics(resource) {
                    warn!("Search for {} reported: {}", record_type, diagnostics);
                }
            }
            Some("Bundle") if !nested => {
                let sub_type = RecordType::new("Bundle");
                page.entries
                    .push(PageEntry::Page(parse_search_page(&sub_type, resource, true)));
            }
            Some("Bundle") => warn!("Ignoring bundle nested more than one level deep"),
            _ => match record_from_resource(resource) {
                Ok(record) => page.entries.push(PageEntry::Record(record)),
                Err(e) => warn!("Skipping search entry: {}", e),
            },
        }
    }

    page
}

fn parse_batch_response(searches: &[SearchRequest], bundle: &Value) -> SearchPage {
    let mut page = SearchPage::empty("Bundle");

    for (index, entry) in entries(bundle).iter().enumerate() {
        let status = entry.pointer("/response/status").and_then(Value::as_str);
        let hint = searches
            .get(index)
            .map(|search| search.record_type.clone())
            .unwrap_or_else(|| RecordType::new("Bundle"));

        match entry.get("resource") {
            Some(resource) if resource_type(resource) == Some("Bundle") => {
                page.entries
                    .push(PageEntry::Page(parse_search_page(&hint, resource, true)));
            }
            Some(resource) if resource_type(resource) == Some("OperationOutcome") => {
                warn!(
                    "Batch search for {} failed ({}): {}",
                    hint,
                    status.unwrap_or("no status"),
                    outcome_diagnostics(resource).unwrap_or_default()
                );
            }
            Some(resource) => match record_from_resource(resource) {
                Ok(record) => page.entries.push(PageEntry::Record(record)),
                Err(e) => warn!("Skipping batch entry: {}", e),
            },
            None => warn!(
                "Batch entry for {} has no resource ({})",
                hint,
                status.unwrap_or("no status")
            ),
        }
    }

    page
}

fn parse_pointers(items: &[Value], pointer: &str) -> Vec<RecordRef> {
    items
        .iter()
        .filter_map(|item| item.pointer(pointer).and_then(Value::as_str))
        .filter_map(|reference| match RecordRef::parse(reference) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping pointer: {}", e);
                None
            }
        })
        .collect()
}

/// Decode the body of a successful fetch.
///
/// # Errors
/// - `Protocol` if the body is not a resource
pub fn parse_fetch_response(request: &FetchRequest, body: &Value) -> Result<ResponseEnvelope> {
    let envelope = match resource_type(body) {
        Some("OperationOutcome") => ResponseEnvelope::Error {
            diagnostics: outcome_diagnostics(body)
                .unwrap_or_else(|| "server returned an OperationOutcome".to_string()),
        },
        Some("Bundle") => {
            let is_batch = body.get("type").and_then(Value::as_str) == Some("batch-response");
            match request {
                FetchRequest::Batch(searches) if is_batch => {
                    ResponseEnvelope::Page(parse_batch_response(searches, body))
                }
                _ => {
                    let record_type = request
                        .target_type()
                        .cloned()
                        .unwrap_or_else(|| RecordType::new("Bundle"));
                    ResponseEnvelope::Page(parse_search_page(&record_type, body, false))
                }
            }
        }
        Some("List") => {
            let items = body.get("entry").and_then(Value::as_array);
            ResponseEnvelope::Pointers(parse_pointers(
                items.map(Vec::as_slice).unwrap_or_default(),
                "/item/reference",
            ))
        }
        Some("Group") => {
            let members = body.get("member").and_then(Value::as_array);
            ResponseEnvelope::Pointers(parse_pointers(
                members.map(Vec::as_slice).unwrap_or_default(),
                "/entity/reference",
            ))
        }
        Some(_) => ResponseEnvelope::Single(record_from_resource(body)?),
        None => {
            return Err(Error::Protocol(
                "fetch response has no resourceType".to_string(),
            ))
        }
    };

    Ok(envelope)
}

/// Batch bundle carrying one GET per search.
pub fn batch_bundle(searches: &[SearchRequest]) -> Value {
    let entries: Vec<Value> = searches
        .iter()
        .map(|search| {
            let url = match &search.cursor {
                Some(PageCursor::NextLink(link)) => link.clone(),
                None => search.relative_url(),
            };
            json!({ "request": { "method": "GET", "url": url } })
        })
        .collect();

    json!({ "resourceType": "Bundle", "type": "batch", "entry": entries })
}

/// Transaction bundle carrying every operation of an envelope, in order.
pub fn transaction_bundle(envelope: &UploadEnvelope) -> Value {
    let entries: Vec<Value> = envelope
        .operations()
        .iter()
        .map(|operation| {
            let mut entry = json!({
                "request": {
                    "method": operation.verb.as_str(),
                    "url": operation.relative_url(),
                }
            });
            match operation.verb {
                HttpVerb::Post => {
                    entry["fullUrl"] = json!(format!("urn:uuid:{}", operation.target.id));
                    entry["resource"] = operation.body.clone();
                }
                HttpVerb::Put => entry["resource"] = operation.body.clone(),
                HttpVerb::Patch => {
                    entry["resource"] = json!({
                        "resourceType": "Binary",
                        "contentType": JSON_PATCH,
                        "data": STANDARD.encode(operation.body.to_string()),
                    });
                }
                HttpVerb::Delete => {}
            }
            entry
        })
        .collect();

    json!({ "resourceType": "Bundle", "type": "transaction", "entry": entries })
}

/// Result of a single request from its status, headers and body.
pub fn result_from_response(
    status: u16,
    location: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    body: &Value,
) -> OperationResult {
    if !(200..300).contains(&status) {
        return OperationResult::Failure {
            status: Some(status),
            diagnostics: outcome_diagnostics(body).unwrap_or_else(|| format!("HTTP {}", status)),
        };
    }

    OperationResult::Success {
        resource_id: str_field(body, "/id"),
        location,
        etag: etag.or_else(|| str_field(body, "/meta/versionId").map(|v| format!("W/\"{}\"", v))),
        last_modified: last_modified.or_else(|| str_field(body, "/meta/lastUpdated")),
    }
}

fn result_from_entry(entry: &Value) -> OperationResult {
    let status_line = str_field(entry, "/response/status").unwrap_or_default();
    let status = status_code(&status_line);

    match status {
        Some(code) if (200..300).contains(&code) => OperationResult::Success {
            resource_id: str_field(entry, "/resource/id"),
            location: str_field(entry, "/response/location"),
            etag: str_field(entry, "/response/etag"),
            last_modified: str_field(entry, "/response/lastModified"),
        },
        _ => OperationResult::Failure {
            status,
            diagnostics: entry
                .pointer("/response/outcome")
                .and_then(outcome_diagnostics)
                .unwrap_or(status_line),
        },
    }
}

/// Decode a transaction response into per-operation results.
///
/// A top-level outcome means the server refused the whole transaction; every
/// operation is reported as failed.
///
/// # Errors
/// - `Protocol` if the number of entries does not match `expected`
pub fn parse_transaction_response(body: &Value, expected: usize) -> Result<UploadOutcome> {
    match resource_type(body) {
        Some("OperationOutcome") => {
            let failure = OperationResult::Failure {
                status: None,
                diagnostics: outcome_diagnostics(body)
                    .unwrap_or_else(|| "transaction rejected".to_string()),
            };
            Ok(UploadOutcome::PerOperation(vec![failure; expected]))
        }
        Some("Bundle") => {
            let results: Vec<OperationResult> = entries(body).iter().map(result_from_entry).collect();
            if results.len() != expected {
                return Err(Error::Protocol(format!(
                    "transaction response has {} entries, expected {}",
                    results.len(),
                    expected
                )));
            }
            Ok(UploadOutcome::PerOperation(results))
        }
        _ => Err(Error::Protocol(
            "transaction response is not a bundle".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadOperation;
    use recordsync_common::{ChangeKind, ChangeToken};

    #[test]
    fn test_parse_searchset() {
        let body = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "link": [
                {"relation": "self", "url": "https://host/fhir/Patient"},
                {"relation": "next", "url": "https://host/fhir?_getpages=abc"}
            ],
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "1"}},
                {"resource": {"resourceType": "Patient", "id": "2"}},
                {"resource": {"resourceType": "OperationOutcome", "issue": []}}
            ]
        });

        let request = FetchRequest::Search(SearchRequest::new("Patient"));
        let ResponseEnvelope::Page(page) = parse_fetch_response(&request, &body).unwrap() else {
            panic!("expected page");
        };
        assert_eq!(page.record_type.as_str(), "Patient");
        assert_eq!(page.records().count(), 2);
        assert_eq!(page.next_link.as_deref(), Some("https://host/fhir?_getpages=abc"));
    }

    #[test]
    fn test_parse_batch_response_uses_request_types() {
        let body = json!({
            "resourceType": "Bundle",
            "type": "batch-response",
            "entry": [
                {
                    "response": {"status": "200 OK"},
                    "resource": {
                        "resourceType": "Bundle",
                        "type": "searchset",
                        "entry": [{"resource": {"resourceType": "Practitioner", "id": "9"}}]
                    }
                },
                {
                    "response": {"status": "400 Bad Request"},
                    "resource": {"resourceType": "OperationOutcome", "issue": [{"diagnostics": "bad"}]}
                }
            ]
        });

        let request = FetchRequest::Batch(vec![
            SearchRequest::new("Practitioner").with_param("_id", "9"),
            SearchRequest::new("Organization").with_param("_id", "x"),
        ]);
        let ResponseEnvelope::Page(page) = parse_fetch_response(&request, &body).unwrap() else {
            panic!("expected page");
        };
        let subs: Vec<_> = page.sub_pages().collect();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].record_type.as_str(), "Practitioner");
        assert_eq!(subs[0].records().count(), 1);
    }

    #[test]
    fn test_parse_outcome_and_pointers() {
        let request = FetchRequest::Read(RecordRef::new("Patient", "1"));
        let outcome = json!({
            "resourceType": "OperationOutcome",
            "issue": [{"diagnostics": "first"}, {"details": {"text": "second"}}]
        });
        assert_eq!(
            parse_fetch_response(&request, &outcome).unwrap(),
            ResponseEnvelope::Error { diagnostics: "first; second".to_string() }
        );

        let list = json!({
            "resourceType": "List",
            "entry": [
                {"item": {"reference": "Patient/1"}},
                {"item": {"reference": "not-a-reference"}},
                {"item": {"reference": "Patient/2"}}
            ]
        });
        assert_eq!(
            parse_fetch_response(&request, &list).unwrap(),
            ResponseEnvelope::Pointers(vec![
                RecordRef::new("Patient", "1"),
                RecordRef::new("Patient", "2")
            ])
        );
    }

    #[test]
    fn test_parse_single_and_missing_type() {
        let request = FetchRequest::Read(RecordRef::new("Patient", "1"));
        let single = parse_fetch_response(&request, &json!({"resourceType": "Patient", "id": "1"}));
        assert!(matches!(single, Ok(ResponseEnvelope::Single(_))));

        let missing = parse_fetch_response(&request, &json!({"id": "1"}));
        assert!(matches!(missing, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_transaction_bundle_wraps_patch() {
        let mut envelope = UploadEnvelope::new();
        envelope.push(
            UploadOperation {
                verb: HttpVerb::Patch,
                kind: ChangeKind::Update,
                target: RecordRef::new("Patient", "1"),
                body: json!([{"op": "replace", "path": "/active", "value": true}]),
            },
            vec![ChangeToken(1)],
        );
        envelope.push(
            UploadOperation {
                verb: HttpVerb::Delete,
                kind: ChangeKind::Delete,
                target: RecordRef::new("Patient", "2"),
                body: Value::Null,
            },
            vec![ChangeToken(2)],
        );

        let bundle = transaction_bundle(&envelope);
        assert_eq!(bundle["type"], "transaction");
        assert_eq!(bundle["entry"][0]["request"]["method"], "PATCH");
        assert_eq!(bundle["entry"][0]["resource"]["resourceType"], "Binary");
        assert_eq!(bundle["entry"][1]["request"]["url"], "Patient/2");
        assert!(bundle["entry"][1].get("resource").is_none());
    }

    #[test]
    fn test_parse_transaction_response() {
        let body = json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": [
                {"response": {
                    "status": "201 Created",
                    "location": "Patient/42/_history/1",
                    "etag": "W/\"1\"",
                    "lastModified": "2024-01-01T00:00:00Z"
                }},
                {"response": {
                    "status": "412 Precondition Failed",
                    "outcome": {"resourceType": "OperationOutcome", "issue": [{"diagnostics": "version conflict"}]}
                }}
            ]
        });

        let UploadOutcome::PerOperation(results) = parse_transaction_response(&body, 2).unwrap()
        else {
            panic!("expected per-operation results");
        };
        assert!(results[0].is_success());
        assert_eq!(
            results[1],
            OperationResult::Failure {
                status: Some(412),
                diagnostics: "version conflict".to_string()
            }
        );

        assert!(matches!(
            parse_transaction_response(&body, 3),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_result_from_response_falls_back_to_meta() {
        let body = json!({
            "resourceType": "Patient",
            "id": "42",
            "meta": {"versionId": "3", "lastUpdated": "2024-02-01T10:00:00Z"}
        });

        let result = result_from_response(201, Some("Patient/42/_history/3".into()), None, None, &body);
        assert_eq!(
            result,
            OperationResult::Success {
                resource_id: Some("42".into()),
                location: Some("Patient/42/_history/3".into()),
                etag: Some("W/\"3\"".into()),
                last_modified: Some("2024-02-01T10:00:00Z".into()),
            }
        );

        let failure = result_from_response(404, None, None, None, &Value::Null);
        assert_eq!(failure, OperationResult::failed(404, "HTTP 404"));
    }
}
