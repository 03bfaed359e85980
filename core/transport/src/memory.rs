//! Scripted in-memory transport for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use recordsync_common::{Error, Result};

use crate::provider::RemoteTransport;
use crate::request::{FetchRequest, RequestKey, SearchRequest};
use crate::response::{PageEntry, ResponseEnvelope, SearchPage};
use crate::upload::{HttpVerb, OperationResult, UploadEnvelope, UploadOutcome};

#[derive(Default)]
struct Script {
    responses: HashMap<RequestKey, ResponseEnvelope>,
    fetch_failures: usize,
    fetched: Vec<FetchRequest>,
    upload_outcomes: VecDeque<Result<UploadOutcome>>,
    uploaded: Vec<UploadEnvelope>,
    version: u64,
}

/// In-memory transport answering from a script.
///
/// Useful for testing and development. Fetches are answered from responses
/// registered per request key; unscripted searches get an empty page, batches
/// are assembled from the scripted answers of their searches. Uploads are
/// answered from queued outcomes or, when none are queued, acknowledged with
/// generated ids, tags and timestamps.
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    /// Create a transport with an empty script.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer `request` with `response`.
    pub fn respond(&self, request: &FetchRequest, response: ResponseEnvelope) {
        self.script().responses.insert(request.key(), response);
    }

    /// Answer a search with `response`.
    pub fn respond_search(&self, search: &SearchRequest, response: ResponseEnvelope) {
        self.script().responses.insert(search.key(), response);
    }

    /// Make the next `count` fetches fail with a transport error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.script().fetch_failures = count;
    }

    /// Queue the outcome of the next upload.
    pub fn queue_upload_outcome(&self, outcome: UploadOutcome) {
        self.script().upload_outcomes.push_back(Ok(outcome));
    }

    /// Make the next upload fail with a transport error.
    pub fn queue_upload_failure(&self, message: impl Into<String>) {
        self.script()
            .upload_outcomes
            .push_back(Err(Error::Transport(message.into())));
    }

    /// Fetches received so far, in order.
    pub fn fetched(&self) -> Vec<FetchRequest> {
        self.script().fetched.clone()
    }

    /// Envelopes received so far, in order.
    pub fn uploaded(&self) -> Vec<UploadEnvelope> {
        self.script().uploaded.clone()
    }

    fn answer_search(script: &Script, search: &SearchRequest) -> ResponseEnvelope {
        script
            .responses
            .get(&search.key())
            .cloned()
            .unwrap_or_else(|| ResponseEnvelope::Page(SearchPage::empty(search.record_type.clone())))
    }

    fn acknowledge(script: &mut Script, envelope: &UploadEnvelope) -> UploadOutcome {
        let now = Utc::now().to_rfc3339();
        let mut results = Vec::with_capacity(envelope.len());

        for operation in envelope.operations() {
            script.version += 1;
            let result = match operation.verb {
                HttpVerb::Delete => OperationResult::accepted(),
                verb => {
                    let id = if verb == HttpVerb::Post {
                        Uuid::new_v4().to_string()
                    } else {
                        operation.target.id.clone()
                    };
                    OperationResult::Success {
                        resource_id: Some(id.clone()),
                        location: Some(format!(
                            "{}/{}/_history/{}",
                            operation.target.record_type, id, script.version
                        )),
                        etag: Some(format!("W/\"{}\"", script.version)),
                        last_modified: Some(now.clone()),
                    }
                }
            };
            results.push(result);
        }

        match results.len() {
            1 => UploadOutcome::Aggregate(results.remove(0)),
            _ => UploadOutcome::PerOperation(results),
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseEnvelope> {
        let mut script = self.script();
        script.fetched.push(request.clone());

        if script.fetch_failures > 0 {
            script.fetch_failures -= 1;
            return Err(Error::Transport("scripted connection failure".to_string()));
        }

        if let Some(response) = script.responses.get(&request.key()) {
            return Ok(response.clone());
        }

        let response = match request {
            FetchRequest::Search(search) => Self::answer_search(&script, search),
            FetchRequest::Batch(searches) => {
                let mut entries = Vec::with_capacity(searches.len());
                for search in searches {
                    match Self::answer_search(&script, search) {
                        ResponseEnvelope::Page(page) => entries.push(PageEntry::Page(page)),
                        ResponseEnvelope::Error { diagnostics } => {
                            return Ok(ResponseEnvelope::Error { diagnostics });
                        }
                        _ => {}
                    }
                }
                ResponseEnvelope::Page(SearchPage {
                    record_type: "Bundle".into(),
                    entries,
                    next_link: None,
                })
            }
            FetchRequest::Expand(record) => {
                ResponseEnvelope::Page(SearchPage::empty(record.record_type.clone()))
            }
            FetchRequest::Read(record) => ResponseEnvelope::Error {
                diagnostics: format!("{} not found", record),
            },
        };

        Ok(response)
    }

    async fn upload(&self, envelope: &UploadEnvelope) -> Result<UploadOutcome> {
        let mut script = self.script();

        match script.upload_outcomes.pop_front() {
            Some(Err(err)) => Err(err),
            Some(Ok(outcome)) => {
                script.uploaded.push(envelope.clone());
                Ok(outcome)
            }
            None => {
                script.uploaded.push(envelope.clone());
                Ok(Self::acknowledge(&mut script, envelope))
            }
        }
    }
}
