//! Fetch-queue orchestration for one pull run.
//!
//! A [`PullRun`] owns every piece of pull-side state: the request queue, the
//! per-type quota bookkeeping, foreign ids waiting for the resolution pass and
//! the set of requests already issued. It never talks to the network; the
//! caller asks it for the next request, executes it and feeds the response
//! back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use recordsync_common::{Error, RecordType, Result};
use recordsync_transport::{
    FetchRequest, RemoteRecord, RequestKey, ResponseEnvelope, SearchPage, SearchRequest,
};

use crate::config::PullConfig;
use crate::extract::{into_batches, ExtractionTable, RuleContext};

/// Per-type counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    /// Distinct records retained.
    pub unique: usize,
    /// Records received, duplicates and over-quota records included.
    pub total: usize,
}

/// End-of-run report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Records handed to the store.
    pub records_retrieved: usize,
    /// Requests issued.
    pub requests_issued: usize,
    /// Wall-clock time since the run started.
    pub elapsed: Duration,
    /// Counters per record type.
    pub per_type: BTreeMap<RecordType, TypeCount>,
    /// Reference strings skipped because they could not be parsed.
    pub malformed_references: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records in {} requests ({:.1?})",
            self.records_retrieved, self.requests_issued, self.elapsed
        )?;
        for (record_type, count) in &self.per_type {
            write!(f, ", {}: {}/{}", record_type, count.unique, count.total)?;
        }
        Ok(())
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum PullStep {
    /// Execute this request and pass the response to `on_response`.
    Fetch(FetchRequest),
    /// Nothing left to fetch.
    Complete(RunSummary),
}

/// State of a single pull run.
pub struct PullRun<'a> {
    rules: &'a ExtractionTable,
    context: RuleContext,
    quotas: HashMap<RecordType, usize>,
    default_quota: Option<usize>,
    expandable_type: Option<RecordType>,
    queue: VecDeque<FetchRequest>,
    seen: HashSet<RequestKey>,
    downloaded_ids: HashMap<RecordType, HashSet<String>>,
    downloaded_count: HashMap<RecordType, usize>,
    discovered: BTreeMap<RecordType, BTreeSet<String>>,
    resolution_done: bool,
    requests_issued: usize,
    records_retrieved: usize,
    malformed_references: usize,
    started: Instant,
    received: Vec<RemoteRecord>,
}

impl<'a> PullRun<'a> {
    /// Start a run. Seeds are not enqueued; see [`PullRun::enqueue`].
    pub fn new(config: &PullConfig, rules: &'a ExtractionTable) -> Self {
        Self {
            rules,
            context: config.rule_context(),
            quotas: config.quotas.clone().into_iter().collect(),
            default_quota: config.default_quota,
            expandable_type: config.expandable_type.clone(),
            queue: VecDeque::new(),
            seen: HashSet::new(),
            downloaded_ids: HashMap::new(),
            downloaded_count: HashMap::new(),
            discovered: BTreeMap::new(),
            resolution_done: false,
            requests_issued: 0,
            records_retrieved: 0,
            malformed_references: 0,
            started: Instant::now(),
            received: Vec::new(),
        }
    }

    /// Quota of a type; `None` means unlimited.
    pub fn quota(&self, record_type: &RecordType) -> Option<usize> {
        self.quotas.get(record_type).copied().or(self.default_quota)
    }

    /// Distinct records retained for a type.
    pub fn downloaded_ids(&self, record_type: &RecordType) -> usize {
        self.downloaded_ids.get(record_type).map_or(0, HashSet::len)
    }

    /// Records received for a type.
    pub fn downloaded_count(&self, record_type: &RecordType) -> usize {
        self.downloaded_count.get(record_type).copied().unwrap_or(0)
    }

    /// Records the type may still retain; `None` means unlimited.
    pub fn remaining_quota(&self, record_type: &RecordType) -> Option<usize> {
        self.quota(record_type)
            .map(|quota| quota.saturating_sub(self.downloaded_ids(record_type)))
    }

    fn under_quota(&self, record_type: &RecordType) -> bool {
        self.remaining_quota(record_type).map_or(true, |left| left > 0)
    }

    /// Number of requests waiting.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Prepare a search for the queue: drop it if its key was seen or its type
    /// is at quota, otherwise cap its page size at the remaining quota.
    fn admit(&mut self, mut search: SearchRequest) -> Option<SearchRequest> {
        if self.seen.contains(&search.key()) {
            debug!("Skipping duplicate search {:?}", search.key());
            return None;
        }
        if !self.under_quota(&search.record_type) {
            debug!("Skipping search for {}: quota reached", search.record_type);
            return None;
        }

        if search.cursor.is_none() {
            let wanted = search.count.unwrap_or(self.context.page_size);
            let capped = match self.remaining_quota(&search.record_type) {
                Some(left) => wanted.min(u32::try_from(left).unwrap_or(u32::MAX)),
                None => wanted,
            };
            search.count = Some(capped);
        }

        self.seen.insert(search.key());
        Some(search)
    }

    /// Add a request to the queue unless an equal one was already seen in
    /// this run. Returns whether it was enqueued.
    pub fn enqueue(&mut self, request: FetchRequest) -> bool {
        let admitted = match request {
            FetchRequest::Search(search) => self.admit(search).map(FetchRequest::Search),
            FetchRequest::Batch(searches) => {
                let searches: Vec<SearchRequest> = searches
                    .into_iter()
                    .filter_map(|search| self.admit(search))
                    .collect();
                (!searches.is_empty()).then_some(FetchRequest::Batch(searches))
            }
            other => {
                let key = other.key();
                if self.seen.insert(key) {
                    Some(other)
                } else {
                    None
                }
            }
        };

        match admitted {
            Some(request) => {
                self.queue.push_back(request);
                true
            }
            None => false,
        }
    }

    /// Lookup requests for every discovered foreign id not yet downloaded.
    fn resolution_requests(&self) -> Vec<FetchRequest> {
        let mut lookups = Vec::new();
        for (record_type, ids) in &self.discovered {
            let known = self.downloaded_ids.get(record_type);
            let missing: Vec<&str> = ids
                .iter()
                .filter(|id| known.map_or(true, |known| !known.contains(*id)))
                .map(String::as_str)
                .collect();

            for chunk in missing.chunks(self.context.id_batch_size.max(1)) {
                let count = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
                lookups.push(
                    SearchRequest::new(record_type.clone())
                        .with_param("_id", chunk.join(","))
                        .with_count(count),
                );
            }
        }
        into_batches(lookups, self.context.max_requests_per_envelope)
    }

    /// Next request to execute, or the end-of-run summary.
    ///
    /// Once the queue drains, the resolution pass runs exactly once; after
    /// that an empty queue means the run is complete. Calling again after
    /// completion keeps returning `Complete`.
    pub fn next_request(&mut self) -> PullStep {
        if self.queue.is_empty() && !self.resolution_done {
            self.resolution_done = true;
            let lookups = self.resolution_requests();
            debug!("Resolution pass: {} lookup request(s)", lookups.len());
            for lookup in lookups {
                self.enqueue(lookup);
            }
        }

        match self.queue.pop_front() {
            Some(request) => {
                self.requests_issued += 1;
                PullStep::Fetch(request)
            }
            None => PullStep::Complete(self.summary()),
        }
    }

    /// Process the response to the last issued request.
    ///
    /// # Errors
    /// - `RemoteRejected` for an error envelope; records received earlier in
    ///   the run are kept
    pub fn on_response(&mut self, envelope: ResponseEnvelope) -> Result<()> {
        match envelope {
            ResponseEnvelope::Error { diagnostics } => Err(Error::RemoteRejected(diagnostics)),
            ResponseEnvelope::Pointers(references) => {
                for reference in references {
                    if self.expandable_type.as_ref() == Some(&reference.record_type) {
                        self.enqueue(FetchRequest::Expand(reference));
                    } else {
                        debug!("Ignoring pointer to {}", reference);
                    }
                }
                Ok(())
            }
            ResponseEnvelope::Page(page) => {
                self.process_page(&page, false);
                Ok(())
            }
            ResponseEnvelope::Single(record) => {
                self.accept(record);
                Ok(())
            }
        }
    }

    fn process_page(&mut self, page: &SearchPage, nested: bool) {
        for record in page.records() {
            self.accept(record.clone());
        }

        for sub_page in page.sub_pages() {
            if nested {
                warn!("Ignoring page nested more than one level deep");
            } else {
                self.process_page(sub_page, true);
            }
        }

        let extraction = self.rules.extract(page, &self.context);
        for request in extraction.requests {
            self.enqueue(request);
        }
        for reference in extraction.discovered {
            self.discover(reference.record_type, reference.id);
        }
        for raw in &extraction.malformed {
            warn!("Skipping malformed reference {:?} in {} page", raw, page.record_type);
        }
        self.malformed_references += extraction.malformed.len();

        if let Some(link) = &page.next_link {
            if self.under_quota(&page.record_type) {
                let continuation = SearchRequest::new(page.record_type.clone()).continuation(link);
                self.enqueue(FetchRequest::Search(continuation));
            } else {
                debug!("Dropping next link for {}: quota reached", page.record_type);
            }
        }
    }

    fn discover(&mut self, record_type: RecordType, id: String) {
        if self.resolution_done {
            debug!("Ignoring {}/{} discovered after resolution", record_type, id);
            return;
        }
        let known = self
            .downloaded_ids
            .get(&record_type)
            .is_some_and(|ids| ids.contains(&id));
        if !known {
            self.discovered.entry(record_type).or_default().insert(id);
        }
    }

    fn accept(&mut self, record: RemoteRecord) {
        let record_type = record.reference.record_type.clone();
        let quota = self.quota(&record_type);
        *self.downloaded_count.entry(record_type.clone()).or_default() += 1;

        let ids = self.downloaded_ids.entry(record_type.clone()).or_default();
        if !ids.contains(&record.reference.id) {
            if quota.is_some_and(|quota| ids.len() >= quota) {
                debug!("Dropping {}: quota reached", record.reference);
                return;
            }
            ids.insert(record.reference.id.clone());
        }

        if let Some(pending) = self.discovered.get_mut(&record_type) {
            pending.remove(&record.reference.id);
        }
        self.records_retrieved += 1;
        self.received.push(record);
    }

    /// Records accepted since the last call.
    pub fn take_records(&mut self) -> Vec<RemoteRecord> {
        std::mem::take(&mut self.received)
    }

    /// Snapshot of the run counters.
    pub fn summary(&self) -> RunSummary {
        let mut per_type = BTreeMap::new();
        for (record_type, total) in &self.downloaded_count {
            per_type.insert(
                record_type.clone(),
                TypeCount {
                    unique: self.downloaded_ids(record_type),
                    total: *total,
                },
            );
        }

        RunSummary {
            records_retrieved: self.records_retrieved,
            requests_issued: self.requests_issued,
            elapsed: self.started.elapsed(),
            per_type,
            malformed_references: self.malformed_references,
        }
    }
}
