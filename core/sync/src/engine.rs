//! Core sync engine that drives both halves of a sync.

use chrono::SecondsFormat;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use recordsync_common::{ChangeToken, Error, Result};
use recordsync_transport::{FetchRequest, RemoteTransport, SearchRequest, UploadEnvelope};

use crate::config::SyncConfig;
use crate::consolidate::{ConsolidationReport, Consolidator};
use crate::extract::ExtractionTable;
use crate::fetch::{PullRun, PullStep, RunSummary};
use crate::patch::{generate_patches, Patch};
use crate::retry::RetryExecutor;
use crate::scheduler::SyncRequest;
use crate::store::LocalStore;
use crate::upload::batch;

/// Receives the summary of every pull run, finished or aborted.
pub trait SummarySink: Send + Sync {
    /// Handle one summary.
    fn record(&self, summary: &RunSummary);
}

/// Logs run summaries through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSummarySink;

impl SummarySink for TracingSummarySink {
    fn record(&self, summary: &RunSummary) {
        info!("Pull run finished: {}", summary);
        if summary.malformed_references > 0 {
            warn!(
                "{} malformed reference(s) skipped",
                summary.malformed_references
            );
        }
    }
}

/// Result of one push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushReport {
    /// Envelopes uploaded and consolidated.
    pub envelopes_uploaded: usize,
    /// Patches left out because another push holds their tokens.
    pub patches_skipped: usize,
    /// Consolidation of every uploaded envelope.
    pub consolidation: ConsolidationReport,
}

/// Result of a scheduled or full sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Push side, when it ran.
    pub push: Option<PushReport>,
    /// Pull side, when it ran.
    pub pull: Option<RunSummary>,
    /// Wall-clock time of the whole sync.
    pub duration: Duration,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(push) = &self.push {
            write!(
                f,
                "pushed {} envelope(s), {} change(s) cleared, {} refused; ",
                push.envelopes_uploaded,
                push.consolidation.tokens_removed.len(),
                push.consolidation.failures.len()
            )?;
        }
        if let Some(pull) = &self.pull {
            write!(f, "pulled {}; ", pull)?;
        }
        write!(f, "took {:.1?}", self.duration)
    }
}

/// Drives pull runs and pushes against one transport and one store.
pub struct SyncEngine<T: RemoteTransport + ?Sized, S: LocalStore + ?Sized> {
    transport: Arc<T>,
    store: Arc<S>,
    config: SyncConfig,
    rules: ExtractionTable,
    retry: RetryExecutor,
    consolidator: Consolidator,
    sink: Arc<dyn SummarySink>,
    /// Tokens of patches currently being uploaded.
    in_flight: Mutex<HashSet<ChangeToken>>,
    cancelled: AtomicBool,
}

impl<T: RemoteTransport + ?Sized, S: LocalStore + ?Sized> SyncEngine<T, S> {
    /// Create an engine. Extraction rules are built from `config.pull.rules`.
    pub fn new(transport: Arc<T>, store: Arc<S>, config: SyncConfig) -> Self {
        let rules = ExtractionTable::from_specs(&config.pull.rules);
        let retry = RetryExecutor::new(config.retry.clone());
        let consolidator = Consolidator::new(config.stale_tag_policy, config.failure_policy);

        Self {
            transport,
            store,
            config,
            rules,
            retry,
            consolidator,
            sink: Arc::new(TracingSummarySink),
            in_flight: Mutex::new(HashSet::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Replace the extraction rules built from the configuration.
    pub fn with_extraction_table(mut self, rules: ExtractionTable) -> Self {
        self.rules = rules;
        self
    }

    /// Replace the summary sink.
    pub fn with_summary_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Stop the current or next operation at its next transport boundary.
    ///
    /// The request is consumed by the first operation that observes it.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            info!("Sync cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Seed searches, narrowed to recent changes in incremental mode.
    async fn seeds(&self) -> Result<Vec<SearchRequest>> {
        let mut seeds = Vec::with_capacity(self.config.pull.seeds.len());
        for seed in &self.config.pull.seeds {
            let mut seed = seed.clone();
            if self.config.pull.incremental {
                if let Some(latest) = self.store.latest_modified(&seed.record_type).await? {
                    let since = latest.to_rfc3339_opts(SecondsFormat::Secs, true);
                    debug!("Incremental seed for {} since {}", seed.record_type, since);
                    seed = seed.with_param("_lastUpdated", format!("gt{}", since));
                }
            }
            seeds.push(seed);
        }
        Ok(seeds)
    }

    /// Run one pull to completion.
    ///
    /// Records are saved after every response, so an aborted run keeps what
    /// it already received. The summary goes to the sink in both cases.
    ///
    /// # Errors
    /// - `RemoteRejected` if the server refused a request
    /// - `Transport` / `Timeout` once retries are exhausted
    /// - `Cancelled` if [`SyncEngine::cancel`] was called
    /// - store errors
    pub async fn pull(&self) -> Result<RunSummary> {
        let mut run = PullRun::new(&self.config.pull, &self.rules);
        for seed in self.seeds().await? {
            run.enqueue(FetchRequest::Search(seed));
        }
        info!("Pull started with {} seed request(s)", run.pending());

        loop {
            let request = match run.next_request() {
                PullStep::Fetch(request) => request,
                PullStep::Complete(summary) => {
                    self.sink.record(&summary);
                    return Ok(summary);
                }
            };

            if let Err(e) = self.check_cancelled() {
                self.sink.record(&run.summary());
                return Err(e);
            }

            debug!("Fetching {:?}", request.key());
            let envelope = match self.retry.execute(|| self.transport.fetch(&request)).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Fetch failed: {}", e);
                    self.sink.record(&run.summary());
                    return Err(e);
                }
            };

            let processed = run.on_response(envelope);
            let records = run.take_records();
            if !records.is_empty() {
                self.store.save_downloaded(&records).await?;
            }
            if let Err(e) = processed {
                warn!("Pull aborted: {}", e);
                self.sink.record(&run.summary());
                return Err(e);
            }
        }
    }

    /// Reserve the tokens of every patch not already held by another push.
    async fn claim(&self, patches: Vec<Patch>) -> (Vec<Patch>, usize) {
        let mut in_flight = self.in_flight.lock().await;
        let mut ready = Vec::with_capacity(patches.len());
        let mut skipped = 0;

        for patch in patches {
            if patch.tokens.iter().any(|token| in_flight.contains(token)) {
                debug!("{} is already being uploaded", patch.record);
                skipped += 1;
                continue;
            }
            in_flight.extend(patch.tokens.iter().copied());
            ready.push(patch);
        }

        (ready, skipped)
    }

    async fn release(&self, patches: &[Patch]) {
        let mut in_flight = self.in_flight.lock().await;
        for token in patches.iter().flat_map(|patch| &patch.tokens) {
            in_flight.remove(token);
        }
    }

    /// Upload and consolidate one envelope, unless the push already stopped.
    async fn upload_one(
        &self,
        envelope: &UploadEnvelope,
        halted: &AtomicBool,
    ) -> Result<Option<ConsolidationReport>> {
        if halted.load(Ordering::SeqCst) {
            debug!("Push stopped, not sending envelope of {} operation(s)", envelope.len());
            return Ok(None);
        }
        self.check_cancelled()?;
        debug!("Uploading envelope of {} operation(s)", envelope.len());

        let retry_uploads = self.config.retry_uploads;
        let outcome = self
            .retry
            .execute_with_condition(
                || self.transport.upload(envelope),
                |e| retry_uploads && e.is_retryable(),
            )
            .await?;

        self.consolidator
            .consolidate(&*self.store, envelope, &outcome)
            .await
            .map(Some)
    }

    /// Upload every pending change.
    ///
    /// Envelopes are uploaded with at most `upload_concurrency` in flight and
    /// consolidated as their outcomes arrive. After the first error no new
    /// envelope is sent, but envelopes already sent run to completion and are
    /// consolidated before that error is returned. Envelopes never sent keep
    /// their journal entries.
    ///
    /// # Errors
    /// - `Transport` / `Timeout` if an upload got no outcome
    /// - `Protocol` if an outcome does not match its envelope
    /// - `Cancelled` if [`SyncEngine::cancel`] was called
    /// - store errors
    pub async fn push(&self) -> Result<PushReport> {
        self.check_cancelled()?;

        let changes = self.store.list_pending_changes(None).await?;
        let (patches, skipped) = self.claim(generate_patches(&changes)).await;
        let envelopes = batch(&patches, &self.config.upload);
        info!(
            "Push started: {} change(s), {} patch(es), {} envelope(s)",
            changes.len(),
            patches.len(),
            envelopes.len()
        );

        let mut report = PushReport {
            patches_skipped: skipped,
            ..PushReport::default()
        };

        let halted = AtomicBool::new(false);
        let mut uploads = stream::iter(0..envelopes.len())
            .map(|index| self.upload_one(&envelopes[index], &halted))
            .buffered(self.config.upload_concurrency.max(1));

        let mut failure = None;
        while let Some(result) = uploads.next().await {
            match result {
                Ok(Some(consolidation)) => {
                    report.envelopes_uploaded += 1;
                    report.consolidation.merge(consolidation);
                }
                Ok(None) => {}
                Err(e) if failure.is_none() => {
                    warn!("Push stopping, waiting for uploads in flight: {}", e);
                    halted.store(true, Ordering::SeqCst);
                    failure = Some(e);
                }
                Err(e) => warn!("Upload in flight failed: {}", e),
            }
        }
        drop(uploads);

        self.release(&patches).await;
        match failure {
            Some(e) => {
                warn!(
                    "Push stopped after {} envelope(s) of {}",
                    report.envelopes_uploaded,
                    envelopes.len()
                );
                Err(e)
            }
            None => {
                info!(
                    "Push finished: {} envelope(s), {} refused operation(s)",
                    report.envelopes_uploaded,
                    report.consolidation.failures.len()
                );
                Ok(report)
            }
        }
    }

    /// Push local changes, then pull.
    pub async fn sync_full(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let push = self.push().await?;
        let pull = self.pull().await?;

        Ok(SyncReport {
            push: Some(push),
            pull: Some(pull),
            duration: started.elapsed(),
        })
    }

    /// Execute a scheduler request.
    ///
    /// # Errors
    /// - `InvalidInput` for `Shutdown`, which the scheduler handles itself
    pub async fn process_request(&self, request: SyncRequest) -> Result<SyncReport> {
        let started = Instant::now();
        match request {
            SyncRequest::Full => self.sync_full().await,
            SyncRequest::Pull => Ok(SyncReport {
                pull: Some(self.pull().await?),
                duration: started.elapsed(),
                ..SyncReport::default()
            }),
            SyncRequest::Push => Ok(SyncReport {
                push: Some(self.push().await?),
                duration: started.elapsed(),
                ..SyncReport::default()
            }),
            SyncRequest::Shutdown => Err(Error::InvalidInput(
                "Shutdown is not a sync request".to_string(),
            )),
        }
    }
}
