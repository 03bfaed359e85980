//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use recordsync_common::RecordType;
use recordsync_transport::SearchRequest;

use crate::consolidate::{StaleTagPolicy, UploadFailurePolicy};
use crate::extract::{RuleContext, RuleSpec};
use crate::retry::RetryConfig;
use crate::upload::UploadConfig;

/// Pull-side configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Searches every run starts with.
    pub seeds: Vec<SearchRequest>,
    /// Maximum distinct records retained per type in one run.
    pub quotas: BTreeMap<RecordType, usize>,
    /// Quota for types missing from `quotas`; `None` means unlimited.
    pub default_quota: Option<usize>,
    /// Maximum ids joined into one lookup search.
    pub id_batch_size: usize,
    /// Maximum searches carried by one batch envelope.
    pub max_requests_per_envelope: usize,
    /// Page size requested from the server.
    pub page_size: u32,
    /// Type expanded with a deep fetch when a pointer list names it.
    pub expandable_type: Option<RecordType>,
    /// Add `_lastUpdated=gt<latest>` to seeds of types already held locally.
    pub incremental: bool,
    /// Extraction rules.
    pub rules: Vec<RuleSpec>,
}

impl Default for PullConfig {
    fn default() -> Self {
        let context = RuleContext::default();
        Self {
            seeds: Vec::new(),
            quotas: BTreeMap::new(),
            default_quota: None,
            id_batch_size: context.id_batch_size,
            max_requests_per_envelope: context.max_requests_per_envelope,
            page_size: context.page_size,
            expandable_type: None,
            incremental: false,
            rules: Vec::new(),
        }
    }
}

impl PullConfig {
    /// Add a seed search.
    pub fn with_seed(mut self, seed: SearchRequest) -> Self {
        self.seeds.push(seed);
        self
    }

    /// Set the quota of a type.
    pub fn with_quota(mut self, record_type: impl Into<RecordType>, quota: usize) -> Self {
        self.quotas.insert(record_type.into(), quota);
        self
    }

    /// Set the quota of types without their own.
    pub fn with_default_quota(mut self, quota: usize) -> Self {
        self.default_quota = Some(quota);
        self
    }

    /// Set the expandable type.
    pub fn with_expandable_type(mut self, record_type: impl Into<RecordType>) -> Self {
        self.expandable_type = Some(record_type.into());
        self
    }

    /// Enable or disable incremental seeds.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Add an extraction rule.
    pub fn with_rule(mut self, rule: RuleSpec) -> Self {
        self.rules.push(rule);
        self
    }

    /// Limits handed to extraction rules.
    pub fn rule_context(&self) -> RuleContext {
        RuleContext {
            page_size: self.page_size,
            id_batch_size: self.id_batch_size,
            max_requests_per_envelope: self.max_requests_per_envelope,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pull side.
    pub pull: PullConfig,
    /// Push side.
    pub upload: UploadConfig,
    /// Handling of acknowledgements without a readable version.
    pub stale_tag_policy: StaleTagPolicy,
    /// Handling of refused operations.
    pub failure_policy: UploadFailurePolicy,
    /// Retry behavior for transport calls.
    pub retry: RetryConfig,
    /// Whether uploads are retried like fetches. Off by default: an upload
    /// whose outcome was lost may have been applied.
    pub retry_uploads: bool,
    /// Envelopes uploaded at the same time.
    pub upload_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull: PullConfig::default(),
            upload: UploadConfig::default(),
            stale_tag_policy: StaleTagPolicy::default(),
            failure_policy: UploadFailurePolicy::default(),
            retry: RetryConfig::default(),
            retry_uploads: false,
            upload_concurrency: 1,
        }
    }
}

impl SyncConfig {
    /// Set the pull configuration.
    pub fn with_pull(mut self, pull: PullConfig) -> Self {
        self.pull = pull;
        self
    }

    /// Set the upload configuration.
    pub fn with_upload(mut self, upload: UploadConfig) -> Self {
        self.upload = upload;
        self
    }

    /// Set the stale tag policy.
    pub fn with_stale_tag_policy(mut self, policy: StaleTagPolicy) -> Self {
        self.stale_tag_policy = policy;
        self
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, policy: UploadFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Retry uploads too.
    pub fn with_retry_uploads(mut self, retry_uploads: bool) -> Self {
        self.retry_uploads = retry_uploads;
        self
    }

    /// Set upload concurrency (at least 1).
    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency.max(1);
        self
    }
}
