//! RecordSync Sync Engine
//!
//! This crate reconciles a local record store with a remote record server:
//! - Pull: a fetch-queue orchestrator with per-type quotas, extraction rules
//!   that fan out into related searches, and a resolution pass for foreign ids
//! - Push: squashing the change journal into patches, batching them into
//!   upload envelopes and consolidating the server's answers
//! - Retry strategy with exponential backoff
//! - Manual and periodic scheduling

pub mod config;
pub mod consolidate;
pub mod diff;
pub mod engine;
pub mod extract;
pub mod fetch;
pub mod patch;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod upload;

// Re-export main types
pub use config::{PullConfig, SyncConfig};
pub use consolidate::{
    ConsolidationReport, Consolidator, StaleTagPolicy, UploadFailure, UploadFailurePolicy,
};
pub use diff::PatchOperation;
pub use engine::{PushReport, SummarySink, SyncEngine, SyncReport, TracingSummarySink};
pub use extract::{
    DeferredReferences, Extraction, ExtractionRule, ExtractionTable, FanOutTarget,
    ForeignKeyFanOut, RuleContext, RuleSpec,
};
pub use fetch::{PullRun, PullStep, RunSummary, TypeCount};
pub use patch::{generate_patches, squash, Patch};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{RecordEntry, RecordTable, SyncStatus};
pub use store::{JournalStore, LocalStore};
pub use upload::{batch, BatchMode, CreateVerb, GroupPolicy, UpdateVerb, UploadConfig};
