//! Remote transport trait definition.

use async_trait::async_trait;

use recordsync_common::Result;

use crate::request::FetchRequest;
use crate::response::ResponseEnvelope;
use crate::upload::{UploadEnvelope, UploadOutcome};

/// Executes pull and push exchanges against a record server.
///
/// Implementations handle their own authentication, headers and wire
/// encoding. The sync engine awaits exactly one call at a time per run.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Execute one fetch.
    ///
    /// # Postconditions
    /// - A structured server refusal is returned as `ResponseEnvelope::Error`,
    ///   not as `Err`
    ///
    /// # Errors
    /// - `Transport` / `Timeout` when no response was received; the request
    ///   is an idempotent read and may be re-issued
    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseEnvelope>;

    /// Submit one upload envelope.
    ///
    /// # Postconditions
    /// - `PerOperation` results are aligned with `envelope.operations()`
    ///
    /// # Errors
    /// - `Transport` / `Timeout` when no outcome was received; the server may
    ///   or may not have applied the operations
    async fn upload(&self, envelope: &UploadEnvelope) -> Result<UploadOutcome>;
}
