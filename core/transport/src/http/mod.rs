//! HTTP transport for REST record servers.
//!
//! Searches, reads and `$everything` expansions are plain GETs; several
//! searches travel together as a `batch` bundle. Uploads with one operation
//! are sent as direct requests, larger envelopes as a `transaction` bundle.

mod bundle;
mod client;

pub use bundle::{
    batch_bundle, outcome_diagnostics, parse_fetch_response, parse_transaction_response,
    record_from_resource, transaction_bundle,
};
pub use client::{HttpConfig, HttpTransport};
