//! Transport abstraction for recordsync.
//!
//! This module provides the wire vocabulary exchanged with a record server
//! (fetch requests, response envelopes, upload envelopes and outcomes), a
//! trait-based interface for executing them, and a registry for resolving
//! transports by name.
//!
//! # Design Principles
//! - The sync engine never performs network calls itself; it hands requests
//!   to a `RemoteTransport` and processes whatever envelope comes back
//! - Fetches are idempotent reads and may be re-issued on transport failure
//! - Uploads are not guaranteed idempotent
//! - A transport either returns an outcome or an error, never both

pub mod http;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod request;
pub mod response;
pub mod upload;

pub use http::{HttpConfig, HttpTransport};
pub use memory::ScriptedTransport;
pub use provider::RemoteTransport;
pub use registry::{create_default_registry, TransportFactory, TransportRegistry};
pub use request::{FetchRequest, PageCursor, RequestKey, SearchRequest};
pub use response::{PageEntry, RemoteRecord, ResponseEnvelope, SearchPage};
pub use upload::{HttpVerb, OperationResult, UploadEnvelope, UploadOperation, UploadOutcome};
