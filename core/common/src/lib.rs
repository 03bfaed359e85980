//! Common types shared across the recordsync crates.
//!
//! This module provides the vocabulary both halves of the sync engine speak:
//! record identity, server-assigned metadata, and the local change journal
//! entries that feed the upload pipeline.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChangeKind, ChangeToken, LocalChange, RecordMetadata, RecordRef, RecordType};
