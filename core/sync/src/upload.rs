//! Upload batching: patches to network envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use recordsync_common::ChangeKind;
use recordsync_transport::{HttpVerb, UploadEnvelope, UploadOperation};

use crate::patch::Patch;

/// Verb used for records created locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateVerb {
    /// Server assigns the id.
    Post,
    /// Client id is kept.
    Put,
}

/// Verb used for modified records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateVerb {
    /// Send the JSON patch document.
    Patch,
    /// Send the full snapshot.
    Put,
}

/// How many patches go into one grouped envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupPolicy {
    /// At most `n` operations per envelope.
    MaxOperations(usize),
    /// Cumulative serialized body size of at most `n` bytes. An envelope
    /// always takes at least one operation, even an oversized one.
    MaxBytes(usize),
}

/// Batching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchMode {
    /// One envelope per patch.
    Individual,
    /// Several patches per envelope.
    Grouped(GroupPolicy),
}

/// Upload configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Verb for inserts.
    pub create_verb: CreateVerb,
    /// Verb for updates.
    pub update_verb: UpdateVerb,
    /// Batching mode.
    pub mode: BatchMode,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            create_verb: CreateVerb::Post,
            update_verb: UpdateVerb::Patch,
            mode: BatchMode::Individual,
        }
    }
}

impl UploadConfig {
    /// Set the create verb.
    pub fn with_create_verb(mut self, verb: CreateVerb) -> Self {
        self.create_verb = verb;
        self
    }

    /// Set the update verb.
    pub fn with_update_verb(mut self, verb: UpdateVerb) -> Self {
        self.update_verb = verb;
        self
    }

    /// Set the batching mode.
    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Map a patch to its network operation.
    pub fn operation_for(&self, patch: &Patch) -> UploadOperation {
        let (verb, body) = match patch.kind {
            ChangeKind::Insert => {
                let verb = match self.create_verb {
                    CreateVerb::Post => HttpVerb::Post,
                    CreateVerb::Put => HttpVerb::Put,
                };
                (verb, patch.body.clone())
            }
            ChangeKind::Update => match self.update_verb {
                UpdateVerb::Patch => (HttpVerb::Patch, patch.body.clone()),
                UpdateVerb::Put => (
                    HttpVerb::Put,
                    patch.snapshot.clone().unwrap_or_else(|| patch.body.clone()),
                ),
            },
            ChangeKind::Delete => (HttpVerb::Delete, Value::Null),
        };

        UploadOperation {
            verb,
            kind: patch.kind,
            target: patch.record.clone(),
            body,
        }
    }
}

/// Group patches into envelopes.
///
/// Patches are placed in order of their oldest journal token; envelopes come
/// out in that order too.
pub fn batch(patches: &[Patch], config: &UploadConfig) -> Vec<UploadEnvelope> {
    let mut ordered: Vec<&Patch> = patches.iter().collect();
    ordered.sort_by_key(|patch| patch.first_token());

    let mut envelopes = Vec::new();
    let mut current = UploadEnvelope::new();

    for patch in ordered {
        let operation = config.operation_for(patch);
        let full = match config.mode {
            BatchMode::Individual => !current.is_empty(),
            BatchMode::Grouped(GroupPolicy::MaxOperations(limit)) => current.len() >= limit.max(1),
            BatchMode::Grouped(GroupPolicy::MaxBytes(limit)) => {
                !current.is_empty() && current.body_size() + operation.body_size() > limit
            }
        };
        if full {
            envelopes.push(std::mem::take(&mut current));
        }
        current.push(operation, patch.tokens.clone());
    }

    if !current.is_empty() {
        envelopes.push(current);
    }
    envelopes
}
