//! Per-record sync state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use recordsync_common::{Error, RecordMetadata, RecordRef, RecordType, Result};

/// Sync status for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Record matches the last server acknowledgement or download.
    Synced,
    /// Local changes pending upload.
    LocalModified,
    /// The server acknowledged a change but its version could not be read.
    Stale,
}

/// A locally held record with its sync state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Identity of the record.
    pub reference: RecordRef,
    /// Current local payload.
    pub body: Value,
    /// Version information from the last acknowledged upload.
    pub metadata: Option<RecordMetadata>,
    /// Last modification time known from the server.
    pub remote_modified: Option<DateTime<Utc>>,
    /// Current sync status.
    pub status: SyncStatus,
    /// Last time the record was in sync.
    pub last_synced: Option<DateTime<Utc>>,
}

impl RecordEntry {
    /// Create an entry for a record created or edited locally.
    pub fn new_local(reference: RecordRef, body: Value) -> Self {
        Self {
            reference,
            body,
            metadata: None,
            remote_modified: None,
            status: SyncStatus::LocalModified,
            last_synced: None,
        }
    }

    /// Create an entry for a downloaded record.
    ///
    /// The server modification time is read from `meta.lastUpdated` when present.
    pub fn new_synced(reference: RecordRef, body: Value) -> Self {
        let remote_modified = body
            .pointer("/meta/lastUpdated")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));

        Self {
            reference,
            body,
            metadata: None,
            remote_modified,
            status: SyncStatus::Synced,
            last_synced: Some(Utc::now()),
        }
    }

    /// Record acknowledged version information.
    pub fn apply_metadata(&mut self, metadata: RecordMetadata) {
        self.remote_modified = Some(metadata.last_modified);
        self.metadata = Some(metadata);
    }

    /// Mark as synced.
    pub fn mark_synced(&mut self) {
        self.status = SyncStatus::Synced;
        self.last_synced = Some(Utc::now());
    }

    /// Replace the payload after a local edit.
    pub fn mark_local_modified(&mut self, body: Value) {
        self.body = body;
        if self.status == SyncStatus::Synced {
            self.status = SyncStatus::LocalModified;
        }
    }

    /// Mark as stale: freshness unknown until the next round trip.
    pub fn mark_stale(&mut self) {
        self.status = SyncStatus::Stale;
    }
}

/// All locally held records, keyed by identity.
///
/// Serialized as a list because record identities are not string keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<RecordEntry>", into = "Vec<RecordEntry>")]
pub struct RecordTable {
    entries: HashMap<RecordRef, RecordEntry>,
}

impl From<Vec<RecordEntry>> for RecordTable {
    fn from(entries: Vec<RecordEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.reference.clone(), entry))
                .collect(),
        }
    }
}

impl From<RecordTable> for Vec<RecordEntry> {
    fn from(table: RecordTable) -> Self {
        let mut entries: Vec<RecordEntry> = table.entries.into_values().collect();
        entries.sort_by(|a, b| a.reference.cmp(&b.reference));
        entries
    }
}

impl RecordTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for a record.
    pub fn get(&self, reference: &RecordRef) -> Option<&RecordEntry> {
        self.entries.get(reference)
    }

    /// Get the mutable entry for a record.
    pub fn get_mut(&mut self, reference: &RecordRef) -> Option<&mut RecordEntry> {
        self.entries.get_mut(reference)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, entry: RecordEntry) {
        self.entries.insert(entry.reference.clone(), entry);
    }

    /// Remove an entry.
    pub fn remove(&mut self, reference: &RecordRef) -> Option<RecordEntry> {
        self.entries.remove(reference)
    }

    /// Move an entry to a new id, updating the `id` member of its payload.
    ///
    /// # Errors
    /// - `AlreadyExists` if a record with the new identity is present
    pub fn rename(&mut self, old: &RecordRef, new: &RecordRef) -> Result<()> {
        if self.entries.contains_key(new) {
            return Err(Error::AlreadyExists(format!("Record {} already exists", new)));
        }
        if let Some(mut entry) = self.entries.remove(old) {
            entry.reference = new.clone();
            if let Some(body) = entry.body.as_object_mut() {
                body.insert("id".to_string(), Value::String(new.id.clone()));
            }
            self.insert(entry);
        }
        Ok(())
    }

    /// Get all entries.
    pub fn entries(&self) -> impl Iterator<Item = &RecordEntry> {
        self.entries.values()
    }

    /// Get entries with a specific status.
    pub fn entries_with_status(&self, status: SyncStatus) -> Vec<&RecordEntry> {
        self.entries.values().filter(|e| e.status == status).collect()
    }

    /// Count entries by status.
    pub fn count_by_status(&self) -> HashMap<SyncStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    /// Latest server modification time among records of a type.
    pub fn latest_modified(&self, record_type: &RecordType) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .filter(|e| &e.reference.record_type == record_type)
            .filter_map(|e| e.remote_modified)
            .max()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn patient(id: &str) -> RecordRef {
        RecordRef::new("Patient", id)
    }

    #[test]
    fn test_synced_entry_reads_last_updated() {
        let entry = RecordEntry::new_synced(
            patient("1"),
            json!({"id": "1", "meta": {"lastUpdated": "2024-03-01T12:00:00Z"}}),
        );
        assert_eq!(entry.status, SyncStatus::Synced);
        assert_eq!(
            entry.remote_modified,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_local_modification() {
        let mut entry = RecordEntry::new_synced(patient("1"), json!({"v": 1}));
        entry.mark_local_modified(json!({"v": 2}));
        assert_eq!(entry.status, SyncStatus::LocalModified);
        assert_eq!(entry.body, json!({"v": 2}));

        entry.mark_stale();
        entry.mark_local_modified(json!({"v": 3}));
        assert_eq!(entry.status, SyncStatus::Stale);
    }

    #[test]
    fn test_rename_moves_entry() {
        let mut table = RecordTable::new();
        table.insert(RecordEntry::new_local(patient("tmp"), json!({"id": "tmp"})));
        table.rename(&patient("tmp"), &patient("42")).unwrap();

        assert!(table.get(&patient("tmp")).is_none());
        assert_eq!(table.get(&patient("42")).unwrap().body, json!({"id": "42"}));

        table.insert(RecordEntry::new_local(patient("43"), json!({})));
        assert!(matches!(
            table.rename(&patient("42"), &patient("43")),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_latest_modified_per_type() {
        let mut table = RecordTable::new();
        table.insert(RecordEntry::new_synced(
            patient("1"),
            json!({"meta": {"lastUpdated": "2024-01-01T00:00:00Z"}}),
        ));
        table.insert(RecordEntry::new_synced(
            patient("2"),
            json!({"meta": {"lastUpdated": "2024-06-01T00:00:00Z"}}),
        ));
        table.insert(RecordEntry::new_synced(RecordRef::new("Observation", "1"), json!({})));

        assert_eq!(
            table.latest_modified(&"Patient".into()),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(table.latest_modified(&"Observation".into()), None);
    }

    #[test]
    fn test_table_serialization() {
        let mut table = RecordTable::new();
        table.insert(RecordEntry::new_local(patient("1"), json!({"id": "1"})));
        table.insert(RecordEntry::new_synced(patient("2"), json!({"id": "2"})));

        let json = table.to_json().unwrap();
        let restored = RecordTable::from_json(&json).unwrap();
        assert_eq!(restored, table);

        let counts = restored.count_by_status();
        assert_eq!(counts.get(&SyncStatus::LocalModified), Some(&1));
        assert_eq!(counts.get(&SyncStatus::Synced), Some(&1));
    }
}
