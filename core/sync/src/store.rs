//! Local store contract and the journal-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use recordsync_common::{
    ChangeKind, ChangeToken, Error, LocalChange, RecordMetadata, RecordRef, RecordType, Result,
};
use recordsync_transport::RemoteRecord;

use crate::state::{RecordEntry, RecordTable, SyncStatus};

/// Operations the sync engine needs from the local store.
///
/// The store owns the record table, the change journal and per-record
/// metadata; the engine never touches them directly.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Append a change to the journal and return its token.
    ///
    /// # Postconditions
    /// - The token is greater than every token handed out before
    async fn append_change(
        &self,
        record: &RecordRef,
        kind: ChangeKind,
        payload: Option<Value>,
        base: Option<Value>,
    ) -> Result<ChangeToken>;

    /// Pending changes in token order, optionally for one record only.
    async fn list_pending_changes(&self, record: Option<&RecordRef>) -> Result<Vec<LocalChange>>;

    /// Remove journal entries. Unknown tokens are ignored.
    async fn delete_changes(&self, tokens: &[ChangeToken]) -> Result<()>;

    /// Store version information acknowledged by the server.
    async fn write_metadata(&self, record: &RecordRef, metadata: RecordMetadata) -> Result<()>;

    /// Move a record, its metadata and its pending changes to a new id.
    async fn rewrite_id(&self, old: &RecordRef, new_id: &str) -> Result<RecordRef>;

    /// Flag a record whose freshness is unknown.
    async fn mark_stale(&self, record: &RecordRef) -> Result<()>;

    /// Keep records received by a pull run.
    async fn save_downloaded(&self, records: &[RemoteRecord]) -> Result<()>;

    /// Latest server modification time held for a type.
    async fn latest_modified(&self, record_type: &RecordType) -> Result<Option<DateTime<Utc>>>;
}

/// Name of the persisted store file inside the store directory.
const STORE_FILE: &str = "store.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    last_token: u64,
    records: RecordTable,
    journal: Vec<LocalChange>,
}

impl StoreData {
    fn has_pending(&self, record: &RecordRef) -> bool {
        self.journal.iter().any(|change| &change.record == record)
    }

    fn next_token(&mut self) -> ChangeToken {
        self.last_token += 1;
        ChangeToken(self.last_token)
    }
}

/// In-memory record table and change journal with optional JSON persistence.
///
/// When opened on a directory, the whole store is rewritten to
/// `store.json` after every mutation.
pub struct JournalStore {
    data: RwLock<StoreData>,
    path: Option<PathBuf>,
}

impl JournalStore {
    /// Create an empty store that is not persisted.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            path: None,
        }
    }

    /// Open a store persisted in `dir`, loading previous contents.
    ///
    /// # Errors
    /// - `Io` if the directory cannot be created or the file read
    /// - `Serialization` if the file is not a valid store
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;

        let path = dir.join(STORE_FILE);
        let data = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            StoreData::default()
        };

        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
        })
    }

    async fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn journal(data: &mut StoreData, change: LocalChange) -> ChangeToken {
        let token = change.token;
        data.journal.push(change);
        token
    }

    /// Create a record locally under a temporary id and journal the insert.
    pub async fn insert_local(
        &self,
        record_type: impl Into<RecordType>,
        mut payload: Value,
    ) -> Result<RecordRef> {
        let record = RecordRef::new(record_type, Uuid::new_v4().to_string());
        if let Some(body) = payload.as_object_mut() {
            body.insert("id".to_string(), Value::String(record.id.clone()));
        }

        let mut data = self.data.write().await;
        if data.records.get(&record).is_some() {
            return Err(Error::AlreadyExists(format!("Record {} already exists", record)));
        }
        data.records
            .insert(RecordEntry::new_local(record.clone(), payload.clone()));
        let token = data.next_token();
        Self::journal(
            &mut data,
            LocalChange {
                token,
                record: record.clone(),
                kind: ChangeKind::Insert,
                payload: Some(payload),
                base: None,
                created_at: Utc::now(),
            },
        );
        self.persist(&data).await?;

        debug!("Inserted {} locally ({})", record, token);
        Ok(record)
    }

    /// Replace a record's payload and journal the update.
    ///
    /// # Errors
    /// - `NotFound` if the record is not held locally
    pub async fn update_local(&self, record: &RecordRef, payload: Value) -> Result<ChangeToken> {
        let mut data = self.data.write().await;
        let entry = data
            .records
            .get_mut(record)
            .ok_or_else(|| Error::NotFound(format!("Record {} not found", record)))?;
        let base = entry.body.clone();
        entry.mark_local_modified(payload.clone());

        let token = data.next_token();
        Self::journal(
            &mut data,
            LocalChange {
                token,
                record: record.clone(),
                kind: ChangeKind::Update,
                payload: Some(payload),
                base: Some(base),
                created_at: Utc::now(),
            },
        );
        self.persist(&data).await?;
        Ok(token)
    }

    /// Remove a record locally and journal the delete.
    ///
    /// # Errors
    /// - `NotFound` if the record is not held locally
    pub async fn delete_local(&self, record: &RecordRef) -> Result<ChangeToken> {
        let mut data = self.data.write().await;
        data.records
            .remove(record)
            .ok_or_else(|| Error::NotFound(format!("Record {} not found", record)))?;

        let token = data.next_token();
        Self::journal(
            &mut data,
            LocalChange {
                token,
                record: record.clone(),
                kind: ChangeKind::Delete,
                payload: None,
                base: None,
                created_at: Utc::now(),
            },
        );
        self.persist(&data).await?;
        Ok(token)
    }

    /// Get a record entry.
    pub async fn get(&self, record: &RecordRef) -> Option<RecordEntry> {
        self.data.read().await.records.get(record).cloned()
    }

    /// All record entries, sorted by identity.
    pub async fn records(&self) -> Vec<RecordEntry> {
        let table = self.data.read().await.records.clone();
        Vec::from(table)
    }

    /// Metadata of a record, if any was acknowledged.
    pub async fn metadata(&self, record: &RecordRef) -> Option<RecordMetadata> {
        self.data
            .read()
            .await
            .records
            .get(record)
            .and_then(|entry| entry.metadata.clone())
    }

    /// Records flagged stale.
    pub async fn stale_records(&self) -> Vec<RecordRef> {
        let data = self.data.read().await;
        let mut stale: Vec<RecordRef> = data
            .records
            .entries_with_status(SyncStatus::Stale)
            .into_iter()
            .map(|entry| entry.reference.clone())
            .collect();
        stale.sort();
        stale
    }
}

impl Default for JournalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for JournalStore {
    async fn append_change(
        &self,
        record: &RecordRef,
        kind: ChangeKind,
        payload: Option<Value>,
        base: Option<Value>,
    ) -> Result<ChangeToken> {
        let mut data = self.data.write().await;
        let token = data.next_token();
        Self::journal(
            &mut data,
            LocalChange {
                token,
                record: record.clone(),
                kind,
                payload,
                base,
                created_at: Utc::now(),
            },
        );
        self.persist(&data).await?;
        Ok(token)
    }

    async fn list_pending_changes(&self, record: Option<&RecordRef>) -> Result<Vec<LocalChange>> {
        let data = self.data.read().await;
        let mut changes: Vec<LocalChange> = data
            .journal
            .iter()
            .filter(|change| record.map_or(true, |r| &change.record == r))
            .cloned()
            .collect();
        changes.sort_by_key(|change| change.token);
        Ok(changes)
    }

    async fn delete_changes(&self, tokens: &[ChangeToken]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }

        let tokens: HashSet<ChangeToken> = tokens.iter().copied().collect();
        let mut data = self.data.write().await;

        let mut touched = Vec::new();
        data.journal.retain(|change| {
            if tokens.contains(&change.token) {
                touched.push(change.record.clone());
                false
            } else {
                true
            }
        });

        for record in touched {
            if data.has_pending(&record) {
                continue;
            }
            if let Some(entry) = data.records.get_mut(&record) {
                if entry.status == SyncStatus::LocalModified {
                    entry.mark_synced();
                }
            }
        }

        self.persist(&data).await
    }

    async fn write_metadata(&self, record: &RecordRef, metadata: RecordMetadata) -> Result<()> {
        let mut data = self.data.write().await;
        match data.records.get_mut(record) {
            Some(entry) => entry.apply_metadata(metadata),
            None => {
                debug!("No local record {} for acknowledged metadata", record);
                return Ok(());
            }
        }
        self.persist(&data).await
    }

    async fn rewrite_id(&self, old: &RecordRef, new_id: &str) -> Result<RecordRef> {
        let new = old.with_id(new_id);
        if &new == old {
            return Ok(new);
        }

        let mut data = self.data.write().await;
        data.records.rename(old, &new)?;
        for change in data.journal.iter_mut().filter(|change| &change.record == old) {
            change.record = new.clone();
            for state in [&mut change.payload, &mut change.base].into_iter().flatten() {
                if let Some(body) = state.as_object_mut() {
                    body.insert("id".to_string(), Value::String(new.id.clone()));
                }
            }
        }
        self.persist(&data).await?;

        debug!("Rewrote {} to {}", old, new);
        Ok(new)
    }

    async fn mark_stale(&self, record: &RecordRef) -> Result<()> {
        let mut data = self.data.write().await;
        if let Some(entry) = data.records.get_mut(record) {
            entry.mark_stale();
        }
        self.persist(&data).await
    }

    async fn save_downloaded(&self, records: &[RemoteRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut data = self.data.write().await;
        for record in records {
            if data.has_pending(&record.reference) {
                warn!(
                    "Keeping local version of {}: it has pending changes",
                    record.reference
                );
                continue;
            }
            data.records.insert(RecordEntry::new_synced(
                record.reference.clone(),
                record.body.clone(),
            ));
        }
        self.persist(&data).await
    }

    async fn latest_modified(&self, record_type: &RecordType) -> Result<Option<DateTime<Utc>>> {
        Ok(self.data.read().await.records.latest_modified(record_type))
    }
}
