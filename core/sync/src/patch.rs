//! Squashing of pending journal entries into one patch per record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use recordsync_common::{ChangeKind, ChangeToken, LocalChange, RecordRef};

use crate::diff;

/// The network-bound form of one record's pending changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Effective kind after squashing.
    pub kind: ChangeKind,
    /// Record the patch applies to.
    pub record: RecordRef,
    /// Full payload for inserts, JSON patch document for updates, `Null` for deletes.
    pub body: Value,
    /// Final full payload, if the record still exists.
    pub snapshot: Option<Value>,
    /// Every journal token folded into this patch, ascending.
    pub tokens: Vec<ChangeToken>,
}

impl Patch {
    /// Oldest token of the patch; patches are ordered by it.
    pub fn first_token(&self) -> Option<ChangeToken> {
        self.tokens.first().copied()
    }
}

/// Squash the changes of a single record into one patch.
///
/// Changes may be given in any order; they are sorted by token first.
/// Returns `None` for an empty input.
pub fn squash(changes: &[LocalChange]) -> Option<Patch> {
    let mut ordered: Vec<&LocalChange> = changes.iter().collect();
    ordered.sort_by_key(|change| change.token);

    let last = *ordered.last()?;
    let record = last.record.clone();
    let tokens: Vec<ChangeToken> = ordered.iter().map(|change| change.token).collect();

    if last.kind == ChangeKind::Delete {
        return Some(Patch {
            kind: ChangeKind::Delete,
            record,
            body: Value::Null,
            snapshot: None,
            tokens,
        });
    }

    // Only the changes after the most recent delete shape the result.
    let start = ordered
        .iter()
        .rposition(|change| change.kind == ChangeKind::Delete)
        .map_or(0, |index| index + 1);
    let segment = &ordered[start..];
    let recreated = start > 0 || segment.iter().any(|change| change.kind == ChangeKind::Insert);
    let payload = last.payload.clone().unwrap_or(Value::Null);

    if recreated {
        return Some(Patch {
            kind: ChangeKind::Insert,
            record,
            body: payload.clone(),
            snapshot: Some(payload),
            tokens,
        });
    }

    let base = segment
        .first()
        .and_then(|change| change.base.clone())
        .unwrap_or(Value::Null);
    let operations = diff::diff(&base, &payload);

    Some(Patch {
        kind: ChangeKind::Update,
        record,
        body: diff::to_document(&operations),
        snapshot: Some(payload),
        tokens,
    })
}

/// Generate one patch per record from the pending journal, ordered by each
/// record's oldest token.
pub fn generate_patches(changes: &[LocalChange]) -> Vec<Patch> {
    let mut by_record: HashMap<&RecordRef, Vec<LocalChange>> = HashMap::new();
    for change in changes {
        by_record.entry(&change.record).or_default().push(change.clone());
    }

    let mut patches: Vec<Patch> = by_record.values().filter_map(|run| squash(run)).collect();
    patches.sort_by_key(Patch::first_token);
    patches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn change(
        token: u64,
        id: &str,
        kind: ChangeKind,
        payload: Option<Value>,
        base: Option<Value>,
    ) -> LocalChange {
        LocalChange {
            token: ChangeToken(token),
            record: RecordRef::new("Patient", id),
            kind,
            payload,
            base,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_then_updates_collapse_to_insert() {
        let changes = vec![
            change(1, "p1", ChangeKind::Insert, Some(json!({"v": 1})), None),
            change(2, "p1", ChangeKind::Update, Some(json!({"v": 2})), Some(json!({"v": 1}))),
            change(3, "p1", ChangeKind::Update, Some(json!({"v": 3})), Some(json!({"v": 2}))),
        ];

        let patches = generate_patches(&changes);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].kind, ChangeKind::Insert);
        assert_eq!(patches[0].body, json!({"v": 3}));
        assert_eq!(
            patches[0].tokens,
            vec![ChangeToken(1), ChangeToken(2), ChangeToken(3)]
        );
    }

    #[test]
    fn test_updates_diff_from_oldest_base() {
        let changes = vec![
            change(
                5,
                "p1",
                ChangeKind::Update,
                Some(json!({"a": 1, "b": 2, "c": 0})),
                Some(json!({"a": 1, "b": 1, "c": 0})),
            ),
            change(
                4,
                "p1",
                ChangeKind::Update,
                Some(json!({"a": 1, "b": 1, "c": 0})),
                Some(json!({"a": 0, "b": 1, "c": 0})),
            ),
        ];

        let patch = squash(&changes).unwrap();
        assert_eq!(patch.kind, ChangeKind::Update);
        assert_eq!(
            patch.body,
            json!([
                {"op": "replace", "path": "/a", "value": 1},
                {"op": "replace", "path": "/b", "value": 2}
            ])
        );
        assert_eq!(patch.snapshot, Some(json!({"a": 1, "b": 2, "c": 0})));
        assert_eq!(patch.tokens, vec![ChangeToken(4), ChangeToken(5)]);
    }

    #[test]
    fn test_trailing_delete_wins() {
        let changes = vec![
            change(1, "p1", ChangeKind::Update, Some(json!({"v": 2})), Some(json!({"v": 1}))),
            change(2, "p1", ChangeKind::Delete, None, None),
        ];

        let patch = squash(&changes).unwrap();
        assert_eq!(patch.kind, ChangeKind::Delete);
        assert_eq!(patch.body, Value::Null);
        assert!(patch.snapshot.is_none());
    }

    #[test]
    fn test_reinsert_after_delete() {
        let changes = vec![
            change(1, "p1", ChangeKind::Delete, None, None),
            change(2, "p1", ChangeKind::Insert, Some(json!({"v": 9})), None),
        ];

        let patch = squash(&changes).unwrap();
        assert_eq!(patch.kind, ChangeKind::Insert);
        assert_eq!(patch.body, json!({"v": 9}));
    }

    #[test]
    fn test_one_patch_per_record_in_token_order() {
        let changes = vec![
            change(1, "b", ChangeKind::Insert, Some(json!({})), None),
            change(2, "a", ChangeKind::Update, Some(json!({"x": 1})), Some(json!({}))),
            change(3, "b", ChangeKind::Update, Some(json!({"y": 1})), Some(json!({}))),
            change(4, "c", ChangeKind::Delete, None, None),
        ];

        let patches = generate_patches(&changes);
        let order: Vec<_> = patches.iter().map(|p| p.record.id.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(squash(&[]).is_none());
        assert!(generate_patches(&[]).is_empty());
    }
}
