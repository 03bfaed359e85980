//! Pull runs driven end to end through the engine and a scripted transport.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use recordsync_common::{Error, RecordRef, RecordType};
use recordsync_sync::{
    FanOutTarget, JournalStore, LocalStore, PullConfig, RetryConfig, RuleSpec, SyncConfig,
    SyncEngine,
};
use recordsync_transport::{
    FetchRequest, PageCursor, RemoteRecord, ResponseEnvelope, ScriptedTransport, SearchPage,
    SearchRequest,
};

fn record(record_type: &str, id: &str) -> RemoteRecord {
    RemoteRecord::new(
        RecordRef::new(record_type, id),
        json!({"resourceType": record_type, "id": id}),
    )
}

fn page(record_type: &str, ids: &[&str]) -> SearchPage {
    SearchPage::of_records(
        record_type,
        ids.iter().map(|id| record(record_type, id)).collect(),
    )
}

fn setup(
    pull: PullConfig,
) -> (
    Arc<ScriptedTransport>,
    Arc<JournalStore>,
    SyncEngine<ScriptedTransport, JournalStore>,
) {
    let transport = Arc::new(ScriptedTransport::new());
    let store = Arc::new(JournalStore::new());
    let config = SyncConfig::default().with_pull(pull).with_retry(
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
    );
    let engine = SyncEngine::new(transport.clone(), store.clone(), config);
    (transport, store, engine)
}

#[tokio::test]
async fn test_next_link_dropped_at_quota() {
    let pull = PullConfig::default()
        .with_quota("Patient", 2)
        .with_seed(SearchRequest::new("Patient"))
        .with_seed(SearchRequest::new("Observation"));
    let (transport, store, engine) = setup(pull);

    let next = "https://host/Patient?page=2";
    transport.respond_search(
        &SearchRequest::new("Patient"),
        ResponseEnvelope::Page(page("Patient", &["p1", "p2"]).with_next_link(next)),
    );
    transport.respond_search(
        &SearchRequest::new("Patient").continuation(next),
        ResponseEnvelope::Page(page("Patient", &["p3"])),
    );
    transport.respond_search(
        &SearchRequest::new("Observation"),
        ResponseEnvelope::Page(page("Observation", &["o1"])),
    );

    let summary = engine.pull().await.unwrap();

    let fetched = transport.fetched();
    assert_eq!(fetched.len(), 2);
    assert!(fetched.iter().all(|request| match request {
        FetchRequest::Search(search) => search.cursor.is_none(),
        _ => false,
    }));
    // The Patient seed asked for no more than the quota.
    assert_eq!(
        fetched[0],
        FetchRequest::Search(SearchRequest::new("Patient").with_count(2))
    );
    assert_eq!(
        fetched[1],
        FetchRequest::Search(SearchRequest::new("Observation").with_count(100))
    );

    assert_eq!(summary.records_retrieved, 3);
    assert_eq!(summary.per_type[&RecordType::new("Patient")].unique, 2);
    assert_eq!(store.records().await.len(), 3);
}

#[tokio::test]
async fn test_continuations_followed_under_quota() {
    let pull = PullConfig::default().with_seed(SearchRequest::new("Patient"));
    let (transport, store, engine) = setup(pull);

    let next = "https://host/Patient?page=2";
    transport.respond_search(
        &SearchRequest::new("Patient"),
        ResponseEnvelope::Page(page("Patient", &["p1"]).with_next_link(next)),
    );
    transport.respond_search(
        &SearchRequest::new("Patient").continuation(next),
        ResponseEnvelope::Page(page("Patient", &["p2"])),
    );

    engine.pull().await.unwrap();

    let fetched = transport.fetched();
    assert_eq!(fetched.len(), 2);
    match &fetched[1] {
        FetchRequest::Search(search) => {
            assert_eq!(search.cursor, Some(PageCursor::NextLink(next.to_string())))
        }
        other => panic!("unexpected request {:?}", other),
    }
    assert_eq!(store.records().await.len(), 2);
}

#[tokio::test]
async fn test_fan_out_and_resolution_pass() {
    let pull = PullConfig::default()
        .with_seed(SearchRequest::new("Patient"))
        .with_rule(RuleSpec::ForeignKeyFanOut {
            source: "Patient".into(),
            targets: vec![FanOutTarget::new("Observation", "subject")],
            ids_per_request: 0,
            requests_per_envelope: 0,
            sort: Some("-_lastUpdated".to_string()),
        })
        .with_rule(RuleSpec::DeferredReferences {
            source: "Observation".into(),
            targets: vec!["Practitioner".into(), "Patient".into()],
            field: "reference".to_string(),
        });
    let (transport, store, engine) = setup(pull);

    transport.respond_search(
        &SearchRequest::new("Patient"),
        ResponseEnvelope::Page(page("Patient", &["p2", "p1"])),
    );
    transport.respond_search(
        &SearchRequest::new("Observation")
            .with_param("subject", "Patient/p1,Patient/p2")
            .with_param("_sort", "-_lastUpdated"),
        ResponseEnvelope::Page(SearchPage::of_records(
            "Observation",
            vec![RemoteRecord::new(
                RecordRef::new("Observation", "o1"),
                json!({
                    "resourceType": "Observation",
                    "id": "o1",
                    "subject": {"reference": "Patient/p1"},
                    "performer": [{"reference": "Practitioner/dr1"}, {"reference": "nonsense"}]
                }),
            )],
        )),
    );
    transport.respond_search(
        &SearchRequest::new("Practitioner").with_param("_id", "dr1"),
        ResponseEnvelope::Page(page("Practitioner", &["dr1"])),
    );

    let summary = engine.pull().await.unwrap();

    let fetched = transport.fetched();
    assert_eq!(fetched.len(), 3);
    assert!(matches!(&fetched[1], FetchRequest::Batch(searches) if searches.len() == 1));
    match &fetched[2] {
        FetchRequest::Batch(searches) => {
            assert_eq!(searches.len(), 1);
            assert_eq!(searches[0].record_type, RecordType::new("Practitioner"));
            assert_eq!(searches[0].params, vec![("_id".to_string(), "dr1".to_string())]);
        }
        other => panic!("unexpected request {:?}", other),
    }

    assert_eq!(summary.records_retrieved, 4);
    assert_eq!(summary.malformed_references, 1);
    assert!(store.get(&RecordRef::new("Practitioner", "dr1")).await.is_some());
}

#[tokio::test]
async fn test_duplicate_requests_issued_once() {
    let pull = PullConfig::default()
        .with_seed(SearchRequest::new("Patient").with_param("active", "true"))
        .with_seed(
            SearchRequest::new("Patient")
                .with_param("active", "true")
                .with_count(5),
        );
    let (transport, _store, engine) = setup(pull);

    let summary = engine.pull().await.unwrap();
    assert_eq!(transport.fetched().len(), 1);
    assert_eq!(summary.requests_issued, 1);
}

#[tokio::test]
async fn test_pointers_expand_expandable_type() {
    let pull = PullConfig::default()
        .with_seed(SearchRequest::new("List"))
        .with_expandable_type("Patient");
    let (transport, store, engine) = setup(pull);

    transport.respond_search(
        &SearchRequest::new("List"),
        ResponseEnvelope::Pointers(vec![
            RecordRef::new("Patient", "p1"),
            RecordRef::new("Patient", "p1"),
            RecordRef::new("Device", "d1"),
        ]),
    );
    transport.respond(
        &FetchRequest::Expand(RecordRef::new("Patient", "p1")),
        ResponseEnvelope::Page(SearchPage::of_records(
            "Bundle",
            vec![record("Patient", "p1"), record("Observation", "o1")],
        )),
    );

    engine.pull().await.unwrap();

    let fetched = transport.fetched();
    assert_eq!(fetched.len(), 2);
    assert_eq!(fetched[1], FetchRequest::Expand(RecordRef::new("Patient", "p1")));
    assert_eq!(store.records().await.len(), 2);
}

#[tokio::test]
async fn test_rejection_keeps_received_records() {
    let pull = PullConfig::default()
        .with_seed(SearchRequest::new("Patient"))
        .with_seed(SearchRequest::new("Observation"));
    let (transport, store, engine) = setup(pull);

    transport.respond_search(
        &SearchRequest::new("Patient"),
        ResponseEnvelope::Page(page("Patient", &["p1"])),
    );
    transport.respond_search(
        &SearchRequest::new("Observation"),
        ResponseEnvelope::Error {
            diagnostics: "unknown search parameter".to_string(),
        },
    );

    let result = engine.pull().await;
    assert!(matches!(result, Err(Error::RemoteRejected(ref d)) if d.contains("unknown")));
    assert!(store.get(&RecordRef::new("Patient", "p1")).await.is_some());
}

#[tokio::test]
async fn test_transport_failure_exhausts_retries() {
    let pull = PullConfig::default().with_seed(SearchRequest::new("Patient"));
    let (transport, _store, engine) = setup(pull);
    transport.fail_next_fetches(10);

    let result = engine.pull().await;
    assert!(matches!(result, Err(Error::Transport(_))));
    // Initial attempt plus two retries.
    assert_eq!(transport.fetched().len(), 3);
}

#[tokio::test]
async fn test_incremental_seeds() {
    let pull = PullConfig::default()
        .with_seed(SearchRequest::new("Patient"))
        .with_seed(SearchRequest::new("Observation"))
        .with_incremental(true);
    let (transport, store, engine) = setup(pull);

    store
        .save_downloaded(&[RemoteRecord::new(
            RecordRef::new("Patient", "p1"),
            json!({
                "resourceType": "Patient",
                "id": "p1",
                "meta": {"lastUpdated": "2024-05-01T10:00:00Z"}
            }),
        )])
        .await
        .unwrap();

    engine.pull().await.unwrap();

    let fetched = transport.fetched();
    match &fetched[0] {
        FetchRequest::Search(search) => assert_eq!(
            search.params,
            vec![(
                "_lastUpdated".to_string(),
                "gt2024-05-01T10:00:00Z".to_string()
            )]
        ),
        other => panic!("unexpected request {:?}", other),
    }
    match &fetched[1] {
        FetchRequest::Search(search) => assert!(search.params.is_empty()),
        other => panic!("unexpected request {:?}", other),
    }
}
