//! Quota and termination properties of pull runs against arbitrary servers.

use proptest::prelude::*;
use serde_json::json;

use recordsync_common::{RecordRef, RecordType};
use recordsync_sync::{DeferredReferences, ExtractionTable, PullConfig, PullRun, PullStep};
use recordsync_transport::{
    FetchRequest, PageEntry, RemoteRecord, ResponseEnvelope, SearchPage, SearchRequest,
};

/// One scripted page: record ids, the practitioner each points at, and an
/// optional next link picked from a small set.
#[derive(Debug, Clone)]
struct PageScript {
    records: Vec<(u8, u8)>,
    next: Option<u8>,
}

fn page_script() -> impl Strategy<Value = PageScript> {
    (
        prop::collection::vec((0u8..30, 0u8..10), 0..8),
        prop::option::of(0u8..4),
    )
        .prop_map(|(records, next)| PageScript { records, next })
}

fn build_page(record_type: &RecordType, script: &PageScript) -> SearchPage {
    let records = script
        .records
        .iter()
        .map(|(id, practitioner)| {
            RemoteRecord::new(
                RecordRef::new(record_type.clone(), format!("r{}", id)),
                json!({
                    "id": format!("r{}", id),
                    "author": {"reference": format!("Practitioner/r{}", practitioner)}
                }),
            )
        })
        .collect();
    let page = SearchPage::of_records(record_type.clone(), records);
    match script.next {
        Some(link) => page.with_next_link(format!("https://host/{}?page={}", record_type, link)),
        None => page,
    }
}

fn answer(request: &FetchRequest, scripts: &[PageScript], call: usize) -> ResponseEnvelope {
    let script = |offset: usize| &scripts[(call + offset) % scripts.len()];
    match request {
        FetchRequest::Search(search) => {
            ResponseEnvelope::Page(build_page(&search.record_type, script(0)))
        }
        FetchRequest::Batch(searches) => ResponseEnvelope::Page(SearchPage {
            record_type: "Bundle".into(),
            entries: searches
                .iter()
                .enumerate()
                .map(|(i, search)| PageEntry::Page(build_page(&search.record_type, script(i))))
                .collect(),
            next_link: None,
        }),
        FetchRequest::Expand(record) | FetchRequest::Read(record) => {
            ResponseEnvelope::Page(build_page(&record.record_type, script(0)))
        }
    }
}

proptest! {
    #[test]
    fn prop_runs_terminate_within_quota(
        scripts in prop::collection::vec(page_script(), 1..6),
        patient_quota in 0usize..6,
        practitioner_quota in 0usize..6,
    ) {
        let config = PullConfig::default()
            .with_seed(SearchRequest::new("Patient"))
            .with_seed(SearchRequest::new("Patient").with_param("active", "true"))
            .with_quota("Patient", patient_quota)
            .with_quota("Practitioner", practitioner_quota);
        let mut rules = ExtractionTable::new();
        rules.register("Patient", DeferredReferences::new(vec![RecordType::new("Practitioner")]));
        rules.register("Practitioner", DeferredReferences::new(vec![RecordType::new("Practitioner")]));

        let mut run = PullRun::new(&config, &rules);
        for seed in config.seeds.clone() {
            run.enqueue(FetchRequest::Search(seed));
        }

        let mut calls = 0;
        let summary = loop {
            match run.next_request() {
                PullStep::Fetch(request) => {
                    calls += 1;
                    prop_assert!(calls < 500, "run did not terminate");
                    let response = answer(&request, &scripts, calls);
                    run.on_response(response).unwrap();
                    run.take_records();
                }
                PullStep::Complete(summary) => break summary,
            }
        };

        let patient = RecordType::new("Patient");
        let practitioner = RecordType::new("Practitioner");
        prop_assert!(run.downloaded_ids(&patient) <= patient_quota);
        prop_assert!(run.downloaded_ids(&practitioner) <= practitioner_quota);
        for count in summary.per_type.values() {
            prop_assert!(count.unique <= count.total);
        }
        prop_assert_eq!(summary.requests_issued, calls);

        // Completion is stable.
        prop_assert!(matches!(run.next_request(), PullStep::Complete(_)));
    }
}
