//! Response envelopes returned for fetch requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use recordsync_common::{RecordRef, RecordType};

/// A downloaded record: identity plus the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Identity extracted from the payload.
    pub reference: RecordRef,
    /// Raw payload.
    pub body: Value,
}

impl RemoteRecord {
    /// Create a record.
    pub fn new(reference: RecordRef, body: Value) -> Self {
        Self { reference, body }
    }
}

/// One entry of a search page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PageEntry {
    /// A plain record.
    Record(RemoteRecord),
    /// A sub-page (batch responses embed one page per search).
    Page(SearchPage),
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    /// Type the page was requested for.
    pub record_type: RecordType,
    /// Entries in server order.
    pub entries: Vec<PageEntry>,
    /// Link to the following page, if any.
    pub next_link: Option<String>,
}

impl SearchPage {
    /// Create a page of plain records.
    pub fn of_records(record_type: impl Into<RecordType>, records: Vec<RemoteRecord>) -> Self {
        Self {
            record_type: record_type.into(),
            entries: records.into_iter().map(PageEntry::Record).collect(),
            next_link: None,
        }
    }

    /// Create an empty page.
    pub fn empty(record_type: impl Into<RecordType>) -> Self {
        Self::of_records(record_type, Vec::new())
    }

    /// Set the next link.
    pub fn with_next_link(mut self, link: impl Into<String>) -> Self {
        self.next_link = Some(link.into());
        self
    }

    /// Direct records of this page (sub-pages excluded).
    pub fn records(&self) -> impl Iterator<Item = &RemoteRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            PageEntry::Record(record) => Some(record),
            PageEntry::Page(_) => None,
        })
    }

    /// Embedded sub-pages.
    pub fn sub_pages(&self) -> impl Iterator<Item = &SearchPage> {
        self.entries.iter().filter_map(|entry| match entry {
            PageEntry::Page(page) => Some(page),
            PageEntry::Record(_) => None,
        })
    }
}

/// Everything a fetch can come back with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseEnvelope {
    /// The server refused the request.
    Error {
        /// Human-readable diagnostics from the server.
        diagnostics: String,
    },
    /// Exactly one record.
    Single(RemoteRecord),
    /// A search result page.
    Page(SearchPage),
    /// A list of references to other records.
    Pointers(Vec<RecordRef>),
}
