//! Fetch requests issued by the pull side.

use serde::{Deserialize, Serialize};

use recordsync_common::{RecordRef, RecordType};

/// Where a continuation page starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageCursor {
    /// Opaque "next" link handed out by the server.
    NextLink(String),
}

/// A search over one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Type being searched.
    pub record_type: RecordType,
    /// Filter parameters, in the order they are sent.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    /// Desired number of results per page.
    #[serde(default)]
    pub count: Option<u32>,
    /// Continuation cursor; when set, `params` are carried by the cursor.
    #[serde(default)]
    pub cursor: Option<PageCursor>,
}

impl SearchRequest {
    /// Create an unfiltered search over a type.
    pub fn new(record_type: impl Into<RecordType>) -> Self {
        Self {
            record_type: record_type.into(),
            params: Vec::new(),
            count: None,
            cursor: None,
        }
    }

    /// Append a filter parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Set the desired page size.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Build the request that fetches the page behind `next_link`.
    pub fn continuation(&self, next_link: impl Into<String>) -> Self {
        Self {
            record_type: self.record_type.clone(),
            params: self.params.clone(),
            count: self.count,
            cursor: Some(PageCursor::NextLink(next_link.into())),
        }
    }

    /// Relative search URL (`Type?key=value&_count=n`), form-encoded.
    pub fn relative_url(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.params {
            query.append_pair(key, value);
        }
        if let Some(count) = self.count {
            query.append_pair("_count", &count.to_string());
        }
        let query = query.finish();

        if query.is_empty() {
            self.record_type.to_string()
        } else {
            format!("{}?{}", self.record_type, query)
        }
    }

    /// Dedup key of this search.
    pub fn key(&self) -> RequestKey {
        RequestKey::Search {
            record_type: self.record_type.clone(),
            params: self.params.clone(),
            cursor: self.cursor.clone(),
        }
    }
}

/// A single unit of pull-side work handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchRequest {
    /// One search, answered with a page.
    Search(SearchRequest),
    /// Several searches in one network envelope, answered with a page of sub-pages.
    Batch(Vec<SearchRequest>),
    /// The record and everything it transitively owns.
    Expand(RecordRef),
    /// A single record by identity.
    Read(RecordRef),
}

impl FetchRequest {
    /// Key used to detect a request that was already issued in a run.
    pub fn key(&self) -> RequestKey {
        match self {
            FetchRequest::Search(search) => search.key(),
            FetchRequest::Batch(searches) => {
                RequestKey::Batch(searches.iter().map(SearchRequest::key).collect())
            }
            FetchRequest::Expand(record) => RequestKey::Expand(record.clone()),
            FetchRequest::Read(record) => RequestKey::Read(record.clone()),
        }
    }

    /// Type the response is expected to be about.
    pub fn target_type(&self) -> Option<&RecordType> {
        match self {
            FetchRequest::Search(search) => Some(&search.record_type),
            FetchRequest::Batch(_) => None,
            FetchRequest::Expand(record) | FetchRequest::Read(record) => Some(&record.record_type),
        }
    }
}

/// Identity of a request for deduplication: target, filters and cursor.
///
/// The page size is deliberately not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// Key of a search.
    Search {
        /// Searched type.
        record_type: RecordType,
        /// Filters in order.
        params: Vec<(String, String)>,
        /// Continuation cursor.
        cursor: Option<PageCursor>,
    },
    /// Keys of the searches inside a batch.
    Batch(Vec<RequestKey>),
    /// Deep fetch of a record.
    Expand(RecordRef),
    /// Read of a record.
    Read(RecordRef),
}
