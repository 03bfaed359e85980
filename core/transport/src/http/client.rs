//! REST client speaking the record server's bundle protocol.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use recordsync_common::{Error, Result};

use super::bundle;
use crate::provider::RemoteTransport;
use crate::request::{FetchRequest, PageCursor, SearchRequest};
use crate::response::ResponseEnvelope;
use crate::upload::{HttpVerb, UploadEnvelope, UploadOperation, UploadOutcome};

/// Media type of record payloads.
const FHIR_JSON: &str = "application/fhir+json";

fn default_timeout_secs() -> u64 {
    30
}

/// Configuration of the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Server base URL, e.g. `https://host/fhir`.
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional bearer token.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl HttpConfig {
    /// Create a configuration with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
            bearer_token: None,
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Transport backed by a REST record server.
pub struct HttpTransport {
    http: Client,
    base: Url,
    bearer_token: Option<String>,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    ///
    /// # Errors
    /// - `InvalidInput` if the base URL does not parse
    /// - `Transport` if the HTTP client cannot be built
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", config.base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent("RecordSync/0.1")
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            bearer_token: config.bearer_token.clone(),
        })
    }

    /// Base URL every relative request is resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, relative: &str) -> Result<Url> {
        self.base
            .join(relative)
            .map_err(|e| Error::InvalidInput(format!("Invalid request URL {}: {}", relative, e)))
    }

    fn search_url(&self, search: &SearchRequest) -> Result<Url> {
        match &search.cursor {
            Some(PageCursor::NextLink(link)) => match Url::parse(link) {
                Ok(url) => Ok(url),
                Err(_) => self.url(link),
            },
            None => self.url(&search.relative_url()),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, FHIR_JSON);
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await.map_err(map_send_error)?;

        // Gateway failures carry no server verdict; treat them like a lost connection.
        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(Error::Transport(format!("Server unavailable: {}", status)));
        }

        Ok(response)
    }

    async fn read_json(response: Response) -> Result<(StatusCode, Value)> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_send_error)?;
        if bytes.is_empty() {
            return Ok((status, Value::Null));
        }

        match serde_json::from_slice(&bytes) {
            Ok(body) => Ok((status, body)),
            Err(e) if status.is_success() => Err(Error::Protocol(format!(
                "Response body is not JSON: {}",
                e
            ))),
            Err(_) => Ok((status, Value::Null)),
        }
    }

    fn fetch_builder(&self, request: &FetchRequest) -> Result<RequestBuilder> {
        let builder = match request {
            FetchRequest::Search(search) => self.http.get(self.search_url(search)?),
            FetchRequest::Batch(searches) => self
                .http
                .post(self.base.clone())
                .header(header::CONTENT_TYPE, FHIR_JSON)
                .json(&bundle::batch_bundle(searches)),
            FetchRequest::Expand(record) => {
                self.http.get(self.url(&format!("{}/$everything", record))?)
            }
            FetchRequest::Read(record) => self.http.get(self.url(&record.to_string())?),
        };
        Ok(builder)
    }

    async fn upload_single(&self, operation: &UploadOperation) -> Result<UploadOutcome> {
        let url = self.url(&operation.relative_url())?;
        let builder = match operation.verb {
            HttpVerb::Post => self.http.post(url).json(&operation.body),
            HttpVerb::Put => self.http.put(url).json(&operation.body),
            HttpVerb::Patch => self
                .http
                .patch(url)
                .header(header::CONTENT_TYPE, bundle::JSON_PATCH)
                .body(operation.body.to_string()),
            HttpVerb::Delete => self.http.delete(url),
        };

        let response = self.send(builder).await?;
        let location = header_value(&response, header::LOCATION)
            .or_else(|| header_value(&response, header::CONTENT_LOCATION));
        let etag = header_value(&response, header::ETAG);
        let last_modified = header_value(&response, header::LAST_MODIFIED);
        let (status, body) = Self::read_json(response).await?;

        Ok(UploadOutcome::Aggregate(bundle::result_from_response(
            status.as_u16(),
            location,
            etag,
            last_modified,
            &body,
        )))
    }

    async fn upload_transaction(&self, envelope: &UploadEnvelope) -> Result<UploadOutcome> {
        let builder = self
            .http
            .post(self.base.clone())
            .header(header::CONTENT_TYPE, FHIR_JSON)
            .json(&bundle::transaction_bundle(envelope));

        let (status, body) = Self::read_json(self.send(builder).await?).await?;
        if !status.is_success() && body.is_null() {
            return Err(Error::Protocol(format!(
                "Transaction failed with HTTP {} and no outcome",
                status
            )));
        }

        bundle::parse_transaction_response(&body, envelope.len())
    }
}

fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Transport(e.to_string())
    }
}

fn header_value(response: &Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseEnvelope> {
        debug!("Fetching {:?}", request.key());
        let response = self.send(self.fetch_builder(request)?).await?;
        let (status, body) = Self::read_json(response).await?;

        if !status.is_success() {
            let diagnostics = bundle::outcome_diagnostics(&body)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Ok(ResponseEnvelope::Error { diagnostics });
        }

        bundle::parse_fetch_response(request, &body)
    }

    async fn upload(&self, envelope: &UploadEnvelope) -> Result<UploadOutcome> {
        debug!("Uploading envelope of {} operation(s)", envelope.len());
        match envelope.operations() {
            [] => Ok(UploadOutcome::PerOperation(Vec::new())),
            [operation] => self.upload_single(operation).await,
            _ => self.upload_transaction(envelope).await,
        }
    }
}
