//! Listing persistence + HTTP fetch utilities for MPW.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod store;

pub use store::{ListingStore, MemoryListingStore, PgListingStore, StoreError, CREATE_TABLE_SQL};

pub const CRATE_NAME: &str = "mpw-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid header {0}")]
    Header(String),
}

/// Thin JSON-over-HTTP client shared by the marketplace, model and notifier clients.
///
/// Every request runs to completion or to the configured per-request timeout;
/// there is no retry here, a failed call surfaces to the caller as-is.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

/// Optional extras for a GET request.
#[derive(Debug, Default, Clone)]
pub struct GetRequest<'a> {
    pub bearer_token: Option<&'a str>,
    pub headers: Vec<(&'a str, String)>,
    pub query: Vec<(String, String)>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        request: GetRequest<'_>,
    ) -> Result<JsonValue, FetchError> {
        let mut builder = self
            .client
            .get(url)
            .headers(header_map(&request.headers)?)
            .query(&request.query);
        if let Some(token) = request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let span = info_span!("http_get", url);
        async move { read_json(url, builder.send().await?).await }
            .instrument(span)
            .await
    }

    /// Form POST with HTTP basic auth, used for client-credential token exchanges.
    pub async fn post_form_basic_auth<F: Serialize + ?Sized>(
        &self,
        url: &str,
        username: &str,
        password: &str,
        form: &F,
    ) -> Result<JsonValue, FetchError> {
        let builder = self
            .client
            .post(url)
            .basic_auth(username, Some(password))
            .form(form);
        let span = info_span!("http_post_form", url);
        async move { read_json(url, builder.send().await?).await }
            .instrument(span)
            .await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<JsonValue, FetchError> {
        let builder = self.client.post(url).query(query).json(body);
        let span = info_span!("http_post_json", url = strip_query(url));
        async move { read_json(url, builder.send().await?).await }
            .instrument(span)
            .await
    }
}

fn header_map(headers: &[(&str, String)]) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::Header((*name).to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| FetchError::Header(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

async fn read_json(url: &str, resp: reqwest::Response) -> Result<JsonValue, FetchError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    debug!(status = status.as_u16(), bytes = bytes.len(), "http response");

    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: strip_query(url).to_string(),
            body: snippet(&bytes),
        });
    }
    if bytes.is_empty() || status == StatusCode::NO_CONTENT {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
        url: strip_query(url).to_string(),
        source,
    })
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map(|(path, _)| path).unwrap_or(url)
}

fn snippet(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out: String = text.chars().take(200).collect();
    if text.chars().count() > 200 {
        out.push('…');
    }
    out
}
