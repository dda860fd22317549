use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::query::GremlinQuery;
use crate::retry::{classify, FailureKind};

const REQUEST_CHARGE_ATTRIBUTE: &str = "x-ms-total-request-charge";
const CONTINUATION_ATTRIBUTE: &str = "x-ms-continuation";
const UNTYPED_GRAPHSON: &str = "application/vnd.gremlin-v3.0+json;types=false";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Fatal(String),
}

impl QueryError {
    pub fn from_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            FailureKind::RateLimited => QueryError::RateLimited(message),
            FailureKind::Timeout => QueryError::Timeout(message),
            FailureKind::Fatal => QueryError::Fatal(message),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            QueryError::RateLimited(_) => FailureKind::RateLimited,
            QueryError::Timeout(_) => FailureKind::Timeout,
            QueryError::Fatal(_) => FailureKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub page_size: Option<usize>,
    pub continuation: Option<String>,
}

impl QueryOptions {
    pub fn page(page_size: usize) -> Self {
        Self {
            page_size: Some(page_size),
            continuation: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub rows: Vec<Map<String, Value>>,
    pub cost: f64,
    pub continuation: Option<String>,
}

/// Executes one query against the remote graph.
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn submit(
        &self,
        query: &GremlinQuery,
        options: &QueryOptions,
    ) -> Result<QueryResponse, QueryError>;
}

#[derive(Debug, Deserialize)]
struct GremlinEnvelope {
    #[serde(default)]
    status: GremlinStatus,
    #[serde(default)]
    result: GremlinResult,
}

#[derive(Debug, Default, Deserialize)]
struct GremlinStatus {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attributes: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct GremlinResult {
    #[serde(default)]
    data: Value,
}

/// Talks to a Gremlin Server compatible HTTP endpoint, asking for untyped
/// GraphSON so projected rows come back as plain JSON objects.
#[derive(Debug, Clone)]
pub struct GremlinHttpClient {
    http: reqwest::Client,
    endpoint: String,
    default_cost: f64,
}

impl GremlinHttpClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<&str>,
        request_timeout: Duration,
        default_cost: f64,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(UNTYPED_GRAPHSON));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.trim()))?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            default_cost,
        })
    }

    fn request_body(query: &GremlinQuery, options: &QueryOptions) -> Value {
        let mut body = json!({
            "gremlin": query.text(),
            "bindings": query.bindings(),
        });
        let mut request_options = Map::new();
        if let Some(page_size) = options.page_size {
            request_options.insert("pageSize".to_string(), json!(page_size));
        }
        if let Some(continuation) = &options.continuation {
            request_options.insert("continuation".to_string(), json!(continuation));
        }
        if !request_options.is_empty() {
            body["requestOptions"] = Value::Object(request_options);
        }
        body
    }

    fn parse_envelope(&self, envelope: GremlinEnvelope) -> Result<QueryResponse, QueryError> {
        if let Some(code) = envelope.status.code.filter(|code| *code >= 300) {
            let message = envelope.status.message.unwrap_or_default();
            return Err(QueryError::from_kind(
                classify(Some(code), &message),
                format!("status {code}: {message}"),
            ));
        }

        let attributes = envelope.status.attributes;
        let cost = attributes
            .get(REQUEST_CHARGE_ATTRIBUTE)
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(self.default_cost);
        let continuation = attributes
            .get(CONTINUATION_ATTRIBUTE)
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(ToOwned::to_owned);

        let rows = match envelope.result.data {
            Value::Array(items) => items.into_iter().map(into_row).collect(),
            Value::Null => Vec::new(),
            other => vec![into_row(other)],
        };
        Ok(QueryResponse {
            rows,
            cost,
            continuation,
        })
    }
}

fn into_row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn transport_error(err: reqwest::Error) -> QueryError {
    if err.is_timeout() || err.is_connect() {
        QueryError::Timeout(err.to_string())
    } else {
        QueryError::Fatal(err.to_string())
    }
}

#[async_trait]
impl QueryClient for GremlinHttpClient {
    async fn submit(
        &self,
        query: &GremlinQuery,
        options: &QueryOptions,
    ) -> Result<QueryResponse, QueryError> {
        let body = Self::request_body(query, options);
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QueryError::from_kind(
                classify(Some(status.as_u16()), &text),
                format!("HTTP {status}: {text}"),
            ));
        }

        let envelope = response
            .json::<GremlinEnvelope>()
            .await
            .map_err(|err| QueryError::Fatal(format!("failed to parse Gremlin response: {err}")))?;
        self.parse_envelope(envelope)
    }
}
