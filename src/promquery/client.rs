// Prometheus instant-query client
//
// Talks to the Prometheus HTTP API (GET /api/v1/query) and decodes the four
// result types it can return. Pollers only ever want one number per tick, so
// the decoded value is narrowed with `QueryValue::to_scalar`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Errors from executing a metric query
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid Prometheus URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Prometheus returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Query rejected ({error_type}): {message}")]
    Api { error_type: String, message: String },

    #[error("Malformed query response: {0}")]
    Malformed(String),

    #[error("Query returned a non-scalar result: {0}")]
    NonScalar(String),

    #[error("Metrics backend error: {0}")]
    Backend(String),
}

/// One labelled sample of an instant vector
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Decoded result of an instant query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Scalar(f64),
    Vector(Vec<Sample>),
    /// Range vectors only matter as "not a scalar"; keep the series count
    Matrix { series: usize },
    String(String),
}

impl QueryValue {
    /// Narrow to a single number. A vector holding exactly one sample counts.
    pub fn to_scalar(&self) -> Result<f64, QueryError> {
        match self {
            QueryValue::Scalar(v) => Ok(*v),
            QueryValue::Vector(samples) if samples.len() == 1 => Ok(samples[0].value),
            QueryValue::Vector(samples) => Err(QueryError::NonScalar(format!(
                "vector with {} samples",
                samples.len()
            ))),
            QueryValue::Matrix { series } => {
                Err(QueryError::NonScalar(format!("matrix with {} series", series)))
            }
            QueryValue::String(s) => Err(QueryError::NonScalar(format!("string {:?}", s))),
        }
    }
}

/// Anything that can evaluate an instant query at a point in time
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query(&self, query: &str, ts: DateTime<Utc>) -> Result<QueryValue, QueryError>;
}

/// HTTP client for the Prometheus instant-query API
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    /// Reqwest HTTP client
    client: reqwest::Client,

    /// Full URL of the query endpoint
    endpoint: String,
}

impl PrometheusClient {
    /// Create a client for the Prometheus server at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QueryError> {
        let endpoint = format!("{}/api/v1/query", base_url.trim_end_matches('/'));
        reqwest::Url::parse(&endpoint).map_err(|e| QueryError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_url(&self, query: &str, ts: DateTime<Utc>) -> Result<reqwest::Url, QueryError> {
        let time = format_timestamp(ts);
        reqwest::Url::parse_with_params(&self.endpoint, &[("query", query), ("time", &time)])
            .map_err(|e| QueryError::InvalidUrl {
                url: self.endpoint.clone(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClient {
    async fn query(&self, query: &str, ts: DateTime<Utc>) -> Result<QueryValue, QueryError> {
        let url = self.request_url(query, ts)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        // Prometheus reports query errors as JSON on 4xx/5xx too, so try the
        // body first and fall back to the status line
        match serde_json::from_str::<ApiResponse>(&body) {
            Ok(parsed) => parsed.into_value(),
            Err(_) if !status.is_success() => Err(QueryError::Status {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(QueryError::Malformed(e.to_string())),
        }
    }
}

/// Seconds since the epoch with millisecond precision, as Prometheus expects
fn format_timestamp(ts: DateTime<Utc>) -> String {
    format!("{:.3}", ts.timestamp_millis() as f64 / 1000.0)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,

    #[serde(default)]
    data: Option<ApiData>,

    #[serde(default)]
    error_type: Option<String>,

    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Scalar((f64, String)),
    String((f64, String)),
    Vector(Vec<VectorSample>),
    Matrix(Vec<serde::de::IgnoredAny>),
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

impl ApiResponse {
    fn into_value(self) -> Result<QueryValue, QueryError> {
        if self.status != "success" {
            return Err(QueryError::Api {
                error_type: self.error_type.unwrap_or_else(|| "unknown".to_string()),
                message: self.error.unwrap_or_default(),
            });
        }

        let data = self
            .data
            .ok_or_else(|| QueryError::Malformed("success response without data".to_string()))?;

        Ok(match data {
            ApiData::Scalar((_, v)) => QueryValue::Scalar(parse_sample_value(&v)?),
            ApiData::String((_, s)) => QueryValue::String(s),
            ApiData::Vector(samples) => QueryValue::Vector(
                samples
                    .into_iter()
                    .map(|s| -> Result<Sample, QueryError> {
                        Ok(Sample {
                            value: parse_sample_value(&s.value.1)?,
                            labels: s.metric,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            ApiData::Matrix(series) => QueryValue::Matrix {
                series: series.len(),
            },
        })
    }
}

/// Sample values arrive as strings ("1", "NaN", "+Inf")
fn parse_sample_value(raw: &str) -> Result<f64, QueryError> {
    raw.parse::<f64>()
        .map_err(|_| QueryError::Malformed(format!("invalid sample value {:?}", raw)))
}
