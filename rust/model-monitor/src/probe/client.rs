use crate::{
    config::EndpointConfig,
    error::{MonitorError, Result},
    models::FeatureVector,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const DETAIL_LIMIT: usize = 256;

/// Body of `GET {base}/health`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "healthy" | "ok" | "up" | "serving"
        )
    }
}

/// Body of `POST {base}/predict`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Prediction {
    pub prediction: f64,
    #[serde(default, alias = "model_type")]
    pub model_version: Option<String>,
}

/// An HTTP exchange that produced a response; `body` is only set for 2xx replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub status_code: u16,
    pub body: Option<T>,
    pub detail: Option<String>,
}

impl<T> Reply<T> {
    pub fn ok(body: T) -> Self {
        Self {
            status_code: 200,
            body: Some(body),
            detail: None,
        }
    }

    pub fn failed(status_code: u16, detail: impl Into<String>) -> Self {
        Self {
            status_code,
            body: None,
            detail: Some(detail.into()),
        }
    }
}

/// The serving collaborator as seen by the probe agent.
///
/// Transport failures surface as `MonitorError::Probe`; call timeouts are
/// enforced by the caller.
#[async_trait]
pub trait ServingClient: Send + Sync {
    async fn health(&self, endpoint: &EndpointConfig) -> Result<Reply<HealthStatus>>;

    async fn predict(
        &self,
        endpoint: &EndpointConfig,
        features: &FeatureVector,
    ) -> Result<Reply<Prediction>>;

    /// Request payloads from the endpoint's input tap, newer than `since` when the tap honours it.
    async fn recent_inputs(
        &self,
        endpoint: &EndpointConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TappedInput>>;
}

/// One served request as reported by an input tap.
#[derive(Debug, Clone, PartialEq)]
pub struct TappedInput {
    pub request_id: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub features: FeatureVector,
}

impl TappedInput {
    pub fn bare(features: FeatureVector) -> Self {
        Self {
            request_id: None,
            received_at: None,
            features,
        }
    }

    /// Identity of the request across overlapping tap reads. Unkeyed entries fall back to their payload.
    pub fn key(&self) -> String {
        match &self.request_id {
            Some(id) => format!("id:{id}"),
            None => serde_json::to_string(&(self.received_at, &self.features)).unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TapEntry {
    Keyed {
        #[serde(default, alias = "id")]
        request_id: Option<String>,
        #[serde(default, alias = "timestamp")]
        received_at: Option<DateTime<Utc>>,
        features: FeatureVector,
    },
    Bare(FeatureVector),
}

impl From<TapEntry> for TappedInput {
    fn from(entry: TapEntry) -> Self {
        match entry {
            TapEntry::Keyed {
                request_id,
                received_at,
                features,
            } => Self {
                request_id,
                received_at,
                features,
            },
            TapEntry::Bare(features) => Self::bare(features),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputsBody {
    Bare(Vec<TapEntry>),
    Wrapped { inputs: Vec<TapEntry> },
}

#[derive(Clone)]
pub struct HttpServingClient {
    client: Client,
}

impl HttpServingClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("model-monitor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| anyhow::anyhow!("failed to create HTTP client: {err}"))?;
        Ok(Self { client })
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<Reply<T>> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(Reply::failed(status.as_u16(), truncate(&text)));
        }
        match response.json::<T>().await {
            Ok(body) => Ok(Reply {
                status_code: status.as_u16(),
                body: Some(body),
                detail: None,
            }),
            Err(err) => Ok(Reply::failed(
                status.as_u16(),
                format!("unreadable response body: {err}"),
            )),
        }
    }
}

fn join(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn truncate(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(DETAIL_LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn transport(err: reqwest::Error) -> MonitorError {
    MonitorError::Probe(err.to_string())
}

#[async_trait]
impl ServingClient for HttpServingClient {
    async fn health(&self, endpoint: &EndpointConfig) -> Result<Reply<HealthStatus>> {
        let response = self
            .client
            .get(join(&endpoint.base_url, &endpoint.health_path))
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }

    async fn predict(
        &self,
        endpoint: &EndpointConfig,
        features: &FeatureVector,
    ) -> Result<Reply<Prediction>> {
        let response = self
            .client
            .post(join(&endpoint.base_url, &endpoint.predict_path))
            .json(features)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }

    async fn recent_inputs(
        &self,
        endpoint: &EndpointConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TappedInput>> {
        let Some(path) = endpoint.inputs_path.as_deref() else {
            return Ok(Vec::new());
        };
        let mut request = self.client.get(join(&endpoint.base_url, path));
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let response = request
            .send()
            .await
            .map_err(transport)?;
        match Self::decode::<InputsBody>(response).await? {
            Reply {
                body: Some(InputsBody::Bare(inputs)),
                ..
            }
            | Reply {
                body: Some(InputsBody::Wrapped { inputs }),
                ..
            } => Ok(inputs.into_iter().map(TappedInput::from).collect()),
            Reply {
                status_code, detail, ..
            } => Err(MonitorError::Probe(format!(
                "input tap returned {status_code}: {}",
                detail.unwrap_or_default()
            ))),
        }
    }
}
