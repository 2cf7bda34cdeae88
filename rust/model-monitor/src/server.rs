use crate::{
    config::MonitorConfig,
    drift::{DriftDetector, DriftSummary},
    error::{MonitorError, Result},
    models::{
        BaselineUpload, FeatureVector, ModelMetricRecord, Record, RecordKind, RetrainingTrigger,
        StoredRecord, TriggerReason,
    },
    monitor::{Ingest, MonitorHandle, MonitorStatus},
    pagination::{decode_cursor, Page, PageRequest},
    state::AppState,
    stats::regression_metrics,
    store::{MetricsStore, RecordFilter, StoreStats, TriggerFilter},
    time::parse_time_value,
    trigger::{ConsumeReply, TriggerAction, TriggerOutcome},
};
use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Query string shared by the history endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub endpoint: Option<String>,
    pub model_version: Option<String>,
    pub feature: Option<String>,
    pub time: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

impl HistoryParams {
    fn filter(&self) -> Result<RecordFilter> {
        Ok(RecordFilter {
            endpoint: non_empty(&self.endpoint),
            model_version: non_empty(&self.model_version),
            feature: non_empty(&self.feature),
            time_range: resolve_time(self.time.as_deref())?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    pub reason: Option<String>,
    pub unconsumed: Option<bool>,
    pub time: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

impl TriggerParams {
    fn filter(&self) -> Result<TriggerFilter> {
        let reason = match non_empty(&self.reason) {
            Some(raw) => Some(
                raw.parse::<TriggerReason>()
                    .map_err(MonitorError::InvalidRequest)?,
            ),
            None => None,
        };
        Ok(TriggerFilter {
            reason,
            consumed: self.unconsumed.map(|unconsumed| !unconsumed),
            time_range: resolve_time(self.time.as_deref())?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ManualTriggerRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ObservationBatch {
    pub observations: Vec<FeatureVector>,
}

#[derive(Debug, Deserialize)]
pub struct QualityRequest {
    #[serde(default)]
    pub model_version: Option<String>,
    pub predictions: Vec<f64>,
    pub actuals: Vec<f64>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct BaselineFeature {
    pub feature: String,
    pub size: usize,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BaselineSummary {
    pub model_version: Option<String>,
    pub features: Vec<BaselineFeature>,
}

pub struct Server {
    config: Arc<MonitorConfig>,
    state: AppState,
}

impl Server {
    pub fn new(
        config: Arc<MonitorConfig>,
        store: Arc<dyn MetricsStore>,
        monitor: Option<MonitorHandle>,
    ) -> Self {
        let state = AppState::new(Arc::clone(&config), store, monitor);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/probes", get(Self::probes))
            .route("/endpoint-metrics", get(Self::endpoint_metrics))
            .route("/model-metrics", get(Self::model_metrics))
            .route("/drift-reports", get(Self::drift_reports))
            .route("/cycles", get(Self::cycles))
            .route(
                "/triggers",
                get(Self::list_triggers).post(Self::request_trigger),
            )
            .route("/triggers/:id", get(Self::get_trigger))
            .route("/triggers/:id/consume", post(Self::consume_trigger))
            .route(
                "/baselines",
                get(Self::baselines).post(Self::publish_baselines),
            )
            .route("/observations", post(Self::observations))
            .route("/quality", post(Self::quality))
            .route("/drift/check", post(Self::drift_check))
            .route("/status", get(Self::status))
            .route("/stats", get(Self::stats))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_api_key,
            ));

        Router::new()
            .route("/healthz", get(Self::health))
            .nest("/api", api)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serves until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.config.listen_socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "model monitor API listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn probes(
        state: State<AppState>,
        params: Query<HistoryParams>,
    ) -> Result<Json<Page<StoredRecord>>> {
        Self::history(RecordKind::Probe, state, params).await
    }

    async fn endpoint_metrics(
        state: State<AppState>,
        params: Query<HistoryParams>,
    ) -> Result<Json<Page<StoredRecord>>> {
        Self::history(RecordKind::EndpointMetric, state, params).await
    }

    async fn model_metrics(
        state: State<AppState>,
        params: Query<HistoryParams>,
    ) -> Result<Json<Page<StoredRecord>>> {
        Self::history(RecordKind::ModelMetric, state, params).await
    }

    async fn drift_reports(
        state: State<AppState>,
        params: Query<HistoryParams>,
    ) -> Result<Json<Page<StoredRecord>>> {
        Self::history(RecordKind::DriftReport, state, params).await
    }

    async fn cycles(
        state: State<AppState>,
        params: Query<HistoryParams>,
    ) -> Result<Json<Page<StoredRecord>>> {
        Self::history(RecordKind::Cycle, state, params).await
    }

    async fn history(
        kind: RecordKind,
        State(state): State<AppState>,
        Query(params): Query<HistoryParams>,
    ) -> Result<Json<Page<StoredRecord>>> {
        let filter = params.filter()?;
        let page = page_request(&state.config, params.limit, params.cursor.as_deref())?;
        let page = state.store.query(kind, &filter, &page).await?;
        Ok(Json(page))
    }

    async fn list_triggers(
        State(state): State<AppState>,
        Query(params): Query<TriggerParams>,
    ) -> Result<Json<Page<RetrainingTrigger>>> {
        let filter = params.filter()?;
        let page = page_request(&state.config, params.limit, params.cursor.as_deref())?;
        Ok(Json(state.store.list_triggers(&filter, &page).await?))
    }

    async fn request_trigger(
        State(state): State<AppState>,
        body: Option<Json<ManualTriggerRequest>>,
    ) -> Result<(StatusCode, Json<TriggerOutcome>)> {
        let note = body.and_then(|Json(request)| request.note);
        let outcome = state.triggers.request_manual(note, Utc::now()).await?;
        let status = if outcome.action == TriggerAction::Created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        Ok((status, Json(outcome)))
    }

    async fn get_trigger(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<RetrainingTrigger>> {
        state
            .store
            .get_trigger(&id)
            .await?
            .map(Json)
            .ok_or_else(|| MonitorError::NotFound(format!("trigger {id}")))
    }

    async fn consume_trigger(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<ConsumeReply>> {
        let consumed = state.triggers.consume(&id).await?;
        Ok(Json(ConsumeReply::new(&id, consumed)))
    }

    async fn baselines(State(state): State<AppState>) -> Result<Json<BaselineSummary>> {
        let snapshots = state.store.latest_baselines().await?;
        Ok(Json(BaselineSummary {
            model_version: snapshots.first().map(|s| s.model_version.clone()),
            features: snapshots
                .into_iter()
                .map(|s| BaselineFeature {
                    size: s.values.len(),
                    feature: s.feature,
                    captured_at: s.captured_at,
                })
                .collect(),
        }))
    }

    async fn publish_baselines(
        State(state): State<AppState>,
        Json(upload): Json<BaselineUpload>,
    ) -> Result<(StatusCode, Json<serde_json::Value>)> {
        let model_version = upload.model_version.trim().to_string();
        let snapshots = upload.into_snapshots(Utc::now())?;
        let features = snapshots.len();
        state.store.put_baselines(&model_version, snapshots).await?;
        info!(%model_version, features, "baseline published");
        Ok((
            StatusCode::CREATED,
            Json(json!({ "model_version": model_version, "features": features })),
        ))
    }

    async fn observations(
        State(state): State<AppState>,
        Json(batch): Json<ObservationBatch>,
    ) -> Result<(StatusCode, Json<serde_json::Value>)> {
        let accepted = batch.observations.len();
        submit(&state, Ingest::Observations(batch.observations)).await?;
        Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))))
    }

    async fn quality(
        State(state): State<AppState>,
        Json(request): Json<QualityRequest>,
    ) -> Result<(StatusCode, Json<StoredRecord>)> {
        let metrics = regression_metrics(&request.predictions, &request.actuals)?;
        let record = Record::ModelMetric(ModelMetricRecord {
            recorded_at: Utc::now(),
            model_version: request.model_version,
            source: "external_evaluation".to_string(),
            rmse: metrics.rmse,
            mae: metrics.mae,
            r2: metrics.r2,
            sample_count: metrics.sample_count as i64,
            parameters: request.parameters,
        });
        let id = state.store.append(&record).await?;
        if state.monitor.is_some() {
            submit(&state, Ingest::Quality(metrics)).await?;
        }
        Ok((StatusCode::CREATED, Json(StoredRecord { id, record })))
    }

    async fn drift_check(
        State(state): State<AppState>,
        Json(batch): Json<ObservationBatch>,
    ) -> Result<Json<DriftSummary>> {
        if batch.observations.is_empty() {
            return Err(MonitorError::InvalidRequest(
                "observations must not be empty".into(),
            ));
        }
        let baselines = state.store.latest_baselines().await?;
        if baselines.is_empty() {
            return Err(MonitorError::NotFound("no baseline has been published".into()));
        }
        let mut detector = DriftDetector::new(&state.config.drift, &state.config.degradation);
        detector.install_baselines(baselines);
        let check_id = format!("adhoc-{}", Uuid::new_v4());
        Ok(Json(detector.check_batch(
            &check_id,
            Utc::now(),
            &batch.observations,
        )))
    }

    async fn status(State(state): State<AppState>) -> Json<MonitorStatus> {
        Json(
            state
                .monitor
                .as_ref()
                .map(MonitorHandle::status)
                .unwrap_or_default(),
        )
    }

    async fn stats(State(state): State<AppState>) -> Result<Json<StoreStats>> {
        Ok(Json(state.store.stats().await?))
    }
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    enforce_api_key(request.headers(), &state.config)?;
    Ok(next.run(request).await)
}

fn enforce_api_key(headers: &HeaderMap, config: &MonitorConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(MonitorError::Auth);
        }
    }

    Ok(())
}

async fn submit(state: &AppState, item: Ingest) -> Result<()> {
    let Some(monitor) = &state.monitor else {
        return Err(MonitorError::Internal(anyhow::anyhow!(
            "monitor loop is not running"
        )));
    };
    if monitor.submit(item).await {
        Ok(())
    } else {
        Err(MonitorError::Internal(anyhow::anyhow!(
            "monitor loop has stopped"
        )))
    }
}

fn page_request(config: &MonitorConfig, limit: Option<i64>, cursor: Option<&str>) -> Result<PageRequest> {
    Ok(PageRequest {
        limit: config.page_limit(limit),
        after: cursor
            .filter(|c| !c.trim().is_empty())
            .map(decode_cursor)
            .transpose()?,
    })
}

fn resolve_time(raw: Option<&str>) -> Result<Option<crate::time::TimeRange>> {
    match raw.map(str::trim).filter(|t| !t.is_empty()) {
        Some(raw) => Ok(Some(parse_time_value(raw)?.resolve(Utc::now())?)),
        None => Ok(None),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn api_key_is_optional() {
        let mut config = MonitorConfig::default();
        assert!(enforce_api_key(&HeaderMap::new(), &config).is_ok());

        config.api_key = Some("secret".into());
        assert!(matches!(
            enforce_api_key(&HeaderMap::new(), &config),
            Err(MonitorError::Auth)
        ));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        assert!(enforce_api_key(&headers, &config).is_ok());
    }

    #[test]
    fn trigger_params_map_unconsumed_flag() {
        let params = TriggerParams {
            reason: Some("Drift".into()),
            unconsumed: Some(true),
            ..TriggerParams::default()
        };
        let filter = params.filter().unwrap();
        assert_eq!(filter.reason, Some(TriggerReason::Drift));
        assert_eq!(filter.consumed, Some(false));

        let bad = TriggerParams {
            reason: Some("retrain".into()),
            ..TriggerParams::default()
        };
        assert!(bad.filter().is_err());
    }

    #[test]
    fn blank_filters_are_ignored() {
        let params = HistoryParams {
            endpoint: Some("  ".into()),
            time: Some("".into()),
            ..HistoryParams::default()
        };
        let filter = params.filter().unwrap();
        assert!(filter.endpoint.is_none());
        assert!(filter.time_range.is_none());
    }
}
