#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use model_monitor::{
    config::{EndpointConfig, MonitorConfig, ProbeSample, StoreBackend},
    error::{MonitorError, Result},
    models::{
        CycleRecord, CycleStatus, FeatureDistributionSnapshot, FeatureVector, Record, RecordKind,
        RetrainingTrigger, StoredRecord,
    },
    pagination::{Cursor, Page, PageRequest},
    probe::{HealthStatus, Prediction, Reply, ServingClient, TappedInput},
    store::{MetricsStore, RecordFilter, StoreStats, TriggerFilter, TriggerInsert},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    path::Path,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::time::Instant;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

/// File-backed configuration rooted in a temp dir, with one endpoint and one canary sample.
pub fn test_config(dir: &Path) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.api_key = Some(API_KEY.to_string());
    config.store.backend = StoreBackend::File;
    config.store.data_dir = dir.join("store");
    config.probe.endpoints = vec![EndpointConfig {
        name: "primary".into(),
        base_url: "http://serving.test".into(),
        health_path: "/health".into(),
        predict_path: "/predict".into(),
        inputs_path: None,
    }];
    config.probe.samples = vec![ProbeSample {
        name: Some("canary".into()),
        features: FeatureVector::from([("MedInc".to_string(), 8.3252)]),
        expected: Some(4.526),
    }];
    config
}

pub fn cycle_at(ts: DateTime<Utc>, cycle_id: &str) -> Record {
    Record::Cycle(CycleRecord {
        cycle_id: cycle_id.to_string(),
        started_at: ts,
        finished_at: ts,
        status: CycleStatus::Completed,
        detail: None,
    })
}

/// Sends one request through the router and decodes the JSON body (`Null` when empty).
pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router responded");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body collected");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .expect("request")
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

/// Serving stub: answers a fixed prediction, optionally stalls its first health call.
///
/// The input tap returns `tap` on every read, like a "recent requests" view.
pub struct StubServing {
    pub healthy: AtomicBool,
    pub prediction: f64,
    pub stall_first: Option<Duration>,
    pub health_calls: Mutex<Vec<Instant>>,
    pub tap: Mutex<Vec<TappedInput>>,
    pub tap_since: Mutex<Vec<Option<DateTime<Utc>>>>,
    calls: AtomicUsize,
}

impl StubServing {
    pub fn new(prediction: f64) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            prediction,
            stall_first: None,
            health_calls: Mutex::new(Vec::new()),
            tap: Mutex::new(Vec::new()),
            tap_since: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn stalling_first(prediction: f64, stall: Duration) -> Self {
        Self {
            stall_first: Some(stall),
            ..Self::new(prediction)
        }
    }
}

#[async_trait]
impl ServingClient for StubServing {
    async fn health(&self, _: &EndpointConfig) -> Result<Reply<HealthStatus>> {
        self.health_calls.lock().push(Instant::now());
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(stall) = self.stall_first {
                tokio::time::sleep(stall).await;
            }
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Ok(Reply::failed(503, "model not loaded"));
        }
        Ok(Reply::ok(HealthStatus {
            status: "healthy".into(),
            message: Some("API is running".into()),
        }))
    }

    async fn predict(&self, _: &EndpointConfig, _: &FeatureVector) -> Result<Reply<Prediction>> {
        Ok(Reply::ok(Prediction {
            prediction: self.prediction,
            model_version: Some("xgboost".into()),
        }))
    }

    async fn recent_inputs(
        &self,
        _: &EndpointConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TappedInput>> {
        self.tap_since.lock().push(since);
        Ok(self.tap.lock().clone())
    }
}

/// In-memory store; keeps the loop tests free of filesystem work under a paused clock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Fails appends with a non-transient error while set.
    pub reject_appends: AtomicBool,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    records: Vec<StoredRecord>,
    triggers: Vec<RetrainingTrigger>,
    baselines: Vec<FeatureDistributionSnapshot>,
}

impl MemoryStore {
    pub fn records(&self, kind: RecordKind) -> Vec<Record> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|stored| stored.record.kind() == kind)
            .map(|stored| stored.record.clone())
            .collect()
    }
}

fn keyed_page<T>(mut rows: Vec<(Cursor, T)>, page: &PageRequest) -> Page<T> {
    if let Some(after) = &page.after {
        rows.retain(|(key, _)| after.precedes(key.ts, key.id));
    }
    rows.sort_by(|(a, _), (b, _)| (b.ts, b.id).cmp(&(a.ts, a.id)));
    rows.truncate(page.limit.max(1) as usize + 1);
    let page = Page::from_rows(rows, page.limit, |(key, _)| *key);
    Page {
        results: page.results.into_iter().map(|(_, row)| row).collect(),
        next_cursor: page.next_cursor,
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn append(&self, record: &Record) -> Result<i64> {
        if self.reject_appends.load(Ordering::SeqCst) {
            return Err(MonitorError::InvalidRequest(format!(
                "{} rows are read-only",
                record.kind().table()
            )));
        }
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push(StoredRecord {
            id,
            record: record.clone(),
        });
        Ok(id)
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page<StoredRecord>> {
        let rows = self
            .inner
            .lock()
            .records
            .iter()
            .filter(|stored| stored.record.kind() == kind && filter.matches(&stored.record))
            .map(|stored| {
                let key = Cursor {
                    ts: stored.record.timestamp(),
                    id: stored.id,
                };
                (key, stored.clone())
            })
            .collect();
        Ok(keyed_page(rows, page))
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner
            .records
            .retain(|stored| stored.record.timestamp() >= older_than);
        Ok((before - inner.records.len()) as u64)
    }

    async fn insert_trigger(&self, trigger: RetrainingTrigger) -> Result<TriggerInsert> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.triggers.iter().find(|t| t.id == trigger.id) {
            return Ok(TriggerInsert::AlreadyExists(existing.clone()));
        }
        if let Some(existing) = inner
            .triggers
            .iter()
            .find(|t| t.reason == trigger.reason && !t.consumed)
        {
            return Ok(TriggerInsert::UnconsumedPending(existing.clone()));
        }
        inner.triggers.push(trigger.clone());
        Ok(TriggerInsert::Created(trigger))
    }

    async fn consume_trigger(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RetrainingTrigger>> {
        let mut inner = self.inner.lock();
        let Some(trigger) = inner.triggers.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        if !trigger.consumed {
            trigger.consumed = true;
            trigger.consumed_at = Some(at);
        }
        Ok(Some(trigger.clone()))
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<RetrainingTrigger>> {
        Ok(self.inner.lock().triggers.iter().find(|t| t.id == id).cloned())
    }

    async fn list_triggers(
        &self,
        filter: &TriggerFilter,
        page: &PageRequest,
    ) -> Result<Page<RetrainingTrigger>> {
        let rows = self
            .inner
            .lock()
            .triggers
            .iter()
            .enumerate()
            .filter(|(_, t)| filter.matches(t))
            .map(|(seq, t)| {
                let key = Cursor {
                    ts: t.created_at,
                    id: seq as i64,
                };
                (key, t.clone())
            })
            .collect();
        Ok(keyed_page(rows, page))
    }

    async fn put_baselines(
        &self,
        _model_version: &str,
        snapshots: Vec<FeatureDistributionSnapshot>,
    ) -> Result<()> {
        self.inner.lock().baselines = snapshots;
        Ok(())
    }

    async fn latest_baselines(&self) -> Result<Vec<FeatureDistributionSnapshot>> {
        Ok(self.inner.lock().baselines.clone())
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats::default())
    }
}
