//! Durable metrics store: append-only history tables, the trigger ledger and baselines.

pub mod buffer;
pub mod db;
pub mod file;
pub mod pg;
pub mod schema;

use crate::{
    config::{StoreBackend, StoreConfig},
    error::{MonitorError, Result},
    models::{FeatureDistributionSnapshot, Record, RecordKind, RetrainingTrigger, StoredRecord, TriggerReason},
    pagination::{decode_cursor, Page, PageRequest},
    time::TimeRange,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, Stream, TryStreamExt};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

pub use buffer::BufferedWriter;
pub use file::FileStore;
pub use pg::PgStore;

/// Filters shared by every history table; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub endpoint: Option<String>,
    pub model_version: Option<String>,
    pub feature: Option<String>,
    pub time_range: Option<TimeRange>,
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(endpoint) = &self.endpoint {
            if record.endpoint() != Some(endpoint.as_str()) {
                return false;
            }
        }
        if let Some(version) = &self.model_version {
            if record.model_version() != Some(version.as_str()) {
                return false;
            }
        }
        if let Some(feature) = &self.feature {
            if record.feature() != Some(feature.as_str()) {
                return false;
            }
        }
        self.time_range
            .map_or(true, |range| range.contains(record.timestamp()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TriggerFilter {
    pub reason: Option<TriggerReason>,
    pub consumed: Option<bool>,
    pub time_range: Option<TimeRange>,
}

impl TriggerFilter {
    pub fn unconsumed() -> Self {
        Self {
            consumed: Some(false),
            ..Self::default()
        }
    }

    pub fn matches(&self, trigger: &RetrainingTrigger) -> bool {
        self.reason.map_or(true, |reason| trigger.reason == reason)
            && self.consumed.map_or(true, |consumed| trigger.consumed == consumed)
            && self
                .time_range
                .map_or(true, |range| range.contains(trigger.created_at))
    }
}

/// Outcome of the atomic create-unless-duplicate trigger insert.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerInsert {
    Created(RetrainingTrigger),
    /// A trigger with the same id (same reason and bucket) exists, consumed or not.
    AlreadyExists(RetrainingTrigger),
    /// Another unconsumed trigger of the same reason is still pending.
    UnconsumedPending(RetrainingTrigger),
}

impl TriggerInsert {
    pub fn created(&self) -> bool {
        matches!(self, TriggerInsert::Created(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub tables: BTreeMap<String, i64>,
    pub probe_success_rate: Option<f64>,
    pub mean_probe_latency_ms: Option<f64>,
    pub unconsumed_triggers: i64,
    pub baseline_model_version: Option<String>,
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Durably appends one history record and returns its assigned id.
    async fn append(&self, record: &Record) -> Result<i64>;

    /// One page of `kind` records, newest first (ties by id descending).
    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page<StoredRecord>>;

    /// Deletes history records strictly older than `older_than`. Triggers and baselines are kept.
    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn insert_trigger(&self, trigger: RetrainingTrigger) -> Result<TriggerInsert>;

    /// Marks a trigger consumed. Already consumed triggers are returned unchanged; unknown ids yield `None`.
    async fn consume_trigger(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RetrainingTrigger>>;

    async fn get_trigger(&self, id: &str) -> Result<Option<RetrainingTrigger>>;

    async fn list_triggers(
        &self,
        filter: &TriggerFilter,
        page: &PageRequest,
    ) -> Result<Page<RetrainingTrigger>>;

    /// Publishes the snapshots of one model version. A version can only be published once.
    async fn put_baselines(
        &self,
        model_version: &str,
        snapshots: Vec<FeatureDistributionSnapshot>,
    ) -> Result<()>;

    /// Snapshots of the most recently published model version; empty when none exist.
    async fn latest_baselines(&self) -> Result<Vec<FeatureDistributionSnapshot>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Lazily walks every matching record newest first, one keyset page at a time.
pub fn stream_records(
    store: Arc<dyn MetricsStore>,
    kind: RecordKind,
    filter: RecordFilter,
    page_size: i64,
) -> impl Stream<Item = Result<StoredRecord>> {
    let first = Some(PageRequest::first(page_size));
    stream::try_unfold(first, move |next| {
        let store = Arc::clone(&store);
        let filter = filter.clone();
        async move {
            let Some(request) = next else {
                return Ok(None);
            };
            let page = store.query(kind, &filter, &request).await?;
            let following = match page.next_cursor.as_deref() {
                Some(cursor) => Some(PageRequest {
                    limit: request.limit,
                    after: Some(decode_cursor(cursor)?),
                }),
                None => None,
            };
            let rows = stream::iter(page.results.into_iter().map(Ok));
            Ok::<_, MonitorError>(Some((rows, following)))
        }
    })
    .try_flatten()
}

/// Builds the configured backend.
pub async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn MetricsStore>> {
    match config.backend {
        StoreBackend::File => {
            let store = FileStore::open(&config.data_dir)
                .await
                .with_context(|| format!("failed to open file store at {}", config.data_dir.display()))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Postgres => {
            let pool = db::connect_pool(config).await?;
            let store = PgStore::new(pool, config.timeout);
            store
                .bootstrap()
                .await
                .context("failed to bootstrap monitor schema")?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CycleRecord, CycleStatus};
    use chrono::TimeZone;

    fn cycle(ts: DateTime<Utc>) -> Record {
        Record::Cycle(CycleRecord {
            cycle_id: "c".into(),
            started_at: ts,
            finished_at: ts,
            status: CycleStatus::Completed,
            detail: None,
        })
    }

    #[test]
    fn record_filter_applies_every_field() {
        let ts = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let record = cycle(ts);
        assert!(RecordFilter::default().matches(&record));

        let by_endpoint = RecordFilter {
            endpoint: Some("primary".into()),
            ..RecordFilter::default()
        };
        assert!(!by_endpoint.matches(&record));

        let by_time = RecordFilter {
            time_range: Some(TimeRange {
                start: ts - chrono::Duration::hours(1),
                end: ts,
            }),
            ..RecordFilter::default()
        };
        assert!(by_time.matches(&record));
    }

    #[test]
    fn trigger_filter_by_reason_and_state() {
        let trigger = RetrainingTrigger {
            id: "t".into(),
            reason: TriggerReason::Drift,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
            consumed: false,
            consumed_at: None,
        };
        assert!(TriggerFilter::unconsumed().matches(&trigger));
        let degradation = TriggerFilter {
            reason: Some(TriggerReason::Degradation),
            ..TriggerFilter::default()
        };
        assert!(!degradation.matches(&trigger));
    }
}
