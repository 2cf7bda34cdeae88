//! Postgres backend checks. Skipped unless MONITOR_TEST_DATABASE_URL is set.

mod support;

use chrono::Utc;
use model_monitor::{
    config::{StoreBackend, StoreConfig},
    error::MonitorError,
    models::{
        FeatureDistributionSnapshot, HealthProbeResult, ProbeKind, Record, RecordKind,
        RetrainingTrigger, TriggerReason,
    },
    pagination::PageRequest,
    store::{open_store, MetricsStore, RecordFilter, TriggerFilter, TriggerInsert},
};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

async fn pg_store() -> Option<Arc<dyn MetricsStore>> {
    let Ok(url) = std::env::var("MONITOR_TEST_DATABASE_URL") else {
        eprintln!("[model-monitor-test] skipping postgres store: MONITOR_TEST_DATABASE_URL is not set");
        return None;
    };
    let config = StoreConfig {
        backend: StoreBackend::Postgres,
        database_url: Some(url),
        ..StoreConfig::default()
    };
    Some(open_store(&config).await.expect("postgres store"))
}

/// Earlier runs may leave unconsumed triggers behind; they would dedup ours away.
async fn consume_pending(store: &Arc<dyn MetricsStore>) {
    let pending = store
        .list_triggers(&TriggerFilter::unconsumed(), &PageRequest::first(500))
        .await
        .unwrap();
    for trigger in pending.results {
        store.consume_trigger(&trigger.id, Utc::now()).await.unwrap();
    }
}

#[tokio::test]
#[serial]
async fn appends_are_queryable_by_endpoint() {
    let Some(store) = pg_store().await else {
        return;
    };
    let endpoint = format!("pg-test-{}", Uuid::new_v4());
    for success in [true, false, true] {
        store
            .append(&Record::Probe(HealthProbeResult {
                observed_at: Utc::now(),
                endpoint: endpoint.clone(),
                kind: ProbeKind::Health,
                latency_ms: 3.5,
                success,
                status_code: Some(if success { 200 } else { 503 }),
                detail: None,
                model_version: None,
                prediction: None,
            }))
            .await
            .unwrap();
    }

    let filter = RecordFilter {
        endpoint: Some(endpoint.clone()),
        ..RecordFilter::default()
    };
    let first = store
        .query(RecordKind::Probe, &filter, &PageRequest::first(2))
        .await
        .unwrap();
    assert_eq!(first.results.len(), 2);
    assert!(first.results[0].id > first.results[1].id);
    let cursor = model_monitor::pagination::decode_cursor(first.next_cursor.as_deref().unwrap())
        .unwrap();
    let rest = store
        .query(
            RecordKind::Probe,
            &filter,
            &PageRequest {
                limit: 2,
                after: Some(cursor),
            },
        )
        .await
        .unwrap();
    assert_eq!(rest.results.len(), 1);
    assert!(rest.next_cursor.is_none());
}

#[tokio::test]
#[serial]
async fn trigger_ledger_dedups_and_consumes_idempotently() {
    let Some(store) = pg_store().await else {
        return;
    };
    consume_pending(&store).await;

    let trigger = |id: String| RetrainingTrigger {
        id,
        reason: TriggerReason::Degradation,
        payload: json!({ "source": "pg_store test" }),
        created_at: Utc::now(),
        consumed: false,
        consumed_at: None,
    };
    let id = Uuid::new_v4().to_string();

    assert!(store.insert_trigger(trigger(id.clone())).await.unwrap().created());
    assert!(matches!(
        store.insert_trigger(trigger(id.clone())).await.unwrap(),
        TriggerInsert::AlreadyExists(_)
    ));
    assert!(matches!(
        store
            .insert_trigger(trigger(Uuid::new_v4().to_string()))
            .await
            .unwrap(),
        TriggerInsert::UnconsumedPending(existing) if existing.id == id
    ));

    let first = store.consume_trigger(&id, Utc::now()).await.unwrap().unwrap();
    let second = store.consume_trigger(&id, Utc::now()).await.unwrap().unwrap();
    assert!(first.consumed && second.consumed);
    assert!(second.consumed_at.is_some());
    assert!(store.consume_trigger("missing", Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn newest_baseline_wins_and_versions_are_immutable() {
    let Some(store) = pg_store().await else {
        return;
    };
    let version = format!("pg-{}", Uuid::new_v4());
    let snapshot = |feature: &str| FeatureDistributionSnapshot {
        model_version: version.clone(),
        feature: feature.to_string(),
        values: vec![0.5, 1.5, 2.5],
        captured_at: Utc::now(),
    };

    store
        .put_baselines(&version, vec![snapshot("MedInc"), snapshot("HouseAge")])
        .await
        .unwrap();
    let latest = store.latest_baselines().await.unwrap();
    assert_eq!(latest.len(), 2);
    assert!(latest.iter().all(|s| s.model_version == version));

    let again = store.put_baselines(&version, vec![snapshot("MedInc")]).await;
    assert!(matches!(again, Err(MonitorError::InvalidRequest(_))));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.baseline_model_version.as_deref(), Some(version.as_str()));
}
