//! Durable, deduplicated retraining triggers.

use crate::{
    config::TriggerConfig,
    drift::{DegradationStatus, DriftSummary},
    error::{MonitorError, Result},
    models::{RetrainingTrigger, TriggerReason},
    store::{MetricsStore, TriggerInsert},
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::fs;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    Created,
    /// Same reason already fired in this bucket, or an earlier one is still unconsumed.
    Deduplicated,
    /// Automatic retraining is disabled.
    Suppressed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    pub reason: TriggerReason,
    pub action: TriggerAction,
    pub trigger: Option<RetrainingTrigger>,
}

/// Answer to a consume request. Unknown ids are a no-op, not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ConsumeReply {
    Found {
        found: bool,
        #[serde(flatten)]
        trigger: RetrainingTrigger,
    },
    Unknown {
        id: String,
        found: bool,
        consumed: bool,
    },
}

impl ConsumeReply {
    pub fn new(id: &str, trigger: Option<RetrainingTrigger>) -> Self {
        match trigger {
            Some(trigger) => ConsumeReply::Found {
                found: true,
                trigger,
            },
            None => ConsumeReply::Unknown {
                id: id.to_string(),
                found: false,
                consumed: false,
            },
        }
    }
}

/// Deterministic trigger id: UUIDv5 of `"<reason>:<bucket start>"`.
pub fn trigger_id(reason: TriggerReason, at: DateTime<Utc>, bucket: Duration) -> String {
    let width = bucket.as_secs().max(1) as i64;
    let start = at.timestamp().div_euclid(width) * width;
    let bucket_start = Utc
        .timestamp_opt(start, 0)
        .single()
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| start.to_string());
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{bucket_start}", reason.as_str()).as_bytes(),
    )
    .to_string()
}

#[derive(Clone)]
pub struct TriggerManager {
    store: Arc<dyn MetricsStore>,
    config: TriggerConfig,
}

impl TriggerManager {
    pub fn new(store: Arc<dyn MetricsStore>, config: TriggerConfig) -> Self {
        Self { store, config }
    }

    /// Fires drift and degradation triggers for this evaluation, at most one per reason.
    pub async fn evaluate(
        &self,
        drift: Option<&DriftSummary>,
        degradation: &DegradationStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<TriggerOutcome>> {
        let mut outcomes = Vec::new();

        if let Some(summary) = drift.filter(|s| s.overall_drift) {
            let p_values: serde_json::Map<String, Value> = summary
                .reports
                .iter()
                .filter(|r| summary.drifted.contains(&r.feature))
                .map(|r| (r.feature.clone(), json!(r.p_value)))
                .collect();
            let payload = json!({
                "cycle_id": summary.cycle_id,
                "model_version": summary.model_version,
                "drifted_features": summary.drifted,
                "tracked_features": summary.tracked,
                "p_values": p_values,
            });
            outcomes.push(self.automatic(TriggerReason::Drift, payload, now).await?);
        }

        if degradation.degraded {
            let payload = serde_json::to_value(degradation)
                .map_err(|err| MonitorError::Internal(err.into()))?;
            outcomes.push(self.automatic(TriggerReason::Degradation, payload, now).await?);
        }

        Ok(outcomes)
    }

    /// Fires when the model behind the active baseline is older than `max_model_age`.
    pub async fn check_model_age(
        &self,
        model_version: Option<&str>,
        trained_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<TriggerOutcome>> {
        let (Some(max_age), Some(trained_at)) = (self.config.max_model_age, trained_at) else {
            return Ok(None);
        };
        let age = (now - trained_at).to_std().unwrap_or_default();
        if age <= max_age {
            return Ok(None);
        }
        let payload = json!({
            "model_version": model_version,
            "trained_at": trained_at,
            "age_secs": age.as_secs(),
            "max_age_secs": max_age.as_secs(),
        });
        self.automatic(TriggerReason::ModelAge, payload, now)
            .await
            .map(Some)
    }

    /// Operator-requested retraining; subject to the same dedup rule.
    pub async fn request_manual(
        &self,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        self.fire(TriggerReason::Manual, json!({ "note": note }), now)
            .await
    }

    /// Marks a trigger consumed. Unknown and already consumed ids are left as they are.
    pub async fn consume(&self, id: &str) -> Result<Option<RetrainingTrigger>> {
        let Some(trigger) = self.store.consume_trigger(id, Utc::now()).await? else {
            info!(trigger_id = %id, "consume requested for unknown trigger; nothing to do");
            return Ok(None);
        };
        info!(trigger_id = %id, reason = %trigger.reason, "trigger consumed");
        self.publish(&trigger).await;
        Ok(Some(trigger))
    }

    async fn automatic(
        &self,
        reason: TriggerReason,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        if !self.config.automatic_retraining {
            info!(%reason, "automatic retraining disabled; trigger suppressed");
            return Ok(TriggerOutcome {
                reason,
                action: TriggerAction::Suppressed,
                trigger: None,
            });
        }
        self.fire(reason, payload, now).await
    }

    async fn fire(
        &self,
        reason: TriggerReason,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        let trigger = RetrainingTrigger {
            id: trigger_id(reason, now, self.config.bucket),
            reason,
            payload,
            created_at: now,
            consumed: false,
            consumed_at: None,
        };

        let outcome = match self.store.insert_trigger(trigger).await? {
            TriggerInsert::Created(trigger) => {
                info!(trigger_id = %trigger.id, %reason, "retraining trigger created");
                self.publish(&trigger).await;
                TriggerOutcome {
                    reason,
                    action: TriggerAction::Created,
                    trigger: Some(trigger),
                }
            }
            TriggerInsert::AlreadyExists(existing) | TriggerInsert::UnconsumedPending(existing) => {
                info!(
                    trigger_id = %existing.id,
                    %reason,
                    consumed = existing.consumed,
                    "retraining trigger deduplicated"
                );
                TriggerOutcome {
                    reason,
                    action: TriggerAction::Deduplicated,
                    trigger: Some(existing),
                }
            }
        };
        Ok(outcome)
    }

    /// Mirrors the trigger to `<artifact_dir>/<id>.trigger`. The store row stays authoritative.
    async fn publish(&self, trigger: &RetrainingTrigger) {
        let Some(dir) = self.config.artifact_dir.as_deref() else {
            return;
        };
        if let Err(err) = write_artifact(dir, trigger).await {
            error!(
                trigger_id = %trigger.id,
                dir = %dir.display(),
                error = %err,
                "failed to publish trigger artifact"
            );
        }
    }
}

async fn write_artifact(dir: &Path, trigger: &RetrainingTrigger) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec_pretty(trigger)?;
    let target = dir.join(format!("{}.trigger", trigger.id));
    let tmp = dir.join(format!(".{}.trigger.tmp", trigger.id));
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, &target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{DriftDecision, DriftReport},
        store::FileStore,
    };
    use pretty_assertions::assert_eq;

    fn degraded(degraded: bool) -> DegradationStatus {
        DegradationStatus {
            metric: "canary_abs_residual".into(),
            threshold: 1.0,
            window_len: 3,
            window_mean: Some(2.0),
            consecutive: if degraded { 3 } else { 0 },
            required: 3,
            degraded,
        }
    }

    fn drifting(now: DateTime<Utc>) -> DriftSummary {
        DriftSummary {
            cycle_id: "c1".into(),
            evaluated_at: now,
            model_version: Some("v1".into()),
            tracked: 1,
            insufficient: 0,
            drifted: vec!["MedInc".into()],
            drift_fraction: 0.0,
            overall_drift: true,
            reports: vec![DriftReport {
                evaluated_at: now,
                cycle_id: "c1".into(),
                model_version: Some("v1".into()),
                feature: "MedInc".into(),
                statistic: Some(0.9),
                p_value: Some(1e-9),
                live_size: 100,
                baseline_size: 500,
                alpha: 0.05,
                decision: DriftDecision::Drifted,
                detail: None,
            }],
        }
    }

    async fn manager(dir: &Path, config: TriggerConfig) -> TriggerManager {
        let store = FileStore::open(dir.join("store")).await.unwrap();
        TriggerManager::new(Arc::new(store), config)
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn ids_are_stable_within_a_bucket() {
        let hour = Duration::from_secs(3600);
        let a = trigger_id(TriggerReason::Drift, at("2026-03-01T10:05:00Z"), hour);
        let b = trigger_id(TriggerReason::Drift, at("2026-03-01T10:55:00Z"), hour);
        let c = trigger_id(TriggerReason::Drift, at("2026-03-01T11:00:00Z"), hour);
        let d = trigger_id(TriggerReason::Degradation, at("2026-03-01T10:05:00Z"), hour);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[tokio::test]
    async fn repeated_breaches_in_a_bucket_create_one_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), TriggerConfig::default()).await;
        let now = at("2026-03-01T10:05:00Z");

        let first = manager
            .evaluate(Some(&drifting(now)), &degraded(true), now)
            .await
            .unwrap();
        assert_eq!(
            first.iter().map(|o| o.action).collect::<Vec<_>>(),
            vec![TriggerAction::Created, TriggerAction::Created]
        );

        let later = now + chrono::Duration::minutes(20);
        let second = manager
            .evaluate(Some(&drifting(later)), &degraded(true), later)
            .await
            .unwrap();
        assert!(second.iter().all(|o| o.action == TriggerAction::Deduplicated));
        assert_eq!(second[0].trigger.as_ref().unwrap().id, first[0].trigger.as_ref().unwrap().id);
    }

    #[tokio::test]
    async fn consume_is_idempotent_and_rewrites_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join("triggers");
        let config = TriggerConfig {
            artifact_dir: Some(artifacts.clone()),
            ..TriggerConfig::default()
        };
        let manager = manager(dir.path(), config).await;

        let outcome = manager
            .request_manual(Some("quarterly refresh".into()), Utc::now())
            .await
            .unwrap();
        let id = outcome.trigger.unwrap().id;
        let artifact = artifacts.join(format!("{id}.trigger"));
        let published: RetrainingTrigger =
            serde_json::from_slice(&std::fs::read(&artifact).unwrap()).unwrap();
        assert!(!published.consumed);

        let first = manager.consume(&id).await.unwrap().unwrap();
        let second = manager.consume(&id).await.unwrap().unwrap();
        assert!(first.consumed);
        assert_eq!(first.consumed_at, second.consumed_at);

        let rewritten: RetrainingTrigger =
            serde_json::from_slice(&std::fs::read(&artifact).unwrap()).unwrap();
        assert!(rewritten.consumed);

        assert!(manager.consume("no-such-trigger").await.unwrap().is_none());

        let reply = serde_json::to_value(ConsumeReply::new(&id, Some(second))).unwrap();
        assert_eq!(reply["found"], true);
        assert_eq!(reply["id"], id.as_str());
        assert_eq!(reply["consumed"], true);
        let unknown = serde_json::to_value(ConsumeReply::new("no-such-trigger", None)).unwrap();
        assert_eq!(
            unknown,
            json!({ "id": "no-such-trigger", "found": false, "consumed": false })
        );
    }

    #[tokio::test]
    async fn disabled_automation_suppresses_but_allows_manual() {
        let dir = tempfile::tempdir().unwrap();
        let config = TriggerConfig {
            automatic_retraining: false,
            ..TriggerConfig::default()
        };
        let manager = manager(dir.path(), config).await;
        let now = Utc::now();

        let outcomes = manager
            .evaluate(Some(&drifting(now)), &degraded(true), now)
            .await
            .unwrap();
        assert!(outcomes.iter().all(|o| o.action == TriggerAction::Suppressed));

        let manual = manager.request_manual(None, now).await.unwrap();
        assert_eq!(manual.action, TriggerAction::Created);
    }

    #[tokio::test]
    async fn quiet_evaluation_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), TriggerConfig::default()).await;
        let outcomes = manager
            .evaluate(None, &degraded(false), Utc::now())
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn stale_model_fires_once_per_pending_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let config = TriggerConfig {
            max_model_age: Some(Duration::from_secs(7 * 86_400)),
            ..TriggerConfig::default()
        };
        let manager = manager(dir.path(), config).await;
        let now = at("2026-03-10T12:00:00Z");

        let fresh = manager
            .check_model_age(Some("v1"), Some(at("2026-03-05T00:00:00Z")), now)
            .await
            .unwrap();
        assert!(fresh.is_none());
        assert!(manager.check_model_age(Some("v1"), None, now).await.unwrap().is_none());

        let trained = Some(at("2026-03-01T00:00:00Z"));
        let stale = manager
            .check_model_age(Some("v1"), trained, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.reason, TriggerReason::ModelAge);
        assert_eq!(stale.action, TriggerAction::Created);
        let trigger = stale.trigger.unwrap();
        assert_eq!(trigger.payload["model_version"], "v1");
        assert_eq!(trigger.payload["max_age_secs"], 7 * 86_400);

        let later = now + chrono::Duration::hours(3);
        let again = manager
            .check_model_age(Some("v1"), trained, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.action, TriggerAction::Deduplicated);
    }

    #[tokio::test]
    async fn model_age_check_is_off_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), TriggerConfig::default()).await;
        let outcome = manager
            .check_model_age(Some("v1"), Some(at("2020-01-01T00:00:00Z")), Utc::now())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
