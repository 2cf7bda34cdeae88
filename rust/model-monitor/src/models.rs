//! Records persisted by the metrics store and exchanged over the operational API.

use crate::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One request payload as seen by the serving endpoint, keyed by feature name.
pub type FeatureVector = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Health,
    Predict,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Health => "health",
            ProbeKind::Predict => "predict",
        }
    }
}

/// Outcome of a single health or predict call against a serving endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthProbeResult {
    pub observed_at: DateTime<Utc>,
    pub endpoint: String,
    pub kind: ProbeKind,
    pub latency_ms: f64,
    pub success: bool,
    pub status_code: Option<i32>,
    pub detail: Option<String>,
    pub model_version: Option<String>,
    pub prediction: Option<f64>,
}

/// Latency and success aggregates for one endpoint over one reporting window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetricRecord {
    pub endpoint: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub call_count: i64,
    pub success_count: i64,
    pub mean_latency_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p90_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
}

impl EndpointMetricRecord {
    pub fn success_rate(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.call_count as f64
        }
    }
}

/// Regression quality for one model version, from canary probes or an external evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetricRecord {
    pub recorded_at: DateTime<Utc>,
    pub model_version: Option<String>,
    pub source: String,
    pub rmse: f64,
    pub mae: f64,
    pub r2: Option<f64>,
    pub sample_count: i64,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftDecision {
    Drifted,
    NotDrifted,
    InsufficientData,
}

impl DriftDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftDecision::Drifted => "drifted",
            DriftDecision::NotDrifted => "not_drifted",
            DriftDecision::InsufficientData => "insufficient_data",
        }
    }
}

impl FromStr for DriftDecision {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "drifted" => Ok(DriftDecision::Drifted),
            "not_drifted" => Ok(DriftDecision::NotDrifted),
            "insufficient_data" => Ok(DriftDecision::InsufficientData),
            other => Err(format!("unknown drift decision '{other}'")),
        }
    }
}

/// Result of comparing one feature's live window against its baseline snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub evaluated_at: DateTime<Utc>,
    pub cycle_id: String,
    pub model_version: Option<String>,
    pub feature: String,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub live_size: i64,
    pub baseline_size: i64,
    pub alpha: f64,
    pub decision: DriftDecision,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    Suspended,
    Missed,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Completed => "completed",
            CycleStatus::Suspended => "suspended",
            CycleStatus::Missed => "missed",
            CycleStatus::Failed => "failed",
        }
    }
}

impl FromStr for CycleStatus {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "completed" => Ok(CycleStatus::Completed),
            "suspended" => Ok(CycleStatus::Suspended),
            "missed" => Ok(CycleStatus::Missed),
            "failed" => Ok(CycleStatus::Failed),
            other => Err(format!("unknown cycle status '{other}'")),
        }
    }
}

/// Audit entry for one attempted monitoring cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Drift,
    Degradation,
    Manual,
    /// The active model has been serving longer than the configured maximum age.
    ModelAge,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Drift => "drift",
            TriggerReason::Degradation => "degradation",
            TriggerReason::Manual => "manual",
            TriggerReason::ModelAge => "model_age",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerReason {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drift" => Ok(TriggerReason::Drift),
            "degradation" => Ok(TriggerReason::Degradation),
            "manual" => Ok(TriggerReason::Manual),
            "model_age" => Ok(TriggerReason::ModelAge),
            other => Err(format!("unknown trigger reason '{other}'")),
        }
    }
}

/// Durable request for the retraining collaborator. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingTrigger {
    pub id: String,
    pub reason: TriggerReason,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Training-time reference sample for one feature of one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDistributionSnapshot {
    pub model_version: String,
    pub feature: String,
    pub values: Vec<f64>,
    pub captured_at: DateTime<Utc>,
}

/// Baseline publication from the training side: one sample per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineUpload {
    pub model_version: String,
    pub features: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl BaselineUpload {
    pub fn into_snapshots(self, now: DateTime<Utc>) -> Result<Vec<FeatureDistributionSnapshot>> {
        let model_version = self.model_version.trim().to_string();
        if model_version.is_empty() {
            return Err(MonitorError::InvalidRequest("model_version is required".into()));
        }
        if self.features.is_empty() {
            return Err(MonitorError::InvalidRequest(
                "baseline must contain at least one feature".into(),
            ));
        }
        let captured_at = self.captured_at.unwrap_or(now);
        self.features
            .into_iter()
            .map(|(feature, values)| {
                if !values.iter().any(|v| v.is_finite()) {
                    return Err(MonitorError::InvalidRequest(format!(
                        "feature '{feature}' has no finite baseline values"
                    )));
                }
                Ok(FeatureDistributionSnapshot {
                    model_version: model_version.clone(),
                    feature,
                    values,
                    captured_at,
                })
            })
            .collect()
    }
}

/// Any append-only record the store accepts through `append`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Probe(HealthProbeResult),
    EndpointMetric(EndpointMetricRecord),
    ModelMetric(ModelMetricRecord),
    DriftReport(DriftReport),
    Cycle(CycleRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Probe,
    EndpointMetric,
    ModelMetric,
    DriftReport,
    Cycle,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Probe,
        RecordKind::EndpointMetric,
        RecordKind::ModelMetric,
        RecordKind::DriftReport,
        RecordKind::Cycle,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Probe => "probes",
            RecordKind::EndpointMetric => "endpoint_metrics",
            RecordKind::ModelMetric => "model_metrics",
            RecordKind::DriftReport => "drift_reports",
            RecordKind::Cycle => "cycles",
        }
    }
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Probe(_) => RecordKind::Probe,
            Record::EndpointMetric(_) => RecordKind::EndpointMetric,
            Record::ModelMetric(_) => RecordKind::ModelMetric,
            Record::DriftReport(_) => RecordKind::DriftReport,
            Record::Cycle(_) => RecordKind::Cycle,
        }
    }

    /// The timestamp used for ordering, time-range filters and retention.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Probe(r) => r.observed_at,
            Record::EndpointMetric(r) => r.window_end,
            Record::ModelMetric(r) => r.recorded_at,
            Record::DriftReport(r) => r.evaluated_at,
            Record::Cycle(r) => r.started_at,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Record::Probe(r) => Some(&r.endpoint),
            Record::EndpointMetric(r) => Some(&r.endpoint),
            _ => None,
        }
    }

    pub fn model_version(&self) -> Option<&str> {
        match self {
            Record::Probe(r) => r.model_version.as_deref(),
            Record::ModelMetric(r) => r.model_version.as_deref(),
            Record::DriftReport(r) => r.model_version.as_deref(),
            _ => None,
        }
    }

    pub fn feature(&self) -> Option<&str> {
        match self {
            Record::DriftReport(r) => Some(&r.feature),
            _ => None,
        }
    }
}

/// A record together with the identifier the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: Record,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kind_tags_round_trip_through_json() {
        let record = Record::Cycle(CycleRecord {
            cycle_id: "c1".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: CycleStatus::Missed,
            detail: None,
        });
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "cycle");
        assert_eq!(value["status"], "missed");
    }

    #[test]
    fn baseline_upload_validation() {
        let upload: BaselineUpload = serde_json::from_str(
            r#"{"model_version": "v3", "features": {"MedInc": [1.0, 2.5], "AveRooms": [5.0]}}"#,
        )
        .unwrap();
        let snapshots = upload.into_snapshots(Utc::now()).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.model_version == "v3"));

        let empty = BaselineUpload {
            model_version: " ".into(),
            features: BTreeMap::new(),
            captured_at: None,
        };
        assert!(matches!(
            empty.into_snapshots(Utc::now()),
            Err(MonitorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn trigger_reason_parses_case_insensitively() {
        assert_eq!("Drift".parse::<TriggerReason>(), Ok(TriggerReason::Drift));
        assert!("retrain".parse::<TriggerReason>().is_err());
    }
}
