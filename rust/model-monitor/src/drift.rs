//! Per-feature distribution drift against a training baseline, and the rolling
//! degradation signal of a proxy-quality metric.

use crate::{
    config::{DegradationConfig, DegradationDirection, DriftConfig},
    models::{DriftDecision, DriftReport, FeatureDistributionSnapshot, FeatureVector},
    stats::{is_degenerate, ks_two_sample},
    window::RingWindow,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Outcome of one evaluation over every tracked feature.
#[derive(Debug, Clone, Serialize)]
pub struct DriftSummary {
    pub cycle_id: String,
    pub evaluated_at: DateTime<Utc>,
    pub model_version: Option<String>,
    pub tracked: usize,
    pub insufficient: usize,
    pub drifted: Vec<String>,
    pub drift_fraction: f64,
    pub overall_drift: bool,
    pub reports: Vec<DriftReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradationStatus {
    pub metric: String,
    pub threshold: f64,
    pub window_len: usize,
    pub window_mean: Option<f64>,
    pub consecutive: u32,
    pub required: u32,
    pub degraded: bool,
}

/// Rolling window of a proxy-quality metric with a consecutive-breach counter.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    metric: String,
    threshold: f64,
    direction: DegradationDirection,
    window: RingWindow<f64>,
    required: u32,
    consecutive: u32,
}

impl PerformanceTracker {
    pub fn new(config: &DegradationConfig) -> Self {
        Self {
            metric: config.metric.clone(),
            threshold: config.threshold,
            direction: config.direction,
            window: RingWindow::new(config.window),
            required: config.consecutive,
            consecutive: 0,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Pushes the mean of this cycle's observations. A cycle without finite
    /// observations leaves the window and the counter untouched.
    pub fn record_cycle(&mut self, observations: &[f64]) -> DegradationStatus {
        let finite: Vec<f64> = observations.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return self.status();
        }

        self.window.push(finite.iter().sum::<f64>() / finite.len() as f64);
        let unfavorable = self.window.mean().map_or(false, |mean| match self.direction {
            DegradationDirection::HigherIsWorse => mean > self.threshold,
            DegradationDirection::LowerIsWorse => mean < self.threshold,
        });
        if unfavorable {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
        }
        self.status()
    }

    pub fn status(&self) -> DegradationStatus {
        DegradationStatus {
            metric: self.metric.clone(),
            threshold: self.threshold,
            window_len: self.window.len(),
            window_mean: self.window.mean(),
            consecutive: self.consecutive,
            required: self.required,
            degraded: self.consecutive >= self.required,
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.consecutive = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub model_version: Option<String>,
    pub trained_at: Option<DateTime<Utc>>,
    pub baseline_features: Vec<String>,
    pub window_sizes: BTreeMap<String, usize>,
    pub degradation: DegradationStatus,
}

/// Live windows, active baseline and performance tracker of one monitor.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    config: DriftConfig,
    model_version: Option<String>,
    /// When the active baseline was captured, i.e. when its model was trained.
    trained_at: Option<DateTime<Utc>>,
    baselines: BTreeMap<String, Vec<f64>>,
    windows: BTreeMap<String, RingWindow<f64>>,
    performance: PerformanceTracker,
}

impl DriftDetector {
    pub fn new(config: &DriftConfig, degradation: &DegradationConfig) -> Self {
        Self {
            config: config.clone(),
            model_version: None,
            trained_at: None,
            baselines: BTreeMap::new(),
            windows: BTreeMap::new(),
            performance: PerformanceTracker::new(degradation),
        }
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn trained_at(&self) -> Option<DateTime<Utc>> {
        self.trained_at
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.performance
    }

    /// Activates the snapshots when they belong to a different model version.
    /// Live and performance windows restart because they describe the old model.
    pub fn install_baselines(&mut self, snapshots: Vec<FeatureDistributionSnapshot>) -> bool {
        let Some(version) = snapshots.first().map(|s| s.model_version.clone()) else {
            return false;
        };
        if self.model_version.as_deref() == Some(version.as_str()) {
            return false;
        }

        self.trained_at = snapshots
            .iter()
            .filter(|s| s.model_version == version)
            .map(|s| s.captured_at)
            .max();
        self.baselines = snapshots
            .into_iter()
            .filter(|s| s.model_version == version)
            .map(|s| {
                let values = s.values.into_iter().filter(|v| v.is_finite()).collect();
                (s.feature, values)
            })
            .collect();
        self.windows.clear();
        self.performance.reset();
        info!(
            model_version = %version,
            previous = ?self.model_version,
            features = self.baselines.len(),
            "activated baseline"
        );
        self.model_version = Some(version);
        true
    }

    /// Configured features, or every baseline feature when none are configured.
    pub fn tracked_features(&self) -> Vec<String> {
        if self.config.features.is_empty() {
            self.baselines.keys().cloned().collect()
        } else {
            let unique: BTreeSet<&String> = self.config.features.iter().collect();
            unique.into_iter().cloned().collect()
        }
    }

    fn is_tracked(&self, feature: &str) -> bool {
        if self.config.features.is_empty() {
            self.baselines.contains_key(feature)
        } else {
            self.config.features.iter().any(|f| f == feature)
        }
    }

    /// Feeds one observed request payload into the live windows.
    pub fn observe(&mut self, features: &FeatureVector) {
        for (name, value) in features {
            if !value.is_finite() || !self.is_tracked(name) {
                continue;
            }
            let capacity = self.config.window_capacity;
            self.windows
                .entry(name.clone())
                .or_insert_with(|| RingWindow::new(capacity))
                .push(*value);
        }
    }

    pub fn observe_all<'a>(&mut self, batch: impl IntoIterator<Item = &'a FeatureVector>) {
        for features in batch {
            self.observe(features);
        }
    }

    pub fn record_performance(&mut self, observations: &[f64]) -> DegradationStatus {
        self.performance.record_cycle(observations)
    }

    pub fn degradation(&self) -> DegradationStatus {
        self.performance.status()
    }

    /// Compares every tracked feature's live window with its baseline.
    pub fn evaluate(&self, cycle_id: &str, now: DateTime<Utc>) -> DriftSummary {
        self.summarize(cycle_id, now, |feature| {
            self.windows
                .get(feature)
                .map(RingWindow::to_vec)
                .unwrap_or_default()
        })
    }

    /// Evaluates an ad-hoc batch against the active baseline without touching live windows.
    pub fn check_batch(&self, cycle_id: &str, now: DateTime<Utc>, batch: &[FeatureVector]) -> DriftSummary {
        let mut samples: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for features in batch {
            for (name, value) in features {
                if value.is_finite() {
                    samples.entry(name.as_str()).or_default().push(*value);
                }
            }
        }
        self.summarize(cycle_id, now, |feature| {
            samples.get(feature).cloned().unwrap_or_default()
        })
    }

    pub fn status(&self) -> DetectorStatus {
        DetectorStatus {
            model_version: self.model_version.clone(),
            trained_at: self.trained_at,
            baseline_features: self.baselines.keys().cloned().collect(),
            window_sizes: self
                .windows
                .iter()
                .map(|(name, window)| (name.clone(), window.len()))
                .collect(),
            degradation: self.performance.status(),
        }
    }

    fn summarize(
        &self,
        cycle_id: &str,
        now: DateTime<Utc>,
        live_sample: impl Fn(&str) -> Vec<f64>,
    ) -> DriftSummary {
        let tracked = self.tracked_features();
        let reports: Vec<DriftReport> = tracked
            .iter()
            .map(|feature| self.compare(cycle_id, now, feature, &live_sample(feature)))
            .collect();

        let drifted: Vec<String> = reports
            .iter()
            .filter(|r| r.decision == DriftDecision::Drifted)
            .map(|r| r.feature.clone())
            .collect();
        let insufficient = reports
            .iter()
            .filter(|r| r.decision == DriftDecision::InsufficientData)
            .count();
        let overall_drift = !drifted.is_empty()
            && drifted.len() as f64 > self.config.drift_fraction * tracked.len() as f64;

        debug!(
            cycle_id,
            tracked = tracked.len(),
            drifted = drifted.len(),
            insufficient,
            overall_drift,
            "drift evaluation finished"
        );

        DriftSummary {
            cycle_id: cycle_id.to_string(),
            evaluated_at: now,
            model_version: self.model_version.clone(),
            tracked: tracked.len(),
            insufficient,
            drifted,
            drift_fraction: self.config.drift_fraction,
            overall_drift,
            reports,
        }
    }

    fn compare(&self, cycle_id: &str, now: DateTime<Utc>, feature: &str, live: &[f64]) -> DriftReport {
        let baseline = self.baselines.get(feature);
        let mut report = DriftReport {
            evaluated_at: now,
            cycle_id: cycle_id.to_string(),
            model_version: self.model_version.clone(),
            feature: feature.to_string(),
            statistic: None,
            p_value: None,
            live_size: live.len() as i64,
            baseline_size: baseline.map_or(0, |b| b.len() as i64),
            alpha: self.config.alpha,
            decision: DriftDecision::InsufficientData,
            detail: None,
        };

        let Some(baseline) = baseline else {
            report.detail = Some("no baseline snapshot for feature".into());
            return report;
        };
        if live.len() < self.config.min_window {
            report.detail = Some(format!(
                "live window holds {} of {} required values",
                live.len(),
                self.config.min_window
            ));
            return report;
        }
        if baseline.is_empty() {
            report.detail = Some("baseline has no finite values".into());
            return report;
        }
        if is_degenerate(baseline) || is_degenerate(live) {
            report.detail = Some("constant sample; distribution test undefined".into());
            return report;
        }

        let Some(outcome) = ks_two_sample(baseline, live) else {
            report.detail = Some("no finite values to compare".into());
            return report;
        };
        report.statistic = Some(outcome.statistic);
        report.p_value = Some(outcome.p_value);
        report.decision = if outcome.p_value < self.config.alpha {
            DriftDecision::Drifted
        } else {
            DriftDecision::NotDrifted
        };
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn normal(rng: &mut StdRng, mean: f64, sd: f64) -> f64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        mean + sd * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn sample(rng: &mut StdRng, n: usize, mean: f64) -> Vec<f64> {
        (0..n).map(|_| normal(rng, mean, 1.0)).collect()
    }

    fn snapshot(version: &str, feature: &str, values: Vec<f64>) -> FeatureDistributionSnapshot {
        FeatureDistributionSnapshot {
            model_version: version.into(),
            feature: feature.into(),
            values,
            captured_at: Utc::now(),
        }
    }

    fn detector(features: &[&str]) -> DriftDetector {
        let config = DriftConfig {
            features: features.iter().map(|f| f.to_string()).collect(),
            ..DriftConfig::default()
        };
        DriftDetector::new(&config, &DegradationConfig::default())
    }

    fn feed(detector: &mut DriftDetector, feature: &str, values: &[f64]) {
        for value in values {
            detector.observe(&FeatureVector::from([(feature.to_string(), *value)]));
        }
    }

    #[test]
    fn below_min_window_is_insufficient_even_when_shifted() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut detector = detector(&[]);
        detector.install_baselines(vec![snapshot("v1", "x", sample(&mut rng, 500, 0.0))]);
        feed(&mut detector, "x", &sample(&mut rng, 29, 10.0));

        let summary = detector.evaluate("c1", Utc::now());
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].decision, DriftDecision::InsufficientData);
        assert!(summary.reports[0].p_value.is_none());
        assert!(!summary.overall_drift);
    }

    #[test]
    fn one_report_per_tracked_feature() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut detector = detector(&["a", "b", "missing"]);
        detector.install_baselines(vec![
            snapshot("v1", "a", sample(&mut rng, 200, 0.0)),
            snapshot("v1", "b", sample(&mut rng, 200, 0.0)),
            snapshot("v1", "untracked", sample(&mut rng, 200, 0.0)),
        ]);
        feed(&mut detector, "a", &sample(&mut rng, 100, 0.0));
        feed(&mut detector, "untracked", &sample(&mut rng, 100, 0.0));

        let summary = detector.evaluate("c1", Utc::now());
        let features: Vec<&str> = summary.reports.iter().map(|r| r.feature.as_str()).collect();
        assert_eq!(features, vec!["a", "b", "missing"]);
        assert_eq!(summary.insufficient, 2);
        assert_eq!(
            summary.reports[2].detail.as_deref(),
            Some("no baseline snapshot for feature")
        );
    }

    #[test]
    fn shifted_mean_is_detected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut detector = detector(&[]);
        detector.install_baselines(vec![snapshot("v1", "x", sample(&mut rng, 500, 0.0))]);
        feed(&mut detector, "x", &sample(&mut rng, 100, 5.0));

        let summary = detector.evaluate("c1", Utc::now());
        let report = &summary.reports[0];
        assert_eq!(report.decision, DriftDecision::Drifted);
        assert!(report.statistic.unwrap() > 0.9);
        assert!(summary.overall_drift);
        assert_eq!(summary.drifted, vec!["x".to_string()]);
    }

    #[test]
    fn identical_distributions_rarely_drift() {
        let mut rng = StdRng::seed_from_u64(4);
        let trials = 200;
        let mut false_alarms = 0;
        for _ in 0..trials {
            let mut detector = detector(&[]);
            detector.install_baselines(vec![snapshot("v1", "x", sample(&mut rng, 300, 0.0))]);
            feed(&mut detector, "x", &sample(&mut rng, 200, 0.0));
            if detector.evaluate("c", Utc::now()).overall_drift {
                false_alarms += 1;
            }
        }
        assert!(false_alarms < 25, "{false_alarms} false alarms in {trials} trials");
    }

    #[test]
    fn constant_samples_are_insufficient() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut detector = detector(&[]);
        detector.install_baselines(vec![snapshot("v1", "x", sample(&mut rng, 100, 0.0))]);
        feed(&mut detector, "x", &[2.0; 50]);

        let report = &detector.evaluate("c", Utc::now()).reports[0];
        assert_eq!(report.decision, DriftDecision::InsufficientData);
        assert!(report.detail.as_deref().unwrap().contains("constant"));
    }

    #[test]
    fn majority_rule_needs_more_than_half() {
        let grid = |n: usize, offset: f64| -> Vec<f64> {
            (0..n).map(|i| i as f64 / n as f64 + offset).collect()
        };
        let config = DriftConfig {
            drift_fraction: 0.5,
            ..DriftConfig::default()
        };
        let mut detector = DriftDetector::new(&config, &DegradationConfig::default());
        detector.install_baselines(vec![
            snapshot("v1", "a", grid(300, 0.0)),
            snapshot("v1", "b", grid(300, 0.0)),
        ]);
        feed(&mut detector, "a", &grid(100, 6.0));
        feed(&mut detector, "b", &grid(100, 0.001));

        let summary = detector.evaluate("c", Utc::now());
        assert_eq!(summary.drifted, vec!["a".to_string()]);
        assert!(!summary.overall_drift);
    }

    #[test]
    fn check_batch_leaves_live_windows_alone() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut detector = detector(&[]);
        detector.install_baselines(vec![snapshot("v1", "x", sample(&mut rng, 300, 0.0))]);

        let batch: Vec<FeatureVector> = sample(&mut rng, 60, 4.0)
            .into_iter()
            .map(|v| FeatureVector::from([("x".to_string(), v)]))
            .collect();
        let summary = detector.check_batch("adhoc", Utc::now(), &batch);
        assert!(summary.overall_drift);
        assert!(detector.status().window_sizes.is_empty());
    }

    #[test]
    fn newer_baseline_resets_windows() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut detector = detector(&[]);
        assert!(detector.install_baselines(vec![snapshot("v1", "x", sample(&mut rng, 100, 0.0))]));
        feed(&mut detector, "x", &sample(&mut rng, 40, 0.0));
        detector.record_performance(&[5.0]);

        assert!(!detector.install_baselines(vec![snapshot("v1", "x", vec![1.0, 2.0])]));
        assert_eq!(detector.status().window_sizes["x"], 40);

        assert!(detector.install_baselines(vec![snapshot("v2", "x", sample(&mut rng, 100, 0.0))]));
        assert_eq!(detector.model_version(), Some("v2"));
        assert!(detector.status().window_sizes.is_empty());
        assert_eq!(detector.degradation().window_len, 0);
    }

    #[test]
    fn degradation_fires_at_k_consecutive_cycles() {
        let config = DegradationConfig {
            threshold: 1.0,
            window: 1,
            consecutive: 3,
            ..DegradationConfig::default()
        };
        let mut tracker = PerformanceTracker::new(&config);

        assert!(!tracker.record_cycle(&[2.0]).degraded);
        assert!(!tracker.record_cycle(&[2.0, 3.0]).degraded);
        let status = tracker.record_cycle(&[2.5]);
        assert!(status.degraded);
        assert_eq!(status.consecutive, 3);
    }

    #[test]
    fn favorable_cycle_resets_and_empty_cycle_is_ignored() {
        let config = DegradationConfig {
            threshold: 1.0,
            window: 1,
            consecutive: 2,
            ..DegradationConfig::default()
        };
        let mut tracker = PerformanceTracker::new(&config);

        tracker.record_cycle(&[3.0]);
        let unchanged = tracker.record_cycle(&[]);
        assert_eq!(unchanged.consecutive, 1);
        assert_eq!(unchanged.window_len, 1);

        assert_eq!(tracker.record_cycle(&[0.5]).consecutive, 0);
        tracker.record_cycle(&[3.0]);
        assert!(tracker.record_cycle(&[3.0]).degraded);
    }

    #[test]
    fn lower_is_worse_direction() {
        let config = DegradationConfig {
            metric: "r2".into(),
            threshold: 0.6,
            direction: DegradationDirection::LowerIsWorse,
            window: 2,
            consecutive: 1,
        };
        let mut tracker = PerformanceTracker::new(&config);
        assert!(!tracker.record_cycle(&[0.8]).degraded);
        // window mean (0.8 + 0.3) / 2 = 0.55 < 0.6
        assert!(tracker.record_cycle(&[0.3]).degraded);
    }
}
