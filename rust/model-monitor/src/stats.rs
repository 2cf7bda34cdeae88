//! Two-sample Kolmogorov–Smirnov test, nearest-rank percentiles and regression quality metrics.

use crate::error::{MonitorError, Result};
use serde::Serialize;

const KS_EPS1: f64 = 0.001;
const KS_EPS2: f64 = 1.0e-8;
const KS_MAX_TERMS: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsOutcome {
    pub statistic: f64,
    pub p_value: f64,
}

/// Runs the two-sample KS test over the finite values of both samples.
///
/// Returns `None` when either side has no finite values.
pub fn ks_two_sample(baseline: &[f64], live: &[f64]) -> Option<KsOutcome> {
    let a = sorted_finite(baseline);
    let b = sorted_finite(live);
    if a.is_empty() || b.is_empty() {
        return None;
    }

    let statistic = ks_statistic(&a, &b);
    let (n, m) = (a.len() as f64, b.len() as f64);
    let effective = (n * m / (n + m)).sqrt();
    let lambda = (effective + 0.12 + 0.11 / effective) * statistic;

    Some(KsOutcome {
        statistic,
        p_value: kolmogorov_q(lambda),
    })
}

/// Supremum distance between the empirical CDFs of two sorted samples.
fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    let (n, m) = (a.len(), b.len());
    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;

    while i < n && j < m {
        let x = a[i].min(b[j]);
        // step both CDFs past every copy of x before comparing
        while i < n && a[i] <= x {
            i += 1;
        }
        while j < m && b[j] <= x {
            j += 1;
        }
        let gap = (i as f64 / n as f64 - j as f64 / m as f64).abs();
        d = d.max(gap);
    }
    d
}

/// Survival function of the Kolmogorov distribution.
fn kolmogorov_q(lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return 1.0;
    }
    let a2 = -2.0 * lambda * lambda;
    let mut fac = 2.0;
    let mut sum = 0.0;
    let mut previous = 0.0;

    for j in 1..=KS_MAX_TERMS {
        let j = j as f64;
        let term = fac * (a2 * j * j).exp();
        sum += term;
        if term.abs() <= KS_EPS1 * previous || term.abs() <= KS_EPS2 * sum {
            return sum.clamp(0.0, 1.0);
        }
        fac = -fac;
        previous = term.abs();
    }
    // the series only fails to converge for tiny lambda, where p -> 1
    1.0
}

fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// True when the finite values have zero spread (or there are none).
pub fn is_degenerate(values: &[f64]) -> bool {
    let mut finite = values.iter().copied().filter(|v| v.is_finite());
    match finite.next() {
        None => true,
        Some(first) => finite.all(|v| v == first),
    }
}

/// Nearest-rank percentile of an ascending slice; `pct` in `[0, 100]`.
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((pct / 100.0) * n as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegressionMetrics {
    pub rmse: f64,
    pub mae: f64,
    /// Undefined when the actuals have zero variance.
    pub r2: Option<f64>,
    pub sample_count: usize,
}

impl RegressionMetrics {
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "rmse" => Some(self.rmse),
            "mae" => Some(self.mae),
            "r2" => self.r2,
            _ => None,
        }
    }
}

/// RMSE, MAE and R² of paired predictions and ground-truth values.
pub fn regression_metrics(predictions: &[f64], actuals: &[f64]) -> Result<RegressionMetrics> {
    if predictions.len() != actuals.len() {
        return Err(MonitorError::InvalidRequest(format!(
            "predictions ({}) and actuals ({}) differ in length",
            predictions.len(),
            actuals.len()
        )));
    }
    if predictions.is_empty() {
        return Err(MonitorError::InvalidRequest(
            "at least one prediction is required".into(),
        ));
    }
    if predictions
        .iter()
        .chain(actuals.iter())
        .any(|v| !v.is_finite())
    {
        return Err(MonitorError::InvalidRequest(
            "predictions and actuals must be finite".into(),
        ));
    }

    let n = predictions.len() as f64;
    let (mut squared, mut absolute) = (0.0, 0.0);
    for (p, a) in predictions.iter().zip(actuals) {
        let residual = p - a;
        squared += residual * residual;
        absolute += residual.abs();
    }

    let actual_mean = actuals.iter().sum::<f64>() / n;
    let total: f64 = actuals.iter().map(|a| (a - actual_mean).powi(2)).sum();
    let r2 = (total > 0.0).then(|| 1.0 - squared / total);

    Ok(RegressionMetrics {
        rmse: (squared / n).sqrt(),
        mae: absolute / n,
        r2,
        sample_count: predictions.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_samples_have_zero_distance() {
        let sample: Vec<f64> = (0..50).map(f64::from).collect();
        let outcome = ks_two_sample(&sample, &sample).unwrap();
        assert_eq!(outcome.statistic, 0.0);
        assert_eq!(outcome.p_value, 1.0);
    }

    #[test]
    fn disjoint_samples_are_maximally_distant() {
        let low: Vec<f64> = (0..40).map(f64::from).collect();
        let high: Vec<f64> = (100..140).map(f64::from).collect();
        let outcome = ks_two_sample(&low, &high).unwrap();
        assert_eq!(outcome.statistic, 1.0);
        assert!(outcome.p_value < 1e-6, "p = {}", outcome.p_value);
    }

    #[test]
    fn ties_advance_both_cdfs() {
        let a = [1.0, 2.0, 2.0, 3.0];
        let b = [2.0, 2.0, 2.0, 2.0];
        // after x=1: F_a=0.25, F_b=0; after x=2: F_a=0.75, F_b=1
        let d = ks_statistic(&a, &b);
        assert!((d - 0.25).abs() < 1e-12);
    }

    #[test]
    fn statistic_matches_hand_computed_value() {
        let a = [0.1, 0.2, 0.3, 0.4, 0.5];
        let b = [0.35, 0.45, 0.55, 0.65, 0.75];
        let outcome = ks_two_sample(&a, &b).unwrap();
        assert!((outcome.statistic - 0.6).abs() < 1e-12);
        assert!(outcome.p_value > 0.05 && outcome.p_value < 0.5);
    }

    #[test]
    fn non_finite_only_input_yields_none() {
        assert!(ks_two_sample(&[f64::NAN, f64::INFINITY], &[1.0]).is_none());
        assert!(ks_two_sample(&[], &[1.0]).is_none());
    }

    #[test]
    fn kolmogorov_tail_is_monotone() {
        assert_eq!(kolmogorov_q(0.0), 1.0);
        let mid = kolmogorov_q(1.0);
        assert!((mid - 0.26999967).abs() < 1e-6, "q(1.0) = {mid}");
        assert!(kolmogorov_q(2.0) < mid);
        assert!(kolmogorov_q(0.5) > mid);
    }

    #[test]
    fn degenerate_detection() {
        assert!(is_degenerate(&[3.0, 3.0, 3.0]));
        assert!(is_degenerate(&[f64::NAN]));
        assert!(!is_degenerate(&[3.0, 3.5]));
    }

    #[test]
    fn nearest_rank_percentiles() {
        let sorted: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(5.0));
        assert_eq!(percentile(&sorted, 90.0), Some(9.0));
        assert_eq!(percentile(&sorted, 99.0), Some(10.0));
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn regression_metrics_for_known_residuals() {
        let metrics = regression_metrics(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 3.0, 6.0]).unwrap();
        assert_eq!(metrics.rmse, 1.0);
        assert_eq!(metrics.mae, 0.5);
        // actual mean 3.0 -> ss_tot = 4 + 1 + 0 + 9
        assert!((metrics.r2.unwrap() - (1.0 - 4.0 / 14.0)).abs() < 1e-12);
        assert_eq!(metrics.metric("mae"), Some(0.5));

        let flat = regression_metrics(&[1.0, 1.0], &[2.0, 2.0]).unwrap();
        assert_eq!(flat.r2, None);

        assert!(regression_metrics(&[1.0], &[1.0, 2.0]).is_err());
        assert!(regression_metrics(&[], &[]).is_err());
    }
}
