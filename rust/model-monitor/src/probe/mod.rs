//! Health and canary probing of the serving endpoints.

pub mod client;

pub use client::{HealthStatus, HttpServingClient, Prediction, Reply, ServingClient, TappedInput};

use crate::{
    config::{EndpointConfig, ProbeConfig, ProbeSample},
    error::{MonitorError, Result},
    models::{EndpointMetricRecord, FeatureVector, HealthProbeResult, ProbeKind, Record},
    stats::{mean, percentile},
    store::BufferedWriter,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Unhealthy { consecutive_failures: u32 },
}

/// Raw output of one gather pass. Nothing in it has been committed.
#[derive(Debug, Clone)]
pub struct ProbeBatch {
    pub endpoints: Vec<EndpointBatch>,
}

#[derive(Debug, Clone)]
pub struct EndpointBatch {
    pub endpoint: String,
    pub results: Vec<HealthProbeResult>,
    /// |prediction - expected| of successful canary calls.
    pub residuals: Vec<f64>,
    /// `None` when the endpoint has no tap or the read failed.
    pub inputs: Option<Vec<TappedInput>>,
}

impl EndpointBatch {
    fn health_ok(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.kind == ProbeKind::Health && r.success)
    }
}

/// What one probe cycle produced once absorbed into the agent's state.
#[derive(Debug, Clone)]
pub struct ProbeCycle {
    pub results: Vec<HealthProbeResult>,
    pub endpoint_metrics: Vec<EndpointMetricRecord>,
    pub residuals: Vec<f64>,
    pub observed_inputs: Vec<FeatureVector>,
    pub model_version: Option<String>,
    pub health: ServiceHealth,
}

impl ProbeCycle {
    pub fn records(&self) -> Vec<Record> {
        self.results
            .iter()
            .cloned()
            .map(Record::Probe)
            .chain(self.endpoint_metrics.iter().cloned().map(Record::EndpointMetric))
            .collect()
    }
}

/// Read position in one endpoint's input tap.
#[derive(Debug, Clone, Default)]
struct TapCursor {
    since: Option<DateTime<Utc>>,
    /// Keys returned by the previous read, with multiplicity.
    seen: HashMap<String, usize>,
}

impl TapCursor {
    /// Returns the payloads of requests the previous read did not already report.
    fn admit(&mut self, inputs: Vec<TappedInput>) -> Vec<FeatureVector> {
        let mut previous = std::mem::take(&mut self.seen);
        let mut fresh = Vec::new();
        for input in inputs {
            let key = input.key();
            *self.seen.entry(key.clone()).or_default() += 1;
            if let Some(at) = input.received_at {
                self.since = Some(self.since.map_or(at, |since| since.max(at)));
            }
            match previous.get_mut(&key) {
                Some(count) if *count > 0 => *count -= 1,
                _ => fresh.push(input.features),
            }
        }
        fresh
    }
}

/// Probe state. Cloned by the monitor so a cycle can be staged and discarded.
#[derive(Clone)]
pub struct ProbeAgent {
    client: Arc<dyn ServingClient>,
    endpoints: Vec<EndpointConfig>,
    samples: Vec<ProbeSample>,
    timeout: Duration,
    unhealthy_after: u32,
    consecutive_failures: u32,
    window_ends: HashMap<String, DateTime<Utc>>,
    last_observed: Option<DateTime<Utc>>,
    taps: HashMap<String, TapCursor>,
}

impl ProbeAgent {
    pub fn new(client: Arc<dyn ServingClient>, config: &ProbeConfig) -> Self {
        Self {
            client,
            endpoints: config.endpoints.clone(),
            samples: config.samples.clone(),
            timeout: config.timeout,
            unhealthy_after: config.unhealthy_after,
            consecutive_failures: 0,
            window_ends: HashMap::new(),
            last_observed: None,
            taps: HashMap::new(),
        }
    }

    pub fn health(&self) -> ServiceHealth {
        if self.consecutive_failures > self.unhealthy_after {
            ServiceHealth::Unhealthy {
                consecutive_failures: self.consecutive_failures,
            }
        } else {
            ServiceHealth::Healthy
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Probes every endpoint concurrently. Only performs network calls.
    pub async fn collect(&self) -> ProbeBatch {
        let endpoints = join_all(
            self.endpoints
                .iter()
                .map(|endpoint| self.probe_endpoint(endpoint)),
        )
        .await;
        ProbeBatch { endpoints }
    }

    /// Folds a gathered batch into the failure counter and per-endpoint windows.
    pub fn absorb(&mut self, batch: ProbeBatch) -> ProbeCycle {
        let mut results = Vec::new();
        let mut endpoint_metrics = Vec::new();
        let mut residuals = Vec::new();
        let mut observed_inputs = Vec::new();
        let mut model_version = None;

        if !batch.endpoints.is_empty() {
            if batch.endpoints.iter().any(EndpointBatch::health_ok) {
                if self.consecutive_failures > 0 {
                    info!(after = self.consecutive_failures, "serving endpoint recovered");
                }
                self.consecutive_failures = 0;
            } else {
                self.consecutive_failures += 1;
                warn!(
                    consecutive_failures = self.consecutive_failures,
                    "health check failed on every endpoint"
                );
            }
        }

        for mut endpoint in batch.endpoints {
            for result in &mut endpoint.results {
                if let Some(last) = self.last_observed {
                    result.observed_at = result.observed_at.max(last);
                }
                self.last_observed = Some(result.observed_at);
                if result.kind == ProbeKind::Predict && result.success {
                    if let Some(version) = &result.model_version {
                        model_version = Some(version.clone());
                    }
                }
            }

            if let Some(metric) = self.aggregate(&endpoint) {
                endpoint_metrics.push(metric);
            }
            residuals.extend(endpoint.residuals);
            if let Some(inputs) = endpoint.inputs {
                let fresh = self
                    .taps
                    .entry(endpoint.endpoint.clone())
                    .or_default()
                    .admit(inputs);
                debug!(endpoint = %endpoint.endpoint, fresh = fresh.len(), "input tap read");
                observed_inputs.extend(fresh);
            }
            results.extend(endpoint.results);
        }

        ProbeCycle {
            results,
            endpoint_metrics,
            residuals,
            observed_inputs,
            model_version,
            health: self.health(),
        }
    }

    /// Collects, absorbs and appends one cycle's probe records.
    pub async fn run_cycle(&mut self, writer: &mut BufferedWriter) -> Result<ProbeCycle> {
        let batch = self.collect().await;
        let cycle = self.absorb(batch);
        writer.write_all(cycle.records()).await?;
        Ok(cycle)
    }

    fn aggregate(&mut self, batch: &EndpointBatch) -> Option<EndpointMetricRecord> {
        let first = batch.results.first()?.observed_at;
        let last = batch.results.iter().map(|r| r.observed_at).max()?;

        let window_start = self
            .window_ends
            .get(&batch.endpoint)
            .copied()
            .unwrap_or(first);
        let window_end = last.max(window_start);
        self.window_ends.insert(batch.endpoint.clone(), window_end);

        // latency over calls that got an HTTP response
        let mut latencies: Vec<f64> = batch
            .results
            .iter()
            .filter(|r| r.status_code.is_some())
            .map(|r| r.latency_ms)
            .collect();
        latencies.sort_by(f64::total_cmp);

        Some(EndpointMetricRecord {
            endpoint: batch.endpoint.clone(),
            window_start,
            window_end,
            call_count: batch.results.len() as i64,
            success_count: batch.results.iter().filter(|r| r.success).count() as i64,
            mean_latency_ms: mean(&latencies),
            latency_p50_ms: percentile(&latencies, 50.0),
            latency_p90_ms: percentile(&latencies, 90.0),
            latency_p99_ms: percentile(&latencies, 99.0),
        })
    }

    async fn probe_endpoint(&self, endpoint: &EndpointConfig) -> EndpointBatch {
        let mut results = Vec::with_capacity(1 + self.samples.len());
        let mut residuals = Vec::new();

        let (observed_at, latency_ms, outcome) = self.timed(self.client.health(endpoint)).await;
        let mut result = HealthProbeResult {
            observed_at,
            endpoint: endpoint.name.clone(),
            kind: ProbeKind::Health,
            latency_ms,
            success: false,
            status_code: None,
            detail: None,
            model_version: None,
            prediction: None,
        };
        match outcome {
            Ok(reply) => {
                result.status_code = Some(i32::from(reply.status_code));
                match reply.body {
                    Some(status) => {
                        result.success = status.is_healthy();
                        result.detail = status.message.or(Some(status.status));
                    }
                    None => result.detail = reply.detail,
                }
            }
            Err(err) => result.detail = Some(err.to_string()),
        }
        if !result.success {
            debug!(endpoint = %endpoint.name, detail = ?result.detail, "health probe failed");
        }
        results.push(result);

        for sample in &self.samples {
            let (observed_at, latency_ms, outcome) =
                self.timed(self.client.predict(endpoint, &sample.features)).await;
            let mut result = HealthProbeResult {
                observed_at,
                endpoint: endpoint.name.clone(),
                kind: ProbeKind::Predict,
                latency_ms,
                success: false,
                status_code: None,
                detail: sample.name.clone(),
                model_version: None,
                prediction: None,
            };
            match outcome {
                Ok(reply) => {
                    result.status_code = Some(i32::from(reply.status_code));
                    match reply.body {
                        Some(prediction) if prediction.prediction.is_finite() => {
                            result.success = true;
                            result.prediction = Some(prediction.prediction);
                            result.model_version = prediction.model_version;
                            if let Some(expected) = sample.expected {
                                residuals.push((prediction.prediction - expected).abs());
                            }
                        }
                        Some(_) => result.detail = Some("non-finite prediction".into()),
                        None => result.detail = reply.detail,
                    }
                }
                Err(err) => result.detail = Some(err.to_string()),
            }
            results.push(result);
        }

        let inputs = if endpoint.inputs_path.is_some() {
            let since = self.taps.get(&endpoint.name).and_then(|tap| tap.since);
            let read = self.client.recent_inputs(endpoint, since);
            match tokio::time::timeout(self.timeout, read).await {
                Ok(Ok(inputs)) => Some(inputs),
                Ok(Err(err)) => {
                    warn!(endpoint = %endpoint.name, error = %err, "input tap failed");
                    None
                }
                Err(_) => {
                    warn!(endpoint = %endpoint.name, timeout = ?self.timeout, "input tap timed out");
                    None
                }
            }
        } else {
            None
        };

        EndpointBatch {
            endpoint: endpoint.name.clone(),
            results,
            residuals,
            inputs,
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<Reply<T>>>,
    ) -> (DateTime<Utc>, f64, Result<Reply<T>>) {
        let observed_at = Utc::now();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MonitorError::ProbeTimeout(self.timeout)),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        (observed_at, latency_ms, outcome)
    }
}
