//! The monitoring loop: gather under a wall-clock budget, evaluate on staged
//! state, then commit records, drift reports and triggers in one step.

use crate::{
    config::MonitorConfig,
    drift::{DegradationStatus, DetectorStatus, DriftDetector, DriftSummary},
    error::Result,
    models::{
        CycleRecord, CycleStatus, FeatureDistributionSnapshot, FeatureVector, ModelMetricRecord,
        Record,
    },
    probe::{ProbeAgent, ProbeBatch, ServiceHealth, ServingClient},
    stats::RegressionMetrics,
    store::{BufferedWriter, MetricsStore},
    trigger::{TriggerAction, TriggerManager},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Proxy metric computed from canary probes.
pub const CANARY_METRIC: &str = "canary_abs_residual";

const INGEST_QUEUE: usize = 256;
const PURGE_EVERY: Duration = Duration::from_secs(3600);

/// Input pushed to the loop from outside, drained at the start of each commit.
#[derive(Debug, Clone)]
pub enum Ingest {
    Observations(Vec<FeatureVector>),
    Quality(RegressionMetrics),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStatus {
    pub last_cycle: Option<CycleRecord>,
    pub service_health: Option<ServiceHealth>,
    pub serving_model_version: Option<String>,
    pub detector: Option<DetectorStatus>,
    pub last_drift: Option<DriftSummary>,
    pub cycles_completed: u64,
    pub cycles_suspended: u64,
    pub cycles_missed: u64,
    pub cycles_failed: u64,
    pub buffered_records: usize,
    pub dropped_records: u64,
}

/// Cloneable handle the API uses to reach a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    ingest: mpsc::Sender<Ingest>,
    status: Arc<RwLock<MonitorStatus>>,
}

impl MonitorHandle {
    /// Queues input for the next cycle. Returns false when the loop has stopped.
    pub async fn submit(&self, item: Ingest) -> bool {
        self.ingest.send(item).await.is_ok()
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.read().clone()
    }
}

struct Gathered {
    batch: ProbeBatch,
    baselines: Option<Vec<FeatureDistributionSnapshot>>,
}

pub struct Monitor {
    config: Arc<MonitorConfig>,
    store: Arc<dyn MetricsStore>,
    writer: BufferedWriter,
    agent: ProbeAgent,
    detector: DriftDetector,
    triggers: TriggerManager,
    ingest: mpsc::Receiver<Ingest>,
    /// Ingest drained by a cycle that failed to commit, replayed by the next one.
    carried: Vec<Ingest>,
    status: Arc<RwLock<MonitorStatus>>,
    last_purge: Option<Instant>,
}

impl Monitor {
    pub fn new(
        config: Arc<MonitorConfig>,
        store: Arc<dyn MetricsStore>,
        client: Arc<dyn ServingClient>,
    ) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::channel(INGEST_QUEUE);
        let status = Arc::new(RwLock::new(MonitorStatus::default()));
        let detector = DriftDetector::new(&config.drift, &config.degradation);
        status.write().detector = Some(detector.status());

        let monitor = Self {
            writer: BufferedWriter::new(Arc::clone(&store), config.store.write_buffer_capacity),
            agent: ProbeAgent::new(client, &config.probe),
            triggers: TriggerManager::new(Arc::clone(&store), config.triggers.clone()),
            detector,
            store,
            ingest: rx,
            carried: Vec::new(),
            status: Arc::clone(&status),
            last_purge: None,
            config,
        };
        let handle = MonitorHandle { ingest: tx, status };
        (monitor, handle)
    }

    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    /// Runs cycles on the configured interval until `shutdown` flips to true or its sender drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval = ?self.config.schedule.interval,
            budget = ?self.config.schedule.cycle_budget,
            "monitor loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                    self.maybe_purge().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(err) = self.writer.flush().await {
            warn!(error = %err, pending = self.writer.pending(), "unflushed records at shutdown");
        }
        info!("monitor loop stopped");
    }

    /// Runs one full cycle and returns its audit record. Never fails: errors become a `failed` cycle.
    pub async fn run_once(&mut self) -> CycleRecord {
        let cycle_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        if let Err(err) = self.writer.flush().await {
            warn!(error = %err, pending = self.writer.pending(), "store still unavailable");
        }

        let budget = self.config.schedule.cycle_budget;
        let gathered = timeout(budget, self.gather()).await;
        let outcome = match gathered {
            Ok(gathered) => self.commit(&cycle_id, gathered).await,
            Err(_) => {
                warn!(%cycle_id, ?budget, "cycle exceeded its budget; abandoned");
                Ok((
                    CycleStatus::Missed,
                    Some(format!("gather phase exceeded {}s budget", budget.as_secs_f64())),
                ))
            }
        };
        let (status, detail) = outcome.unwrap_or_else(|err| {
            error!(%cycle_id, error = %err, "monitoring cycle failed");
            (CycleStatus::Failed, Some(err.to_string()))
        });

        let record = CycleRecord {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            status,
            detail,
        };
        if let Err(err) = self.writer.write(Record::Cycle(record.clone())).await {
            error!(cycle_id = %record.cycle_id, error = %err, "failed to record cycle");
        }

        let mut shared = self.status.write();
        match status {
            CycleStatus::Completed => shared.cycles_completed += 1,
            CycleStatus::Suspended => shared.cycles_suspended += 1,
            CycleStatus::Missed => shared.cycles_missed += 1,
            CycleStatus::Failed => shared.cycles_failed += 1,
        }
        shared.last_cycle = Some(record.clone());
        shared.buffered_records = self.writer.pending();
        shared.dropped_records = self.writer.dropped();
        record
    }

    /// Network and store reads only; nothing observable changes until `commit`.
    async fn gather(&self) -> Gathered {
        let (batch, baselines) = tokio::join!(self.agent.collect(), self.store.latest_baselines());
        let baselines = match baselines {
            Ok(snapshots) if !snapshots.is_empty() => Some(snapshots),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "could not refresh baselines; keeping the active set");
                None
            }
        };
        Gathered { batch, baselines }
    }

    async fn commit(
        &mut self,
        cycle_id: &str,
        gathered: Gathered,
    ) -> Result<(CycleStatus, Option<String>)> {
        let now = Utc::now();
        let mut staged = self.detector.clone();
        if let Some(snapshots) = gathered.baselines {
            staged.install_baselines(snapshots);
        }

        let mut inbox = std::mem::take(&mut self.carried);
        while let Ok(item) = self.ingest.try_recv() {
            inbox.push(item);
        }
        let mut quality = Vec::new();
        let mut observed = 0usize;
        for item in &inbox {
            match item {
                Ingest::Observations(batch) => {
                    observed += batch.len();
                    staged.observe_all(batch);
                }
                Ingest::Quality(metrics) => quality.push(metrics.clone()),
            }
        }

        let mut agent = self.agent.clone();
        let probe = agent.absorb(gathered.batch);
        observed += probe.observed_inputs.len();
        staged.observe_all(&probe.observed_inputs);

        let observations = self.performance_observations(&probe.residuals, &quality);
        let degradation = staged.record_performance(&observations);

        let mut records = probe.records();
        if let Some(metric) = canary_quality(&probe.residuals, probe.model_version.clone(), now) {
            records.push(Record::ModelMetric(metric));
        }

        let (status, summary, detail) = match probe.health {
            ServiceHealth::Unhealthy {
                consecutive_failures,
            } => (
                CycleStatus::Suspended,
                None,
                Some(format!(
                    "serving unhealthy for {consecutive_failures} consecutive cycles; drift evaluation suspended"
                )),
            ),
            ServiceHealth::Healthy => {
                let summary = staged.evaluate(cycle_id, now);
                records.extend(summary.reports.iter().cloned().map(Record::DriftReport));
                (CycleStatus::Completed, Some(summary), None)
            }
        };

        let buffered = match self.writer.write_all(records).await {
            Ok(buffered) => buffered,
            Err(err) => {
                self.carry(inbox);
                return Err(err);
            }
        };
        self.agent = agent;
        self.detector = staged;

        let mut outcomes = self
            .triggers
            .evaluate(summary.as_ref(), &degradation, now)
            .await?;
        if let Some(outcome) = self
            .triggers
            .check_model_age(self.detector.model_version(), self.detector.trained_at(), now)
            .await?
        {
            outcomes.push(outcome);
        }
        let created = outcomes
            .iter()
            .filter(|o| o.action == TriggerAction::Created)
            .count();

        log_cycle(cycle_id, status, observed, buffered, summary.as_ref(), &degradation, created);

        let mut shared = self.status.write();
        shared.service_health = Some(probe.health);
        if probe.model_version.is_some() {
            shared.serving_model_version = probe.model_version;
        }
        shared.detector = Some(self.detector.status());
        if summary.is_some() {
            shared.last_drift = summary;
        }
        Ok((status, detail))
    }

    fn carry(&mut self, mut inbox: Vec<Ingest>) {
        if inbox.len() > INGEST_QUEUE {
            let excess = inbox.len() - INGEST_QUEUE;
            inbox.drain(..excess);
            warn!(dropped = excess, "ingest backlog full; dropping oldest items");
        }
        self.carried = inbox;
    }

    fn performance_observations(&self, residuals: &[f64], quality: &[RegressionMetrics]) -> Vec<f64> {
        let metric = self.detector.performance().metric();
        if metric == CANARY_METRIC {
            residuals.to_vec()
        } else {
            quality.iter().filter_map(|m| m.metric(metric)).collect()
        }
    }

    async fn maybe_purge(&mut self) {
        if self
            .last_purge
            .is_some_and(|last| last.elapsed() < PURGE_EVERY)
        {
            return;
        }
        self.last_purge = Some(Instant::now());

        let retention = chrono::Duration::from_std(self.config.store.retention)
            .unwrap_or(chrono::Duration::days(30));
        let cutoff = Utc::now() - retention;
        match self.store.purge(cutoff).await {
            Ok(0) => debug!(%cutoff, "retention purge found nothing to delete"),
            Ok(deleted) => info!(deleted, %cutoff, "retention purge finished"),
            Err(err) => warn!(error = %err, "retention purge failed"),
        }
    }
}

/// Quality of this cycle's canary predictions, when any carried an expected value.
fn canary_quality(
    residuals: &[f64],
    model_version: Option<String>,
    now: DateTime<Utc>,
) -> Option<ModelMetricRecord> {
    if residuals.is_empty() {
        return None;
    }
    let n = residuals.len() as f64;
    Some(ModelMetricRecord {
        recorded_at: now,
        model_version,
        source: "probe_canary".to_string(),
        rmse: (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt(),
        mae: residuals.iter().sum::<f64>() / n,
        r2: None,
        sample_count: residuals.len() as i64,
        parameters: None,
    })
}

fn log_cycle(
    cycle_id: &str,
    status: CycleStatus,
    observed: usize,
    buffered: usize,
    summary: Option<&DriftSummary>,
    degradation: &DegradationStatus,
    triggers_created: usize,
) {
    info!(
        cycle_id,
        status = status.as_str(),
        observed,
        buffered,
        drifted = summary.map_or(0, |s| s.drifted.len()),
        overall_drift = summary.is_some_and(|s| s.overall_drift),
        degraded = degradation.degraded,
        triggers_created,
        "monitoring cycle committed"
    );
}
