use crate::error::{MonitorError, Result};
use crate::models::FeatureVector;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::{
    collections::HashSet,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

/// Full monitor configuration: a TOML file overlaid by `MONITOR_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interval_secs", default = "default_interval")]
    pub interval: Duration,
    /// Wall-clock budget for the probe/collect phase of one cycle.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "cycle_budget_secs", default = "default_cycle_budget")]
    pub cycle_budget: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_secs", default = "default_probe_timeout")]
    pub timeout: Duration,
    /// Consecutive all-endpoint health failures tolerated before the service counts as unhealthy.
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub samples: Vec<ProbeSample>,
}

impl ProbeConfig {
    /// Longest a gather pass can take: calls to one endpoint run back to back, each up to `timeout`.
    pub fn worst_case_gather(&self) -> Duration {
        if self.endpoints.is_empty() {
            return Duration::ZERO;
        }
        let tap = self.endpoints.iter().any(|e| e.inputs_path.is_some());
        let calls = 1 + self.samples.len() + usize::from(tap);
        self.timeout.saturating_mul(calls as u32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_predict_path")]
    pub predict_path: String,
    /// Path of the serving side's recent-input tap; no tap when unset.
    #[serde(default)]
    pub inputs_path: Option<String>,
}

/// Representative predict input; `expected` turns the call into a canary with a residual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSample {
    #[serde(default)]
    pub name: Option<String>,
    pub features: FeatureVector,
    #[serde(default)]
    pub expected: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Significance level for the two-sample test.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Live window size below which a feature reports insufficient data.
    #[serde(default = "default_min_window")]
    pub min_window: usize,
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Overall drift when drifted features exceed this fraction of tracked features.
    /// `0.0` means any single feature; `0.5` means a strict majority.
    #[serde(default)]
    pub drift_fraction: f64,
    /// Tracked features; every feature of the active baseline when empty.
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationDirection {
    HigherIsWorse,
    LowerIsWorse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    /// Proxy metric fed to the performance window (`canary_abs_residual`, `rmse`, `mae`, `r2`).
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_degradation_threshold")]
    pub threshold: f64,
    #[serde(default = "default_direction")]
    pub direction: DegradationDirection,
    #[serde(default = "default_performance_window")]
    pub window: usize,
    /// Consecutive unfavorable cycles required before degradation is declared.
    #[serde(default = "default_consecutive")]
    pub consecutive: u32,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_true")]
    pub automatic_retraining: bool,
    /// Coarse bucket that collapses repeated firings into one trigger id.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "bucket_secs", default = "default_bucket")]
    pub bucket: Duration,
    /// Directory where `<id>.trigger` artifacts are published for file-watching schedulers.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    /// Retrain once the active model is older than this; unset disables the check.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(rename = "max_model_age_secs", default)]
    pub max_model_age: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    File,
    Postgres,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub max_pool_size: u32,
    #[serde(default)]
    pub pg_ssl_root_cert: Option<String>,
    #[serde(default)]
    pub pg_ssl_cert: Option<String>,
    #[serde(default)]
    pub pg_ssl_key: Option<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_secs", default = "default_store_timeout")]
    pub timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "retention_secs", default = "default_retention")]
    pub retention: Duration,
    #[serde(default = "default_write_buffer")]
    pub write_buffer_capacity: usize,
}

/// `MONITOR_*` environment overrides.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(default)]
    listen_addr: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    interval_secs: Option<u64>,
    #[serde(default)]
    serving_url: Option<String>,
    #[serde(default)]
    artifact_dir: Option<PathBuf>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8490".to_string()
}

const fn default_limit() -> i64 {
    100
}

const fn default_max_limit() -> i64 {
    500
}

const fn default_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_cycle_budget() -> Duration {
    Duration::from_secs(30)
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_unhealthy_after() -> u32 {
    3
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_predict_path() -> String {
    "/predict".to_string()
}

const fn default_alpha() -> f64 {
    0.05
}

const fn default_min_window() -> usize {
    30
}

const fn default_window_capacity() -> usize {
    500
}

fn default_metric() -> String {
    "canary_abs_residual".to_string()
}

const fn default_degradation_threshold() -> f64 {
    1.0
}

const fn default_direction() -> DegradationDirection {
    DegradationDirection::HigherIsWorse
}

const fn default_performance_window() -> usize {
    10
}

const fn default_consecutive() -> u32 {
    3
}

const fn default_true() -> bool {
    true
}

const fn default_bucket() -> Duration {
    Duration::from_secs(3600)
}

const fn default_backend() -> StoreBackend {
    StoreBackend::File
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/monitor")
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_retention() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

const fn default_write_buffer() -> usize {
    1024
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            cycle_budget: default_cycle_budget(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            unhealthy_after: default_unhealthy_after(),
            endpoints: Vec::new(),
            samples: Vec::new(),
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            min_window: default_min_window(),
            window_capacity: default_window_capacity(),
            drift_fraction: 0.0,
            features: Vec::new(),
        }
    }
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            threshold: default_degradation_threshold(),
            direction: default_direction(),
            window: default_performance_window(),
            consecutive: default_consecutive(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            automatic_retraining: true,
            bucket: default_bucket(),
            artifact_dir: None,
            max_model_age: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            database_url: None,
            max_pool_size: default_pool_size(),
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            timeout: default_store_timeout(),
            retention: default_retention(),
            write_buffer_capacity: default_write_buffer(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_key: None,
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            schedule: ScheduleConfig::default(),
            probe: ProbeConfig::default(),
            drift: DriftConfig::default(),
            degradation: DegradationConfig::default(),
            triggers: TriggerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Loads the TOML file (defaults when no path is given), applies env overrides, validates.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_toml_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };

        let overrides: EnvOverrides = envy::prefixed("MONITOR_")
            .from_env()
            .context("failed to parse MONITOR_* environment variables")?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| MonitorError::Config(err.to_string()))
    }

    fn apply_overrides(&mut self, overrides: EnvOverrides) {
        if let Some(addr) = overrides.listen_addr {
            self.listen_addr = addr;
        }
        if overrides.api_key.is_some() {
            self.api_key = overrides.api_key;
        }
        if let Some(url) = overrides.database_url {
            self.store.backend = StoreBackend::Postgres;
            self.store.database_url = Some(url);
        }
        if let Some(dir) = overrides.data_dir {
            self.store.data_dir = dir;
        }
        if let Some(secs) = overrides.interval_secs {
            self.schedule.interval = Duration::from_secs(secs);
        }
        if let Some(url) = overrides.serving_url {
            if self.probe.endpoints.is_empty() {
                self.probe.endpoints.push(EndpointConfig {
                    name: "default".to_string(),
                    base_url: url,
                    health_path: default_health_path(),
                    predict_path: default_predict_path(),
                    inputs_path: None,
                });
            }
        }
        if overrides.artifact_dir.is_some() {
            self.triggers.artifact_dir = overrides.artifact_dir;
        }
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .to_socket_addrs()
            .map_err(|err| MonitorError::Config(format!("invalid listen_addr: {err}")))?
            .next()
            .ok_or_else(|| MonitorError::Config("listen_addr resolved to no addresses".into()))
    }

    /// Clamps a requested page size into `[1, max_limit]`.
    pub fn page_limit(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(MonitorError::Config(msg));

        if !(self.drift.alpha > 0.0 && self.drift.alpha < 1.0) {
            return fail(format!("drift.alpha must be in (0, 1), got {}", self.drift.alpha));
        }
        if self.drift.min_window < 2 {
            return fail("drift.min_window must be at least 2".into());
        }
        if self.drift.window_capacity < self.drift.min_window {
            return fail(format!(
                "drift.window_capacity ({}) must be >= drift.min_window ({})",
                self.drift.window_capacity, self.drift.min_window
            ));
        }
        if !(0.0..1.0).contains(&self.drift.drift_fraction) {
            return fail("drift.drift_fraction must be in [0, 1)".into());
        }
        if !self.degradation.threshold.is_finite() {
            return fail("degradation.threshold must be finite".into());
        }
        if self.degradation.window == 0 {
            return fail("degradation.window must be at least 1".into());
        }
        if self.degradation.consecutive == 0 {
            return fail("degradation.consecutive must be at least 1".into());
        }
        if self.schedule.interval.is_zero() {
            return fail("schedule.interval_secs must be positive".into());
        }
        if self.schedule.cycle_budget.is_zero() || self.schedule.cycle_budget > self.schedule.interval
        {
            return fail("schedule.cycle_budget_secs must be positive and no longer than the interval".into());
        }
        if self.probe.timeout.is_zero() {
            return fail("probe.timeout_secs must be positive".into());
        }
        if self.probe.unhealthy_after == 0 {
            return fail("probe.unhealthy_after must be at least 1".into());
        }
        let worst_case = self.probe.worst_case_gather();
        if worst_case > self.schedule.cycle_budget {
            return fail(format!(
                "schedule.cycle_budget_secs ({}s) is shorter than the worst-case probe time ({}s); every slow cycle would be missed",
                self.schedule.cycle_budget.as_secs(),
                worst_case.as_secs()
            ));
        }

        let mut names = HashSet::new();
        for endpoint in &self.probe.endpoints {
            if endpoint.name.trim().is_empty() {
                return fail("probe endpoint names must not be empty".into());
            }
            if !names.insert(endpoint.name.as_str()) {
                return fail(format!("duplicate probe endpoint '{}'", endpoint.name));
            }
            if !(endpoint.base_url.starts_with("http://")
                || endpoint.base_url.starts_with("https://"))
            {
                return fail(format!(
                    "endpoint '{}' base_url must start with http:// or https://",
                    endpoint.name
                ));
            }
        }
        for sample in &self.probe.samples {
            if sample.features.is_empty() {
                return fail("probe samples must carry at least one feature".into());
            }
        }

        if self.triggers.bucket.is_zero() {
            return fail("triggers.bucket_secs must be positive".into());
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return fail("store.database_url is required for the postgres backend".into());
        }
        if self.store.write_buffer_capacity == 0 {
            return fail("store.write_buffer_capacity must be at least 1".into());
        }
        if self.store.retention.is_zero() {
            return fail("store.retention_secs must be positive".into());
        }
        if self.default_limit < 1 || self.max_limit < self.default_limit {
            return fail("max_limit must be >= default_limit >= 1".into());
        }
        self.listen_socket_addr()?;
        Ok(())
    }
}
