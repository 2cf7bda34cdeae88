//! JSON-lines store: one append-only file per table under a data directory.

use super::{MetricsStore, RecordFilter, StoreStats, TriggerFilter, TriggerInsert};
use crate::{
    error::{MonitorError, Result},
    models::{FeatureDistributionSnapshot, Record, RecordKind, RetrainingTrigger, StoredRecord},
    pagination::{Cursor, Page, PageRequest},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, warn};

const TRIGGERS: &str = "triggers";
const BASELINES: &str = "baselines";

#[derive(Serialize, Deserialize)]
struct Line<T> {
    id: i64,
    record: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BaselineSet {
    model_version: String,
    published_at: DateTime<Utc>,
    snapshots: Vec<FeatureDistributionSnapshot>,
}

/// One table file. The mutex serialises appends, rewrites and reads of that file.
struct Table {
    path: PathBuf,
    next_id: i64,
}

pub struct FileStore {
    dir: PathBuf,
    records: HashMap<RecordKind, Mutex<Table>>,
    triggers: Mutex<Table>,
    baselines: Mutex<Table>,
}

impl FileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| MonitorError::StoreWrite(format!("create {}: {err}", dir.display())))?;

        let mut records = HashMap::new();
        for kind in RecordKind::ALL {
            let table = Table::load::<Record>(&dir, kind.table()).await?;
            records.insert(kind, Mutex::new(table));
        }
        let triggers = Mutex::new(Table::load::<RetrainingTrigger>(&dir, TRIGGERS).await?);
        let baselines = Mutex::new(Table::load::<BaselineSet>(&dir, BASELINES).await?);

        debug!(dir = %dir.display(), "opened file store");
        Ok(Self {
            dir,
            records,
            triggers,
            baselines,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table(&self, kind: RecordKind) -> Result<&Mutex<Table>> {
        self.records
            .get(&kind)
            .ok_or_else(|| MonitorError::StoreRead(format!("no table for {}", kind.table())))
    }
}

impl Table {
    async fn load<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{name}.jsonl"));
        let mut table = Self { path, next_id: 1 };
        let lines = table.read_all::<T>().await?;
        table.next_id = lines.iter().map(|line| line.id).max().unwrap_or(0) + 1;
        Ok(table)
    }

    async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<Line<T>>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(MonitorError::StoreRead(format!(
                    "read {}: {err}",
                    self.path.display()
                )))
            }
        };

        let mut lines = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Line<T>>(line) {
                Ok(parsed) => lines.push(parsed),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping unreadable store line"
                ),
            }
        }
        Ok(lines)
    }

    async fn append<T: Serialize>(&mut self, record: &T) -> Result<i64> {
        let id = self.next_id;
        let mut encoded = serde_json::to_vec(&Line { id, record })
            .map_err(|err| MonitorError::StoreWrite(err.to_string()))?;
        encoded.push(b'\n');

        let write = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(&encoded).await?;
            file.sync_data().await
        };
        write.await.map_err(|err| {
            MonitorError::StoreWrite(format!("append {}: {err}", self.path.display()))
        })?;

        self.next_id += 1;
        Ok(id)
    }

    /// Atomically replaces the file contents with `lines`.
    async fn rewrite<T: Serialize>(&self, lines: &[Line<T>]) -> Result<()> {
        let mut encoded = Vec::new();
        for line in lines {
            serde_json::to_writer(&mut encoded, line)
                .map_err(|err| MonitorError::StoreWrite(err.to_string()))?;
            encoded.push(b'\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|err| {
            MonitorError::StoreWrite(format!("rewrite {}: {err}", self.path.display()))
        })
    }
}

fn newest_first<T>(rows: &mut [(Cursor, T)]) {
    rows.sort_by(|(a, _), (b, _)| (b.ts, b.id).cmp(&(a.ts, a.id)));
}

fn page_of<T>(mut rows: Vec<(Cursor, T)>, page: &PageRequest) -> Page<T> {
    if let Some(after) = &page.after {
        rows.retain(|(key, _)| after.precedes(key.ts, key.id));
    }
    newest_first(&mut rows);
    rows.truncate(page.limit.max(1) as usize + 1);
    let page = Page::from_rows(rows, page.limit, |(key, _)| *key);
    Page {
        results: page.results.into_iter().map(|(_, row)| row).collect(),
        next_cursor: page.next_cursor,
    }
}

#[async_trait]
impl MetricsStore for FileStore {
    async fn append(&self, record: &Record) -> Result<i64> {
        let mut table = self.table(record.kind())?.lock().await;
        table.append(record).await
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page<StoredRecord>> {
        let lines = {
            let table = self.table(kind)?.lock().await;
            table.read_all::<Record>().await?
        };

        let rows = lines
            .into_iter()
            .filter(|line| filter.matches(&line.record))
            .map(|line| {
                let key = Cursor {
                    ts: line.record.timestamp(),
                    id: line.id,
                };
                (
                    key,
                    StoredRecord {
                        id: line.id,
                        record: line.record,
                    },
                )
            })
            .collect();
        Ok(page_of(rows, page))
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        for kind in RecordKind::ALL {
            let table = self.table(kind)?.lock().await;
            let lines = table.read_all::<Record>().await?;
            let before = lines.len();
            let kept: Vec<Line<Record>> = lines
                .into_iter()
                .filter(|line| line.record.timestamp() >= older_than)
                .collect();
            let dropped = before - kept.len();
            if dropped > 0 {
                table.rewrite(&kept).await?;
                removed += dropped as u64;
            }
        }
        debug!(removed, cutoff = %older_than, "purged file store");
        Ok(removed)
    }

    async fn insert_trigger(&self, trigger: RetrainingTrigger) -> Result<TriggerInsert> {
        let mut table = self.triggers.lock().await;
        let existing = table.read_all::<RetrainingTrigger>().await?;

        if let Some(line) = existing.iter().find(|line| line.record.id == trigger.id) {
            return Ok(TriggerInsert::AlreadyExists(line.record.clone()));
        }
        if let Some(line) = existing
            .iter()
            .find(|line| line.record.reason == trigger.reason && !line.record.consumed)
        {
            return Ok(TriggerInsert::UnconsumedPending(line.record.clone()));
        }

        table.append(&trigger).await?;
        Ok(TriggerInsert::Created(trigger))
    }

    async fn consume_trigger(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RetrainingTrigger>> {
        let table = self.triggers.lock().await;
        let mut lines = table.read_all::<RetrainingTrigger>().await?;

        let Some(line) = lines.iter_mut().find(|line| line.record.id == id) else {
            return Ok(None);
        };
        if line.record.consumed {
            return Ok(Some(line.record.clone()));
        }
        line.record.consumed = true;
        line.record.consumed_at = Some(at);
        let updated = line.record.clone();

        table.rewrite(&lines).await?;
        Ok(Some(updated))
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<RetrainingTrigger>> {
        let table = self.triggers.lock().await;
        let lines = table.read_all::<RetrainingTrigger>().await?;
        Ok(lines
            .into_iter()
            .find(|line| line.record.id == id)
            .map(|line| line.record))
    }

    async fn list_triggers(
        &self,
        filter: &TriggerFilter,
        page: &PageRequest,
    ) -> Result<Page<RetrainingTrigger>> {
        let lines = {
            let table = self.triggers.lock().await;
            table.read_all::<RetrainingTrigger>().await?
        };
        let rows = lines
            .into_iter()
            .filter(|line| filter.matches(&line.record))
            .map(|line| {
                let key = Cursor {
                    ts: line.record.created_at,
                    id: line.id,
                };
                (key, line.record)
            })
            .collect();
        Ok(page_of(rows, page))
    }

    async fn put_baselines(
        &self,
        model_version: &str,
        snapshots: Vec<FeatureDistributionSnapshot>,
    ) -> Result<()> {
        let mut table = self.baselines.lock().await;
        let existing = table.read_all::<BaselineSet>().await?;
        if existing
            .iter()
            .any(|line| line.record.model_version == model_version)
        {
            return Err(MonitorError::InvalidRequest(format!(
                "baseline for model version '{model_version}' already published"
            )));
        }

        let set = BaselineSet {
            model_version: model_version.to_string(),
            published_at: Utc::now(),
            snapshots,
        };
        table.append(&set).await?;
        Ok(())
    }

    async fn latest_baselines(&self) -> Result<Vec<FeatureDistributionSnapshot>> {
        let table = self.baselines.lock().await;
        let sets = table.read_all::<BaselineSet>().await?;
        Ok(sets
            .into_iter()
            .max_by_key(|line| line.id)
            .map(|line| line.record.snapshots)
            .unwrap_or_default())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut tables = BTreeMap::new();
        let mut probe_success_rate = None;
        let mut mean_probe_latency_ms = None;

        for kind in RecordKind::ALL {
            let lines = {
                let table = self.table(kind)?.lock().await;
                table.read_all::<Record>().await?
            };
            tables.insert(kind.table().to_string(), lines.len() as i64);

            if kind == RecordKind::Probe && !lines.is_empty() {
                let (mut ok, mut latency) = (0usize, 0.0);
                for line in &lines {
                    if let Record::Probe(probe) = &line.record {
                        ok += usize::from(probe.success);
                        latency += probe.latency_ms;
                    }
                }
                probe_success_rate = Some(ok as f64 / lines.len() as f64);
                mean_probe_latency_ms = Some(latency / lines.len() as f64);
            }
        }

        let triggers = {
            let table = self.triggers.lock().await;
            table.read_all::<RetrainingTrigger>().await?
        };
        tables.insert(TRIGGERS.to_string(), triggers.len() as i64);
        let unconsumed_triggers = triggers.iter().filter(|line| !line.record.consumed).count() as i64;

        let baselines = {
            let table = self.baselines.lock().await;
            table.read_all::<BaselineSet>().await?
        };
        tables.insert(BASELINES.to_string(), baselines.len() as i64);
        let baseline_model_version = baselines
            .into_iter()
            .max_by_key(|line| line.id)
            .map(|line| line.record.model_version);

        Ok(StoreStats {
            tables,
            probe_success_rate,
            mean_probe_latency_ms,
            unconsumed_triggers,
            baseline_model_version,
        })
    }
}
