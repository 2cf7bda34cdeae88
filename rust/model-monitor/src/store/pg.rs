//! Postgres backend over diesel-async and the bb8 pool.

use super::{
    db::PgPool,
    schema::{self, baselines, triggers},
    MetricsStore, RecordFilter, StoreStats, TriggerFilter, TriggerInsert,
};
use crate::{
    error::{MonitorError, Result},
    models::{FeatureDistributionSnapshot, Record, RecordKind, RetrainingTrigger, StoredRecord, TriggerReason},
    pagination::{Cursor, Page, PageRequest},
};
use async_trait::async_trait;
use bb8::PooledConnection;
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Nullable, Float8};
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, error};

use super::db::PgConnectionManager;

type Conn<'a> = PooledConnection<'a, PgConnectionManager>;

/// Runs `$body` with `$t` bound to the schema module of the table holding `$kind` records.
macro_rules! with_record_table {
    ($kind:expr, |$t:ident| $body:block) => {
        match $kind {
            RecordKind::Probe => {
                use schema::probes as $t;
                $body
            }
            RecordKind::EndpointMetric => {
                use schema::endpoint_metrics as $t;
                $body
            }
            RecordKind::ModelMetric => {
                use schema::model_metrics as $t;
                $body
            }
            RecordKind::DriftReport => {
                use schema::drift_reports as $t;
                $body
            }
            RecordKind::Cycle => {
                use schema::cycles as $t;
                $body
            }
        }
    };
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = triggers)]
#[diesel(check_for_backend(Pg))]
struct TriggerRow {
    id: String,
    seq: i64,
    reason: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    consumed: bool,
    consumed_at: Option<DateTime<Utc>>,
}

impl TriggerRow {
    fn into_trigger(self) -> Result<RetrainingTrigger> {
        let reason = self
            .reason
            .parse::<TriggerReason>()
            .map_err(MonitorError::StoreRead)?;
        Ok(RetrainingTrigger {
            id: self.id,
            reason,
            payload: self.payload,
            created_at: self.created_at,
            consumed: self.consumed,
            consumed_at: self.consumed_at,
        })
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = baselines)]
#[diesel(check_for_backend(Pg))]
struct BaselineRow {
    model_version: String,
    feature: String,
    sample_values: Vec<f64>,
    captured_at: DateTime<Utc>,
}

#[derive(QueryableByName)]
struct ProbeSummary {
    #[diesel(sql_type = BigInt)]
    total: i64,
    #[diesel(sql_type = BigInt)]
    succeeded: i64,
    #[diesel(sql_type = Nullable<Float8>)]
    mean_latency_ms: Option<f64>,
}

const PROBE_SUMMARY_SQL: &str = "SELECT COUNT(*)::BIGINT AS total, \
     COALESCE(SUM(CASE WHEN (body->>'success')::BOOLEAN THEN 1 ELSE 0 END), 0)::BIGINT AS succeeded, \
     AVG((body->>'latency_ms')::DOUBLE PRECISION) AS mean_latency_ms \
     FROM probes";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

fn read_err(err: DieselError) -> MonitorError {
    MonitorError::StoreRead(err.to_string())
}

fn write_err(err: DieselError) -> MonitorError {
    MonitorError::StoreWrite(err.to_string())
}

impl PgStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Creates the monitor tables and indexes if they are missing.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut conn = self.conn(MonitorError::StoreWrite).await?;
        conn.batch_execute(&schema::bootstrap_sql())
            .await
            .map_err(write_err)?;
        debug!("monitor schema ready");
        Ok(())
    }

    async fn conn(&self, wrap: fn(String) -> MonitorError) -> Result<Conn<'_>> {
        match tokio::time::timeout(self.timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => {
                error!(error = ?err, "failed to acquire database connection");
                Err(wrap(format!("{err:?}")))
            }
            Err(_) => Err(wrap(format!(
                "timed out after {:?} waiting for a database connection",
                self.timeout
            ))),
        }
    }

    async fn find_trigger(
        &self,
        conn: &mut AsyncPgConnection,
        id: &str,
    ) -> Result<Option<RetrainingTrigger>> {
        triggers::table
            .filter(triggers::id.eq(id))
            .select(TriggerRow::as_select())
            .first::<TriggerRow>(conn)
            .await
            .optional()
            .map_err(read_err)?
            .map(TriggerRow::into_trigger)
            .transpose()
    }
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn append(&self, record: &Record) -> Result<i64> {
        let body =
            serde_json::to_value(record).map_err(|err| MonitorError::StoreWrite(err.to_string()))?;
        let ts = record.timestamp();
        let endpoint = record.endpoint().map(str::to_string);
        let model_version = record.model_version().map(str::to_string);
        let feature = record.feature().map(str::to_string);

        let mut conn = self.conn(MonitorError::StoreWrite).await?;
        let id = with_record_table!(record.kind(), |t| {
            diesel::insert_into(t::table)
                .values((
                    t::ts.eq(ts),
                    t::endpoint.eq(endpoint),
                    t::model_version.eq(model_version),
                    t::feature.eq(feature),
                    t::body.eq(body),
                ))
                .returning(t::id)
                .get_result::<i64>(&mut *conn)
                .await
        })
        .map_err(write_err)?;
        Ok(id)
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page<StoredRecord>> {
        let mut conn = self.conn(MonitorError::StoreRead).await?;
        let rows: Vec<(i64, DateTime<Utc>, serde_json::Value)> = with_record_table!(kind, |t| {
            let mut query = t::table.select((t::id, t::ts, t::body)).into_boxed::<Pg>();
            if let Some(endpoint) = &filter.endpoint {
                query = query.filter(t::endpoint.eq(endpoint.clone()));
            }
            if let Some(version) = &filter.model_version {
                query = query.filter(t::model_version.eq(version.clone()));
            }
            if let Some(feature) = &filter.feature {
                query = query.filter(t::feature.eq(feature.clone()));
            }
            if let Some(range) = &filter.time_range {
                query = query.filter(t::ts.ge(range.start).and(t::ts.le(range.end)));
            }
            if let Some(after) = &page.after {
                query = query.filter(
                    t::ts
                        .lt(after.ts)
                        .or(t::ts.eq(after.ts).and(t::id.lt(after.id))),
                );
            }
            query
                .order((t::ts.desc(), t::id.desc()))
                .limit(page.limit.max(1) + 1)
                .load::<(i64, DateTime<Utc>, serde_json::Value)>(&mut *conn)
                .await
        })
        .map_err(read_err)?;

        let mut decoded = Vec::with_capacity(rows.len());
        for (id, ts, body) in rows {
            let record: Record = serde_json::from_value(body)
                .map_err(|err| MonitorError::StoreRead(format!("row {id}: {err}")))?;
            decoded.push((Cursor { ts, id }, StoredRecord { id, record }));
        }
        let page = Page::from_rows(decoded, page.limit, |(key, _)| *key);
        Ok(Page {
            results: page.results.into_iter().map(|(_, row)| row).collect(),
            next_cursor: page.next_cursor,
        })
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn(MonitorError::StoreWrite).await?;
        let mut removed = 0u64;
        for kind in RecordKind::ALL {
            let deleted = with_record_table!(kind, |t| {
                diesel::delete(t::table.filter(t::ts.lt(older_than)))
                    .execute(&mut *conn)
                    .await
            })
            .map_err(write_err)?;
            removed += deleted as u64;
        }
        debug!(removed, cutoff = %older_than, "purged postgres store");
        Ok(removed)
    }

    async fn insert_trigger(&self, trigger: RetrainingTrigger) -> Result<TriggerInsert> {
        let mut conn = self.conn(MonitorError::StoreWrite).await?;

        let inserted = diesel::insert_into(triggers::table)
            .values((
                triggers::id.eq(&trigger.id),
                triggers::reason.eq(trigger.reason.as_str()),
                triggers::payload.eq(trigger.payload.clone()),
                triggers::created_at.eq(trigger.created_at),
                triggers::consumed.eq(trigger.consumed),
                triggers::consumed_at.eq(trigger.consumed_at),
            ))
            .on_conflict_do_nothing()
            .execute(&mut *conn)
            .await
            .map_err(write_err)?;
        if inserted == 1 {
            return Ok(TriggerInsert::Created(trigger));
        }

        if let Some(existing) = self.find_trigger(&mut conn, &trigger.id).await? {
            return Ok(TriggerInsert::AlreadyExists(existing));
        }
        let pending = triggers::table
            .filter(triggers::reason.eq(trigger.reason.as_str()))
            .filter(triggers::consumed.eq(false))
            .select(TriggerRow::as_select())
            .first::<TriggerRow>(&mut *conn)
            .await
            .optional()
            .map_err(read_err)?;
        match pending {
            Some(row) => Ok(TriggerInsert::UnconsumedPending(row.into_trigger()?)),
            None => Err(MonitorError::StoreWrite(format!(
                "trigger {} conflicted with a trigger that is no longer pending",
                trigger.id
            ))),
        }
    }

    async fn consume_trigger(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RetrainingTrigger>> {
        let mut conn = self.conn(MonitorError::StoreWrite).await?;
        diesel::update(
            triggers::table
                .filter(triggers::id.eq(id))
                .filter(triggers::consumed.eq(false)),
        )
        .set((triggers::consumed.eq(true), triggers::consumed_at.eq(Some(at))))
        .execute(&mut *conn)
        .await
        .map_err(write_err)?;

        self.find_trigger(&mut conn, id).await
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<RetrainingTrigger>> {
        let mut conn = self.conn(MonitorError::StoreRead).await?;
        self.find_trigger(&mut conn, id).await
    }

    async fn list_triggers(
        &self,
        filter: &TriggerFilter,
        page: &PageRequest,
    ) -> Result<Page<RetrainingTrigger>> {
        let mut conn = self.conn(MonitorError::StoreRead).await?;
        let mut query = triggers::table
            .select(TriggerRow::as_select())
            .into_boxed::<Pg>();
        if let Some(reason) = filter.reason {
            query = query.filter(triggers::reason.eq(reason.as_str()));
        }
        if let Some(consumed) = filter.consumed {
            query = query.filter(triggers::consumed.eq(consumed));
        }
        if let Some(range) = &filter.time_range {
            query = query.filter(
                triggers::created_at
                    .ge(range.start)
                    .and(triggers::created_at.le(range.end)),
            );
        }
        if let Some(after) = &page.after {
            query = query.filter(
                triggers::created_at.lt(after.ts).or(triggers::created_at
                    .eq(after.ts)
                    .and(triggers::seq.lt(after.id))),
            );
        }

        let rows: Vec<TriggerRow> = query
            .order((triggers::created_at.desc(), triggers::seq.desc()))
            .limit(page.limit.max(1) + 1)
            .load(&mut *conn)
            .await
            .map_err(read_err)?;

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = Cursor {
                ts: row.created_at,
                id: row.seq,
            };
            keyed.push((key, row.into_trigger()?));
        }
        let page = Page::from_rows(keyed, page.limit, |(key, _)| *key);
        Ok(Page {
            results: page.results.into_iter().map(|(_, row)| row).collect(),
            next_cursor: page.next_cursor,
        })
    }

    async fn put_baselines(
        &self,
        model_version: &str,
        snapshots: Vec<FeatureDistributionSnapshot>,
    ) -> Result<()> {
        if snapshots.is_empty() {
            return Err(MonitorError::InvalidRequest(
                "a baseline needs at least one feature snapshot".into(),
            ));
        }
        let published_at = Utc::now();
        let rows: Vec<_> = snapshots
            .into_iter()
            .map(|snapshot| {
                (
                    baselines::model_version.eq(model_version.to_string()),
                    baselines::feature.eq(snapshot.feature),
                    baselines::sample_values.eq(snapshot.values),
                    baselines::captured_at.eq(snapshot.captured_at),
                    baselines::published_at.eq(published_at),
                )
            })
            .collect();

        let mut conn = self.conn(MonitorError::StoreWrite).await?;
        match diesel::insert_into(baselines::table)
            .values(rows)
            .execute(&mut *conn)
            .await
        {
            Ok(_) => Ok(()),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(MonitorError::InvalidRequest(format!(
                    "baseline for model version '{model_version}' already published"
                )))
            }
            Err(err) => Err(write_err(err)),
        }
    }

    async fn latest_baselines(&self) -> Result<Vec<FeatureDistributionSnapshot>> {
        let mut conn = self.conn(MonitorError::StoreRead).await?;
        let version: Option<String> = baselines::table
            .select(baselines::model_version)
            .order((baselines::published_at.desc(), baselines::id.desc()))
            .first(&mut *conn)
            .await
            .optional()
            .map_err(read_err)?;
        let Some(version) = version else {
            return Ok(Vec::new());
        };

        let rows: Vec<BaselineRow> = baselines::table
            .filter(baselines::model_version.eq(&version))
            .order(baselines::feature.asc())
            .select(BaselineRow::as_select())
            .load(&mut *conn)
            .await
            .map_err(read_err)?;

        Ok(rows
            .into_iter()
            .map(|row| FeatureDistributionSnapshot {
                model_version: row.model_version,
                feature: row.feature,
                values: row.sample_values,
                captured_at: row.captured_at,
            })
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut conn = self.conn(MonitorError::StoreRead).await?;
        let mut tables = BTreeMap::new();
        for kind in RecordKind::ALL {
            let count = with_record_table!(kind, |t| {
                t::table.count().get_result::<i64>(&mut *conn).await
            })
            .map_err(read_err)?;
            tables.insert(kind.table().to_string(), count);
        }

        let trigger_count = triggers::table
            .count()
            .get_result::<i64>(&mut *conn)
            .await
            .map_err(read_err)?;
        tables.insert("triggers".to_string(), trigger_count);
        let unconsumed_triggers = triggers::table
            .filter(triggers::consumed.eq(false))
            .count()
            .get_result::<i64>(&mut *conn)
            .await
            .map_err(read_err)?;
        let baseline_count = baselines::table
            .count()
            .get_result::<i64>(&mut *conn)
            .await
            .map_err(read_err)?;
        tables.insert("baselines".to_string(), baseline_count);

        let summary = diesel::sql_query(PROBE_SUMMARY_SQL)
            .get_result::<ProbeSummary>(&mut *conn)
            .await
            .map_err(read_err)?;
        let probe_success_rate =
            (summary.total > 0).then(|| summary.succeeded as f64 / summary.total as f64);

        let baseline_model_version = baselines::table
            .select(baselines::model_version)
            .order((baselines::published_at.desc(), baselines::id.desc()))
            .first::<String>(&mut *conn)
            .await
            .optional()
            .map_err(read_err)?;

        Ok(StoreStats {
            tables,
            probe_success_rate,
            mean_probe_latency_ms: summary.mean_latency_ms,
            unconsumed_triggers,
            baseline_model_version,
        })
    }
}
