//! Diesel schema for the Postgres backend. The history tables share one shape:
//! indexed filter columns next to the full record as JSONB.

diesel::table! {
    probes (id) {
        id -> Int8,
        ts -> Timestamptz,
        endpoint -> Nullable<Text>,
        model_version -> Nullable<Text>,
        feature -> Nullable<Text>,
        body -> Jsonb,
    }
}

diesel::table! {
    endpoint_metrics (id) {
        id -> Int8,
        ts -> Timestamptz,
        endpoint -> Nullable<Text>,
        model_version -> Nullable<Text>,
        feature -> Nullable<Text>,
        body -> Jsonb,
    }
}

diesel::table! {
    model_metrics (id) {
        id -> Int8,
        ts -> Timestamptz,
        endpoint -> Nullable<Text>,
        model_version -> Nullable<Text>,
        feature -> Nullable<Text>,
        body -> Jsonb,
    }
}

diesel::table! {
    drift_reports (id) {
        id -> Int8,
        ts -> Timestamptz,
        endpoint -> Nullable<Text>,
        model_version -> Nullable<Text>,
        feature -> Nullable<Text>,
        body -> Jsonb,
    }
}

diesel::table! {
    cycles (id) {
        id -> Int8,
        ts -> Timestamptz,
        endpoint -> Nullable<Text>,
        model_version -> Nullable<Text>,
        feature -> Nullable<Text>,
        body -> Jsonb,
    }
}

diesel::table! {
    triggers (id) {
        id -> Text,
        seq -> Int8,
        reason -> Text,
        payload -> Jsonb,
        created_at -> Timestamptz,
        consumed -> Bool,
        consumed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    use diesel::pg::sql_types::Array;
    use diesel::sql_types::*;

    baselines (id) {
        id -> Int8,
        model_version -> Text,
        feature -> Text,
        sample_values -> Array<Float8>,
        captured_at -> Timestamptz,
        published_at -> Timestamptz,
    }
}

/// DDL applied at connect time; every statement is idempotent.
pub(crate) fn bootstrap_sql() -> String {
    let mut sql = String::new();
    for table in ["probes", "endpoint_metrics", "model_metrics", "drift_reports", "cycles"] {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                ts TIMESTAMPTZ NOT NULL,
                endpoint TEXT,
                model_version TEXT,
                feature TEXT,
                body JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_ts_id_idx ON {table} (ts DESC, id DESC);\n"
        ));
    }
    sql.push_str(
        "CREATE TABLE IF NOT EXISTS triggers (
            id TEXT PRIMARY KEY,
            seq BIGSERIAL NOT NULL,
            reason TEXT NOT NULL,
            payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            consumed BOOLEAN NOT NULL DEFAULT FALSE,
            consumed_at TIMESTAMPTZ
        );
        CREATE UNIQUE INDEX IF NOT EXISTS triggers_one_pending_per_reason
            ON triggers (reason) WHERE NOT consumed;
        CREATE TABLE IF NOT EXISTS baselines (
            id BIGSERIAL PRIMARY KEY,
            model_version TEXT NOT NULL,
            feature TEXT NOT NULL,
            sample_values DOUBLE PRECISION[] NOT NULL,
            captured_at TIMESTAMPTZ NOT NULL,
            published_at TIMESTAMPTZ NOT NULL,
            UNIQUE (model_version, feature)
        );\n",
    );
    sql
}
