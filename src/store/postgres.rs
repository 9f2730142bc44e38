//! Postgres-backed `Store`.
//!
//! Deliberately uses runtime-checked `sqlx::query` rather than the
//! `query!`/`query_as!` macros: those need `DATABASE_URL` (or an offline
//! `sqlx-data.json`) at *build* time, which this workspace has no business
//! requiring. Row mapping is spelled out by hand instead, the same tradeoff
//! the reference server makes by mapping SQLAlchemy rows to Pydantic models
//! explicitly rather than trusting ORM magic.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::str::FromStr;

use super::model::{
    DpWindow, EventKind, EventPayload, LdpReport, Plan, RawReport, SiteEpsilonLog, SitePlan,
    UploadToken,
};
use super::{ReportBatch, Store, StoreError};

/// Thin wrapper around a connection pool. `Clone` is cheap (`PgPool` is an
/// `Arc` internally).
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the schema if it doesn't exist. Intentionally not a real
    /// migration tool (out of scope) — good enough for a fresh dev database.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS site_plans (
    site_id TEXT PRIMARY KEY,
    plan TEXT NOT NULL,
    stripe_customer_id TEXT,
    stripe_subscription_id TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS upload_tokens (
    id BIGSERIAL PRIMARY KEY,
    site_id TEXT NOT NULL,
    jti TEXT NOT NULL UNIQUE,
    token_hash TEXT NOT NULL,
    allowed_origin TEXT NOT NULL,
    sampling_rate DOUBLE PRECISION NOT NULL,
    epsilon_budget DOUBLE PRECISION,
    epsilon_consumed DOUBLE PRECISION NOT NULL DEFAULT 0,
    issued_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    revoked_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS token_nonces (
    jti TEXT PRIMARY KEY,
    site_id TEXT NOT NULL,
    seen_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_reports (
    id BIGSERIAL PRIMARY KEY,
    site_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload JSONB NOT NULL,
    epsilon_used DOUBLE PRECISION NOT NULL,
    sampling_rate DOUBLE PRECISION NOT NULL,
    event_time TIMESTAMPTZ NOT NULL,
    server_received_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS ldp_reports (
    id BIGSERIAL PRIMARY KEY,
    site_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload JSONB NOT NULL,
    epsilon_used DOUBLE PRECISION NOT NULL,
    sampling_rate DOUBLE PRECISION NOT NULL,
    event_time TIMESTAMPTZ NOT NULL,
    server_received_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS dp_windows (
    id BIGSERIAL PRIMARY KEY,
    site_id TEXT NOT NULL,
    plan TEXT NOT NULL,
    metric TEXT NOT NULL,
    window_start TIMESTAMPTZ NOT NULL,
    window_end TIMESTAMPTZ NOT NULL,
    value DOUBLE PRECISION NOT NULL,
    variance DOUBLE PRECISION NOT NULL,
    ci80_low DOUBLE PRECISION NOT NULL,
    ci80_high DOUBLE PRECISION NOT NULL,
    ci95_low DOUBLE PRECISION NOT NULL,
    ci95_high DOUBLE PRECISION NOT NULL,
    report_count BIGINT NOT NULL,
    published_at TIMESTAMPTZ NOT NULL,
    UNIQUE (site_id, metric, window_start)
);

CREATE TABLE IF NOT EXISTS site_epsilon_log (
    site_id TEXT NOT NULL,
    day DATE NOT NULL,
    plan TEXT NOT NULL,
    epsilon_total DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (site_id, day, plan)
);
"#;

fn row_to_token(row: &sqlx::postgres::PgRow) -> Result<UploadToken, StoreError> {
    Ok(UploadToken {
        id: row.try_get("id").map_err(backend)?,
        site_id: row.try_get("site_id").map_err(backend)?,
        jti: row.try_get("jti").map_err(backend)?,
        token_hash: row.try_get("token_hash").map_err(backend)?,
        allowed_origin: row.try_get("allowed_origin").map_err(backend)?,
        sampling_rate: row.try_get("sampling_rate").map_err(backend)?,
        epsilon_budget: row.try_get("epsilon_budget").map_err(backend)?,
        epsilon_consumed: row.try_get("epsilon_consumed").map_err(backend)?,
        issued_at: row.try_get("issued_at").map_err(backend)?,
        expires_at: row.try_get("expires_at").map_err(backend)?,
        revoked_at: row.try_get("revoked_at").map_err(backend)?,
    })
}

fn row_to_raw_report(row: &sqlx::postgres::PgRow) -> Result<RawReport, StoreError> {
    let kind: String = row.try_get("kind").map_err(backend)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(backend)?;
    Ok(RawReport {
        id: row.try_get("id").map_err(backend)?,
        site_id: row.try_get("site_id").map_err(backend)?,
        kind: EventKind::from_str(&kind)?,
        payload: serde_json::from_value(payload).unwrap_or_default(),
        epsilon_used: row.try_get("epsilon_used").map_err(backend)?,
        sampling_rate: row.try_get("sampling_rate").map_err(backend)?,
        event_time: row.try_get("event_time").map_err(backend)?,
        server_received_at: row.try_get("server_received_at").map_err(backend)?,
    })
}

fn row_to_ldp_report(row: &sqlx::postgres::PgRow) -> Result<LdpReport, StoreError> {
    let kind: String = row.try_get("kind").map_err(backend)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(backend)?;
    Ok(LdpReport {
        id: row.try_get("id").map_err(backend)?,
        site_id: row.try_get("site_id").map_err(backend)?,
        kind: EventKind::from_str(&kind)?,
        payload: serde_json::from_value(payload).unwrap_or_default(),
        epsilon_used: row.try_get("epsilon_used").map_err(backend)?,
        sampling_rate: row.try_get("sampling_rate").map_err(backend)?,
        event_time: row.try_get("event_time").map_err(backend)?,
        server_received_at: row.try_get("server_received_at").map_err(backend)?,
    })
}

fn row_to_dp_window(row: &sqlx::postgres::PgRow) -> Result<DpWindow, StoreError> {
    let plan: String = row.try_get("plan").map_err(backend)?;
    let metric: String = row.try_get("metric").map_err(backend)?;
    Ok(DpWindow {
        id: row.try_get("id").map_err(backend)?,
        site_id: row.try_get("site_id").map_err(backend)?,
        plan: Plan::from_str(&plan)?,
        metric,
        window_start: row.try_get("window_start").map_err(backend)?,
        window_end: row.try_get("window_end").map_err(backend)?,
        value: row.try_get("value").map_err(backend)?,
        variance: row.try_get("variance").map_err(backend)?,
        ci80_low: row.try_get("ci80_low").map_err(backend)?,
        ci80_high: row.try_get("ci80_high").map_err(backend)?,
        ci95_low: row.try_get("ci95_low").map_err(backend)?,
        ci95_high: row.try_get("ci95_high").map_err(backend)?,
        report_count: row.try_get("report_count").map_err(backend)?,
        published_at: row.try_get("published_at").map_err(backend)?,
    })
}

fn row_to_site_plan(row: &sqlx::postgres::PgRow) -> Result<SitePlan, StoreError> {
    let plan: String = row.try_get("plan").map_err(backend)?;
    Ok(SitePlan {
        site_id: row.try_get("site_id").map_err(backend)?,
        plan: Plan::from_str(&plan)?,
        stripe_customer_id: row.try_get("stripe_customer_id").map_err(backend)?,
        stripe_subscription_id: row.try_get("stripe_subscription_id").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl From<()> for StoreError {
    fn from(_: ()) -> Self {
        StoreError::Backend("unrecognized enum value in a row".to_string())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_placeholder_token(
        &self,
        site_id: &str,
        jti: &str,
        allowed_origin: &str,
        sampling_rate: f64,
        epsilon_budget: Option<f64>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO upload_tokens
                (site_id, jti, token_hash, allowed_origin, sampling_rate, epsilon_budget,
                 epsilon_consumed, issued_at, expires_at)
             VALUES ($1, $2, '', $3, $4, $5, 0, $6, $7)
             RETURNING id",
        )
        .bind(site_id)
        .bind(jti)
        .bind(allowed_origin)
        .bind(sampling_rate)
        .bind(epsilon_budget)
        .bind(issued_at)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        row.try_get("id").map_err(backend)
    }

    async fn set_token_hash(&self, id: i64, token_hash: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_tokens SET token_hash = $1 WHERE id = $2")
            .bind(token_hash)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn find_token_by_jti(&self, jti: &str) -> Result<Option<UploadToken>, StoreError> {
        let row = sqlx::query("SELECT * FROM upload_tokens WHERE jti = $1")
            .bind(jti)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn list_active_tokens(&self) -> Result<Vec<UploadToken>, StoreError> {
        let rows = sqlx::query("SELECT * FROM upload_tokens WHERE revoked_at IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(row_to_token).collect()
    }

    async fn revoke_token(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_tokens SET revoked_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn revoke_tokens_for_site(
        &self,
        site_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE upload_tokens SET revoked_at = $1 WHERE site_id = $2 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(site_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn record_token_epsilon_consumed(
        &self,
        jti: &str,
        delta: f64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_tokens SET epsilon_consumed = epsilon_consumed + $1 WHERE jti = $2")
            .bind(delta)
            .bind(jti)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn insert_nonce_if_absent(
        &self,
        jti: &str,
        site_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO token_nonces (jti, site_id, seen_at) VALUES ($1, $2, $3)
             ON CONFLICT (jti) DO NOTHING",
        )
        .bind(jti)
        .bind(site_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_nonces_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM token_nonces WHERE seen_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn insert_raw_report(&self, report: RawReport) -> Result<i64, StoreError> {
        let payload = serde_json::to_value(&report.payload).map_err(|e| StoreError::Backend(e.to_string()))?;
        let row = sqlx::query(
            "INSERT INTO raw_reports
                (site_id, kind, payload, epsilon_used, sampling_rate, event_time, server_received_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(&report.site_id)
        .bind(report.kind.to_string())
        .bind(payload)
        .bind(report.epsilon_used)
        .bind(report.sampling_rate)
        .bind(report.event_time)
        .bind(report.server_received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        row.try_get("id").map_err(backend)
    }

    async fn insert_ldp_report(&self, report: LdpReport) -> Result<i64, StoreError> {
        let payload = serde_json::to_value(&report.payload).map_err(|e| StoreError::Backend(e.to_string()))?;
        let row = sqlx::query(
            "INSERT INTO ldp_reports
                (site_id, kind, payload, epsilon_used, sampling_rate, event_time, server_received_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(&report.site_id)
        .bind(report.kind.to_string())
        .bind(payload)
        .bind(report.epsilon_used)
        .bind(report.sampling_rate)
        .bind(report.event_time)
        .bind(report.server_received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        row.try_get("id").map_err(backend)
    }

    async fn fetch_reports_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReportBatch, StoreError> {
        let raw_rows = sqlx::query("SELECT * FROM raw_reports WHERE event_time >= $1 AND event_time < $2")
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let ldp_rows = sqlx::query("SELECT * FROM ldp_reports WHERE event_time >= $1 AND event_time < $2")
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(ReportBatch {
            raw: raw_rows.iter().map(row_to_raw_report).collect::<Result<_, _>>()?,
            ldp: ldp_rows.iter().map(row_to_ldp_report).collect::<Result<_, _>>()?,
        })
    }

    async fn get_site_plan(&self, site_id: &str) -> Result<Option<SitePlan>, StoreError> {
        let row = sqlx::query("SELECT * FROM site_plans WHERE site_id = $1")
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_site_plan).transpose()
    }

    async fn upsert_site_plan(&self, plan: SitePlan) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO site_plans
                (site_id, plan, stripe_customer_id, stripe_subscription_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (site_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&plan.site_id)
        .bind(plan.plan.to_string())
        .bind(&plan.stripe_customer_id)
        .bind(&plan.stripe_subscription_id)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn upsert_dp_window(&self, window: DpWindow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dp_windows
                (site_id, plan, metric, window_start, window_end, value, variance,
                 ci80_low, ci80_high, ci95_low, ci95_high, report_count, published_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (site_id, metric, window_start) DO UPDATE SET
                plan = EXCLUDED.plan,
                window_end = EXCLUDED.window_end,
                value = EXCLUDED.value,
                variance = EXCLUDED.variance,
                ci80_low = EXCLUDED.ci80_low,
                ci80_high = EXCLUDED.ci80_high,
                ci95_low = EXCLUDED.ci95_low,
                ci95_high = EXCLUDED.ci95_high,
                report_count = EXCLUDED.report_count,
                published_at = EXCLUDED.published_at",
        )
        .bind(&window.site_id)
        .bind(window.plan.to_string())
        .bind(&window.metric)
        .bind(window.window_start)
        .bind(window.window_end)
        .bind(window.value)
        .bind(window.variance)
        .bind(window.ci80_low)
        .bind(window.ci80_high)
        .bind(window.ci95_low)
        .bind(window.ci95_high)
        .bind(window.report_count)
        .bind(window.published_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn fetch_dp_windows(
        &self,
        site_id: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DpWindow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM dp_windows
             WHERE site_id = $1 AND metric = $2 AND window_start >= $3 AND window_start < $4
             ORDER BY window_start",
        )
        .bind(site_id)
        .bind(metric)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_dp_window).collect()
    }

    async fn upsert_site_epsilon_log(&self, log: SiteEpsilonLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO site_epsilon_log (site_id, day, plan, epsilon_total)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (site_id, day, plan) DO UPDATE SET epsilon_total = EXCLUDED.epsilon_total",
        )
        .bind(&log.site_id)
        .bind(log.day)
        .bind(log.plan.to_string())
        .bind(log.epsilon_total)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_site_epsilon_total(
        &self,
        site_id: &str,
        day: NaiveDate,
        plan: Plan,
    ) -> Result<f64, StoreError> {
        let row = sqlx::query(
            "SELECT epsilon_total FROM site_epsilon_log WHERE site_id = $1 AND day = $2 AND plan = $3",
        )
        .bind(site_id)
        .bind(day)
        .bind(plan.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => row.try_get("epsilon_total").map_err(backend),
            None => Ok(0.0),
        }
    }
}
