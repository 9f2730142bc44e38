//! Relational store abstraction.
//!
//! The rest of the crate talks to a `dyn`-free `Store: Send + Sync + Clone`
//! trait object, never to `sqlx` directly outside this module — the same
//! seam the reference server draws between its scheduler/routers and
//! SQLAlchemy. Two implementations live here: [`postgres::PgStore`] for
//! production and [`memory::MockStore`] for tests, matching the
//! fake-in-memory-store pattern the example corpus uses for its own
//! audit-log and state traits.

mod memory;
mod model;
mod postgres;

pub use memory::MockStore;
pub use model::{
    DpWindow, EventKind, EventPayload, LdpReport, Plan, RawReport, SiteEpsilonLog, SitePlan,
    TokenNonce, UploadToken,
};
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// Failure modes surfaced by any `Store` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("unique constraint violated")]
    Conflict,
    #[error("backend error: {0}")]
    Backend(String),
}

/// A batch of reports pulled for reduction over a time range, split by
/// ingestion table the way the reducer needs to treat them differently.
#[derive(Clone, Debug, Default)]
pub struct ReportBatch {
    pub raw: Vec<RawReport>,
    pub ldp: Vec<LdpReport>,
}

/// Everything the pipeline needs from the relational store.
///
/// Implementations must make `insert_nonce_if_absent` atomic with respect to
/// the unique `(jti)` constraint — it is the only thing standing between a
/// replayed shuffle request and a double-counted event.
#[async_trait]
pub trait Store: Send + Sync + Clone + 'static {
    async fn insert_placeholder_token(
        &self,
        site_id: &str,
        jti: &str,
        allowed_origin: &str,
        sampling_rate: f64,
        epsilon_budget: Option<f64>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn set_token_hash(&self, id: i64, token_hash: &str) -> Result<(), StoreError>;

    async fn find_token_by_jti(&self, jti: &str) -> Result<Option<UploadToken>, StoreError>;

    /// Legacy fallback for tokens minted before `jti` indexing existed:
    /// every active, non-expired token, for a linear hash-comparison scan.
    async fn list_active_tokens(&self) -> Result<Vec<UploadToken>, StoreError>;

    async fn revoke_token(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn revoke_tokens_for_site(
        &self,
        site_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn record_token_epsilon_consumed(
        &self,
        jti: &str,
        delta: f64,
    ) -> Result<(), StoreError>;

    /// Inserts a nonce row for `jti` iff one doesn't already exist. Returns
    /// `true` on a fresh insert, `false` when `jti` was already seen (replay).
    async fn insert_nonce_if_absent(
        &self,
        jti: &str,
        site_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn purge_nonces_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn insert_raw_report(&self, report: RawReport) -> Result<i64, StoreError>;

    async fn insert_ldp_report(&self, report: LdpReport) -> Result<i64, StoreError>;

    async fn fetch_reports_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReportBatch, StoreError>;

    async fn get_site_plan(&self, site_id: &str) -> Result<Option<SitePlan>, StoreError>;

    async fn upsert_site_plan(&self, plan: SitePlan) -> Result<(), StoreError>;

    /// Idempotent upsert keyed on `(site_id, metric, window_start)`: replayed
    /// reducer runs overwrite the prior value rather than accumulating.
    async fn upsert_dp_window(&self, window: DpWindow) -> Result<(), StoreError>;

    async fn fetch_dp_windows(
        &self,
        site_id: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DpWindow>, StoreError>;

    /// Idempotent upsert keyed on `(site_id, day, plan)`: the total is
    /// recomputed from the processed range, never incremented in place.
    async fn upsert_site_epsilon_log(&self, log: SiteEpsilonLog) -> Result<(), StoreError>;

    async fn get_site_epsilon_total(
        &self,
        site_id: &str,
        day: NaiveDate,
        plan: Plan,
    ) -> Result<f64, StoreError>;
}
