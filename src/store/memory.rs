//! In-memory `Store` for tests: no network, no migrations, fully
//! deterministic. Mirrors the shape of the Postgres tables one-for-one so
//! tests exercise the same uniqueness/idempotency semantics production gets.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::model::{
    DpWindow, EventKind, LdpReport, Plan, RawReport, SiteEpsilonLog, SitePlan, UploadToken,
};
use super::{ReportBatch, Store, StoreError};

#[derive(Default)]
struct Inner {
    next_token_id: i64,
    next_report_id: i64,
    tokens: HashMap<i64, UploadToken>,
    nonces: HashMap<String, DateTime<Utc>>,
    raw_reports: Vec<RawReport>,
    ldp_reports: Vec<LdpReport>,
    site_plans: HashMap<String, SitePlan>,
    dp_windows: HashMap<(String, String, DateTime<Utc>), DpWindow>,
    epsilon_log: HashMap<(String, NaiveDate, Plan), f64>,
}

/// `Clone`-cheap handle around a shared, lock-guarded table set.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<Inner>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MockStore {
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
        let mut inner = self.inner.lock();
        inner.next_token_id += 1;
        let id = inner.next_token_id;
        inner.tokens.insert(
            id,
            UploadToken {
                id,
                site_id: site_id.to_string(),
                jti: jti.to_string(),
                token_hash: String::new(),
                allowed_origin: allowed_origin.to_string(),
                sampling_rate,
                epsilon_budget,
                epsilon_consumed: 0.0,
                issued_at,
                expires_at,
                revoked_at: None,
            },
        );
        Ok(id)
    }

    async fn set_token_hash(&self, id: i64, token_hash: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let token = inner.tokens.get_mut(&id).ok_or(StoreError::NotFound)?;
        token.token_hash = token_hash.to_string();
        Ok(())
    }

    async fn find_token_by_jti(&self, jti: &str) -> Result<Option<UploadToken>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.tokens.values().find(|t| t.jti == jti).cloned())
    }

    async fn list_active_tokens(&self) -> Result<Vec<UploadToken>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .tokens
            .values()
            .filter(|t| t.revoked_at.is_none())
            .cloned()
            .collect())
    }

    async fn revoke_token(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let token = inner.tokens.get_mut(&id).ok_or(StoreError::NotFound)?;
        token.revoked_at = Some(now);
        Ok(())
    }

    async fn revoke_tokens_for_site(
        &self,
        site_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let mut count = 0u64;
        for token in inner.tokens.values_mut() {
            if token.site_id == site_id && token.revoked_at.is_none() {
                token.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_token_epsilon_consumed(
        &self,
        jti: &str,
        delta: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.tokens.values_mut().find(|t| t.jti == jti) {
            token.epsilon_consumed += delta;
        }
        Ok(())
    }

    async fn insert_nonce_if_absent(
        &self,
        jti: &str,
        _site_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.nonces.contains_key(jti) {
            return Ok(false);
        }
        inner.nonces.insert(jti.to_string(), seen_at);
        Ok(true)
    }

    async fn purge_nonces_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.nonces.len();
        inner.nonces.retain(|_, seen_at| *seen_at >= cutoff);
        Ok((before - inner.nonces.len()) as u64)
    }

    async fn insert_raw_report(&self, mut report: RawReport) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_report_id += 1;
        report.id = inner.next_report_id;
        inner.raw_reports.push(report);
        Ok(inner.next_report_id)
    }

    async fn insert_ldp_report(&self, mut report: LdpReport) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_report_id += 1;
        report.id = inner.next_report_id;
        inner.ldp_reports.push(report);
        Ok(inner.next_report_id)
    }

    async fn fetch_reports_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReportBatch, StoreError> {
        let inner = self.inner.lock();
        Ok(ReportBatch {
            raw: inner
                .raw_reports
                .iter()
                .filter(|r| r.event_time >= start && r.event_time < end)
                .cloned()
                .collect(),
            ldp: inner
                .ldp_reports
                .iter()
                .filter(|r| r.event_time >= start && r.event_time < end)
                .cloned()
                .collect(),
        })
    }

    async fn get_site_plan(&self, site_id: &str) -> Result<Option<SitePlan>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.site_plans.get(site_id).cloned())
    }

    async fn upsert_site_plan(&self, plan: SitePlan) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.site_plans.insert(plan.site_id.clone(), plan);
        Ok(())
    }

    async fn upsert_dp_window(&self, window: DpWindow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (window.site_id.clone(), window.metric.clone(), window.window_start);
        inner.dp_windows.insert(key, window);
        Ok(())
    }

    async fn fetch_dp_windows(
        &self,
        site_id: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DpWindow>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<DpWindow> = inner
            .dp_windows
            .values()
            .filter(|w| {
                w.site_id == site_id
                    && w.metric == metric
                    && w.window_start >= start
                    && w.window_start < end
            })
            .cloned()
            .collect();
        out.sort_by_key(|w| w.window_start);
        Ok(out)
    }

    async fn upsert_site_epsilon_log(&self, log: SiteEpsilonLog) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .epsilon_log
            .insert((log.site_id.clone(), log.day, log.plan), log.epsilon_total);
        Ok(())
    }

    async fn get_site_epsilon_total(
        &self,
        site_id: &str,
        day: NaiveDate,
        plan: Plan,
    ) -> Result<f64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .epsilon_log
            .get(&(site_id.to_string(), day, plan))
            .copied()
            .unwrap_or(0.0))
    }
}
