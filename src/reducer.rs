//! Reducer: turns raw/LDP reports into published `DpWindow` aggregates.
//!
//! Runs over one UTC day at a time (matching the reference
//! `scheduler/nightly_reduce.py` batch granularity), bucketing reports into
//! windows by `(site_id, metric, window_start)`, applying the plan's noise
//! policy, and upserting both the aggregate and the day's privacy-budget
//! ledger entry. The ledger entry is always a full recomputation over the
//! day's reports, never an increment — replaying a day is a no-op.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::noise::NoiseSource;
use crate::rr;
use crate::store::{DpWindow, EventKind, EventPayload, LdpReport, Plan, RawReport, SiteEpsilonLog, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReducerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builds the noise source for one standard-plan bucket, keyed by the
/// qualified metric name rather than the raw `EventKind` so conversion
/// buckets (`conversion:<type>`) each get their own noise draw. Production
/// passes a factory returning a fresh `CryptoNoiseSource`; tests pass one
/// returning a `SeededNoiseSource::for_bucket(..)` so reruns are
/// byte-identical.
pub type NoiseFactory = dyn Fn(&str, &str, DateTime<Utc>) -> Box<dyn NoiseSource> + Send + Sync;

/// The bucket name a report falls under: the event kind's name for
/// everything except conversions, which split per `conversion_type`
/// (default `"unknown"`) per spec.
fn metric_name(kind: EventKind, payload: &EventPayload) -> String {
    if kind == EventKind::Conversions {
        format!("conversion:{}", payload.conversion_type.as_deref().unwrap_or("unknown"))
    } else {
        kind.to_string()
    }
}

/// `uniques` windows are 3 minutes wide; every other metric (including each
/// conversion funnel) is 15 minutes wide.
fn window_delta(metric: &str) -> Duration {
    if metric == "uniques" {
        Duration::minutes(3)
    } else {
        Duration::minutes(15)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReduceSummary {
    pub windows_published: usize,
    pub windows_skipped_insufficient: usize,
    pub windows_skipped_low_snr: usize,
    pub reports_processed: usize,
}

/// Tunables the reducer needs, bundled so the function signature doesn't
/// grow a parameter per config field.
pub struct ReducerParams<'a> {
    pub min_reports_per_window: usize,
    pub alpha_smoothing: f64,
    pub snr_floor: f64,
    pub aggregate_dp_epsilon: f64,
    pub noise_factory: &'a NoiseFactory,
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - chrono::Duration::seconds(t.second() as i64) - chrono::Duration::nanoseconds(t.nanosecond() as i64)
}

/// Processes every report with `event_time` in `[day, day+1)`.
pub async fn run_once<S: Store>(
    store: &S,
    clock: &dyn Clock,
    metrics: &dyn Metrics,
    params: &ReducerParams<'_>,
    day: NaiveDate,
) -> Result<ReduceSummary, ReducerError> {
    let day_start = day.and_hms_opt(0, 0, 0).expect("valid midnight").and_utc();
    let day_end = day_start + chrono::Duration::days(1);

    let batch = store.fetch_reports_between(day_start, day_end).await?;
    let mut summary = ReduceSummary {
        reports_processed: batch.raw.len() + batch.ldp.len(),
        ..Default::default()
    };

    let mut plan_cache: HashMap<String, Plan> = HashMap::new();
    let mut epsilon_totals: HashMap<(String, Plan), f64> = HashMap::new();

    let mut raw_buckets: HashMap<(String, String, DateTime<Utc>), Vec<RawReport>> = HashMap::new();
    for report in batch.raw {
        let metric = metric_name(report.kind, &report.payload);
        let key = (report.site_id.clone(), metric, truncate_to_minute(report.event_time));
        raw_buckets.entry(key).or_default().push(report);
    }

    let mut ldp_buckets: HashMap<(String, String, DateTime<Utc>), Vec<LdpReport>> = HashMap::new();
    for report in batch.ldp {
        let metric = metric_name(report.kind, &report.payload);
        let key = (report.site_id.clone(), metric, truncate_to_minute(report.event_time));
        ldp_buckets.entry(key).or_default().push(report);
    }

    for ((site_id, metric, window_start), rows) in raw_buckets {
        let plan = match plan_cache.get(&site_id) {
            Some(plan) => *plan,
            None => {
                let plan = store.get_site_plan(&site_id).await?.map(|p| p.plan).unwrap_or(Plan::Free);
                plan_cache.insert(site_id.clone(), plan);
                plan
            }
        };

        let historical_value: f64 = rows
            .iter()
            .filter_map(|r| if r.payload.historical_import { r.payload.value } else { None })
            .sum();
        let live_count = rows.iter().filter(|r| !r.payload.historical_import).count() as f64;
        let base_value = historical_value + live_count;
        let has_historical = rows.iter().any(|r| r.payload.historical_import);
        let epsilon_used: f64 = rows.iter().map(|r| r.epsilon_used).sum();

        if !has_historical && rows.len() < params.min_reports_per_window {
            summary.windows_skipped_insufficient += 1;
            metrics.incr_buckets_skipped("insufficient_reports");
            continue;
        }

        let (value, variance) = match plan {
            Plan::Free => (base_value, base_value.max(1.0)),
            Plan::Standard | Plan::Pro => {
                let noise_source = (params.noise_factory)(&site_id, &metric, window_start);
                let b = 1.0 / params.aggregate_dp_epsilon.max(rr::EPS_NUM);
                let noise = noise_source.laplace(b);
                (base_value + noise, b * b)
            }
        };

        *epsilon_totals.entry((site_id.clone(), plan)).or_insert(0.0) += epsilon_used;

        publish_window(store, metrics, &site_id, plan, &metric, window_start, value, variance, rows.len() as i64, clock.now())
            .await?;
        summary.windows_published += 1;
    }

    for ((site_id, metric, window_start), rows) in ldp_buckets {
        let epsilon_used = rows.first().map(|r| r.epsilon_used).unwrap_or(0.0);
        let sampling_rate = rows.first().map(|r| r.sampling_rate).unwrap_or(1.0);
        let has_historical = rows.iter().any(|r| r.payload.historical_import);
        let ones: f64 = rows.iter().filter_map(|r| r.payload.randomized_bit).map(f64::from).sum();
        let total = rows.len() as f64;
        let total_epsilon: f64 = rows.iter().map(|r| r.epsilon_used).sum();

        if !has_historical && rows.len() < params.min_reports_per_window {
            summary.windows_skipped_insufficient += 1;
            metrics.incr_buckets_skipped("insufficient_reports");
            continue;
        }

        let (estimate, variance) = rr::unbiased_estimate(ones, total, epsilon_used, sampling_rate, params.alpha_smoothing);
        let se = rr::standard_error(variance);
        let snr = if se > rr::EPS_NUM { estimate / se } else { 0.0 };
        if snr < params.snr_floor {
            summary.windows_skipped_low_snr += 1;
            metrics.incr_buckets_skipped("low_snr");
            continue;
        }

        *epsilon_totals.entry((site_id.clone(), Plan::Pro)).or_insert(0.0) += total_epsilon;

        publish_window(store, metrics, &site_id, Plan::Pro, &metric, window_start, estimate, variance, rows.len() as i64, clock.now())
            .await?;
        summary.windows_published += 1;
    }

    for ((site_id, plan), total) in epsilon_totals {
        store
            .upsert_site_epsilon_log(SiteEpsilonLog { site_id, day, plan, epsilon_total: total })
            .await?;
    }

    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn publish_window<S: Store>(
    store: &S,
    metrics: &dyn Metrics,
    site_id: &str,
    plan: Plan,
    metric: &str,
    window_start: DateTime<Utc>,
    value: f64,
    variance: f64,
    report_count: i64,
    published_at: DateTime<Utc>,
) -> Result<(), ReducerError> {
    let se = rr::standard_error(variance);
    let (ci80_low, ci80_high) = rr::confidence_interval(value, se, rr::Z_80);
    let (ci95_low, ci95_high) = rr::confidence_interval(value, se, rr::Z_95);

    store
        .upsert_dp_window(DpWindow {
            id: 0,
            site_id: site_id.to_string(),
            plan,
            metric: metric.to_string(),
            window_start,
            window_end: window_start + window_delta(metric),
            value,
            variance,
            ci80_low,
            ci80_high,
            ci95_low,
            ci95_high,
            report_count,
            published_at,
        })
        .await?;
    metrics.incr_buckets_published(site_id, &plan.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::metrics::NullMetrics;
    use crate::noise::SeededNoiseSource;
    use crate::store::{EventPayload, MockStore, SitePlan};

    fn seeded_factory(site: &str, metric: &str, window_start: DateTime<Utc>) -> Box<dyn NoiseSource> {
        Box::new(SeededNoiseSource::for_bucket(site, metric, &window_start.to_rfc3339()))
    }

    fn params(noise_factory: &NoiseFactory) -> ReducerParams<'_> {
        ReducerParams {
            min_reports_per_window: 2,
            alpha_smoothing: 0.5,
            snr_floor: 0.0,
            aggregate_dp_epsilon: 1.0,
            noise_factory,
        }
    }

    async fn seed_free_reports(store: &MockStore, site_id: &str, day: NaiveDate, n: usize) {
        let base = day.and_hms_opt(10, 0, 0).unwrap().and_utc();
        for i in 0..n {
            store
                .insert_raw_report(RawReport {
                    id: 0,
                    site_id: site_id.to_string(),
                    kind: EventKind::Pageviews,
                    payload: EventPayload::default(),
                    epsilon_used: 0.0,
                    sampling_rate: 1.0,
                    event_time: base,
                    server_received_at: base,
                })
                .await
                .unwrap();
            let _ = i;
        }
    }

    #[tokio::test]
    async fn free_plan_window_is_exact_count_with_placeholder_variance() {
        let store = MockStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        seed_free_reports(&store, "site-a", day, 5).await;

        let factory: &NoiseFactory = &seeded_factory;
        let clock = SystemClock;
        let summary = run_once(&store, &clock, &NullMetrics, &params(factory), day).await.unwrap();
        assert_eq!(summary.windows_published, 1);

        let base = day.and_hms_opt(10, 0, 0).unwrap().and_utc();
        let windows = store
            .fetch_dp_windows(
                "site-a",
                "pageviews",
                base - chrono::Duration::minutes(1),
                base + chrono::Duration::minutes(1),
            )
            .await
            .unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].value, 5.0);
        assert_eq!(windows[0].variance, 5.0);
    }

    #[tokio::test]
    async fn standard_plan_rerun_is_byte_identical_with_seeded_noise() {
        let store = MockStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        let now = day.and_hms_opt(0, 0, 0).unwrap().and_utc();
        store
            .upsert_site_plan(SitePlan {
                site_id: "site-b".to_string(),
                plan: Plan::Standard,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        seed_free_reports(&store, "site-b", day, 5).await;

        let factory: &NoiseFactory = &seeded_factory;
        let clock = SystemClock;
        run_once(&store, &clock, &NullMetrics, &params(factory), day).await.unwrap();

        let base = day.and_hms_opt(10, 0, 0).unwrap().and_utc();
        let first = store
            .fetch_dp_windows("site-b", "pageviews", base - chrono::Duration::minutes(1), base + chrono::Duration::minutes(1))
            .await
            .unwrap()[0]
            .value;

        let store2 = MockStore::new();
        store2
            .upsert_site_plan(SitePlan {
                site_id: "site-b".to_string(),
                plan: Plan::Standard,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        seed_free_reports(&store2, "site-b", day, 5).await;
        run_once(&store2, &clock, &NullMetrics, &params(factory), day).await.unwrap();
        let second = store2
            .fetch_dp_windows("site-b", "pageviews", base - chrono::Duration::minutes(1), base + chrono::Duration::minutes(1))
            .await
            .unwrap()[0]
            .value;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn windows_below_the_minimum_are_skipped_unless_historical() {
        let store = MockStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        seed_free_reports(&store, "site-c", day, 1).await;

        let factory: &NoiseFactory = &seeded_factory;
        let clock = SystemClock;
        let summary = run_once(&store, &clock, &NullMetrics, &params(factory), day).await.unwrap();
        assert_eq!(summary.windows_published, 0);
        assert_eq!(summary.windows_skipped_insufficient, 1);
    }

    #[tokio::test]
    async fn historical_import_bypasses_the_minimum() {
        let store = MockStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        let base = day.and_hms_opt(10, 0, 0).unwrap().and_utc();
        store
            .insert_raw_report(RawReport {
                id: 0,
                site_id: "site-d".to_string(),
                kind: EventKind::Pageviews,
                payload: EventPayload { historical_import: true, value: Some(500.0), ..Default::default() },
                epsilon_used: 0.0,
                sampling_rate: 1.0,
                event_time: base,
                server_received_at: base,
            })
            .await
            .unwrap();

        let factory: &NoiseFactory = &seeded_factory;
        let clock = SystemClock;
        let summary = run_once(&store, &clock, &NullMetrics, &params(factory), day).await.unwrap();
        assert_eq!(summary.windows_published, 1);

        let windows = store
            .fetch_dp_windows("site-d", "pageviews", base - chrono::Duration::minutes(1), base + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(windows[0].value, 500.0);
    }

    #[tokio::test]
    async fn epsilon_log_recomputes_rather_than_accumulates_on_rerun() {
        let store = MockStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        let now = day.and_hms_opt(0, 0, 0).unwrap().and_utc();
        store
            .upsert_site_plan(SitePlan {
                site_id: "site-e".to_string(),
                plan: Plan::Pro,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let base = day.and_hms_opt(10, 0, 0).unwrap().and_utc();
        for _ in 0..10 {
            store
                .insert_ldp_report(LdpReport {
                    id: 0,
                    site_id: "site-e".to_string(),
                    kind: EventKind::Pageviews,
                    payload: EventPayload { randomized_bit: Some(1), ..Default::default() },
                    epsilon_used: 0.5,
                    sampling_rate: 1.0,
                    event_time: base,
                    server_received_at: base,
                })
                .await
                .unwrap();
        }

        let factory: &NoiseFactory = &seeded_factory;
        let clock = SystemClock;
        let mut p = params(factory);
        p.snr_floor = -1.0;
        run_once(&store, &clock, &NullMetrics, &p, day).await.unwrap();
        let first_total = store.get_site_epsilon_total("site-e", day, Plan::Pro).await.unwrap();
        run_once(&store, &clock, &NullMetrics, &p, day).await.unwrap();
        let second_total = store.get_site_epsilon_total("site-e", day, Plan::Pro).await.unwrap();

        assert_eq!(first_total, second_total);
        assert_eq!(first_total, 5.0);
    }

    #[tokio::test]
    async fn ldp_reports_recover_the_true_rate_through_the_full_pipeline() {
        let store = MockStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        let now = day.and_hms_opt(12, 0, 0).unwrap().and_utc();

        store
            .upsert_site_plan(SitePlan {
                site_id: "site-pro".to_string(),
                plan: Plan::Pro,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        // 1000 reports, true presence rate 0.8, epsilon 2.0 (p_true high).
        let eps = 2.0;
        let (p_true, _) = rr::prob_true(eps);
        let true_rate = 0.8;
        let n = 1000;
        let mut rng_state = 12345u64;
        let mut next = || {
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (rng_state >> 33) as f64 / (1u64 << 31) as f64
        };
        for _ in 0..n {
            let true_bit = next() < true_rate;
            let flip = next() < p_true;
            let observed = if flip { true_bit } else { !true_bit };
            store
                .insert_ldp_report(LdpReport {
                    id: 0,
                    site_id: "site-pro".to_string(),
                    kind: EventKind::Uniques,
                    payload: EventPayload { randomized_bit: Some(if observed { 1 } else { 0 }), ..Default::default() },
                    epsilon_used: eps,
                    sampling_rate: 1.0,
                    event_time: now,
                    server_received_at: now,
                })
                .await
                .unwrap();
        }

        let clock = SystemClock;
        let mut p = params(&seeded_factory);
        p.min_reports_per_window = 40;
        p.alpha_smoothing = 0.0;
        p.snr_floor = 0.0;
        run_once(&store, &clock, &NullMetrics, &p, day).await.unwrap();

        let windows = store
            .fetch_dp_windows(
                "site-pro",
                "uniques",
                now - chrono::Duration::minutes(1),
                now + chrono::Duration::minutes(1),
            )
            .await
            .unwrap();
        assert_eq!(windows.len(), 1);
        let estimated_rate = windows[0].value / n as f64;
        assert!((estimated_rate - true_rate).abs() < 0.1, "estimated_rate={estimated_rate}");
    }

    #[tokio::test]
    async fn low_snr_ldp_windows_are_suppressed() {
        let store = MockStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        let now = day.and_hms_opt(12, 0, 0).unwrap().and_utc();
        store
            .upsert_site_plan(SitePlan {
                site_id: "site-noisy".to_string(),
                plan: Plan::Pro,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        // Near-maximal privacy (epsilon close to 0): signal is buried in noise.
        for i in 0..50 {
            store
                .insert_ldp_report(LdpReport {
                    id: 0,
                    site_id: "site-noisy".to_string(),
                    kind: EventKind::Sessions,
                    payload: EventPayload { randomized_bit: Some((i % 2) as u8), ..Default::default() },
                    epsilon_used: 0.0001,
                    sampling_rate: 1.0,
                    event_time: now,
                    server_received_at: now,
                })
                .await
                .unwrap();
        }

        let clock = SystemClock;
        let mut p = params(&seeded_factory);
        p.min_reports_per_window = 40;
        p.snr_floor = 1.5;
        let summary = run_once(&store, &clock, &NullMetrics, &p, day).await.unwrap();
        assert_eq!(summary.windows_published, 0);
        assert_eq!(summary.windows_skipped_low_snr, 1);
    }
}
