//! Collector: the last stop before a privatized or clear-text event lands
//! in the store.
//!
//! Three checks gate every event before it's persisted: it must claim the
//! site the caller was authenticated for (no cross-site smuggling inside a
//! shuffled batch), it must not be older than `MAX_OUT_OF_ORDER_SECONDS`,
//! and its plan determines which table it lands in.

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::store::{EventKind, EventPayload, LdpReport, Plan, RawReport, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event payload does not match the site's plan")]
    PlanForbidden,
}

/// One event as handed off by the shuffler, already stripped of transport
/// framing.
#[derive(Clone, Debug)]
pub struct CollectEvent {
    pub kind: EventKind,
    /// Site the event itself claims to belong to, if the client batch sets
    /// it explicitly. Compared against the authenticated site; a mismatch
    /// drops the event rather than trusting the payload.
    pub claimed_site_id: Option<String>,
    pub payload: EventPayload,
    pub epsilon_used: f64,
    pub sampling_rate: f64,
    pub event_time: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct CollectSummary {
    pub accepted: usize,
    pub dropped_stale: usize,
    pub dropped_site_mismatch: usize,
}

/// The pro path requires an LDP-shaped payload (`randomized_bit` set); free
/// and standard accept either shape. A mismatch forbids the whole batch
/// rather than dropping the offending event, since a client sending the
/// wrong schema for its plan is a caller bug, not ordinary noise.
fn schema_matches_plan(plan: Plan, payload: &EventPayload) -> bool {
    match plan {
        Plan::Pro => payload.randomized_bit.is_some(),
        Plan::Free | Plan::Standard => true,
    }
}

/// Persists a batch of events authenticated for `site_id`, applying the
/// freshness and cross-site checks per-event so one bad event in a batch
/// doesn't sink the rest.
pub async fn collect_batch<S: Store>(
    store: &S,
    clock: &dyn Clock,
    metrics: &dyn Metrics,
    max_out_of_order_seconds: i64,
    site_id: &str,
    events: Vec<CollectEvent>,
) -> Result<CollectSummary, CollectorError> {
    let plan = store
        .get_site_plan(site_id)
        .await?
        .map(|p| p.plan)
        .unwrap_or(Plan::Free);

    if events.iter().any(|e| !schema_matches_plan(plan, &e.payload)) {
        return Err(CollectorError::PlanForbidden);
    }

    let now = clock.now();
    let max_age = chrono::Duration::seconds(max_out_of_order_seconds);
    let mut summary = CollectSummary::default();

    for event in events {
        if let Some(claimed) = &event.claimed_site_id {
            if claimed != site_id {
                summary.dropped_site_mismatch += 1;
                metrics.incr_reports_dropped(site_id, "site_mismatch");
                continue;
            }
        }

        if now.signed_duration_since(event.event_time) > max_age {
            summary.dropped_stale += 1;
            metrics.incr_reports_dropped(site_id, "stale");
            continue;
        }

        match plan {
            Plan::Pro => {
                store
                    .insert_ldp_report(LdpReport {
                        id: 0,
                        site_id: site_id.to_string(),
                        kind: event.kind,
                        payload: event.payload,
                        epsilon_used: event.epsilon_used,
                        sampling_rate: event.sampling_rate,
                        event_time: event.event_time,
                        server_received_at: now,
                    })
                    .await?;
            }
            Plan::Free | Plan::Standard => {
                store
                    .insert_raw_report(RawReport {
                        id: 0,
                        site_id: site_id.to_string(),
                        kind: event.kind,
                        payload: event.payload,
                        epsilon_used: event.epsilon_used,
                        sampling_rate: event.sampling_rate,
                        event_time: event.event_time,
                        server_received_at: now,
                    })
                    .await?;
            }
        }
        summary.accepted += 1;
        metrics.incr_reports_collected(site_id, &plan.to_string());
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::metrics::NullMetrics;
    use crate::store::{MockStore, SitePlan};

    fn event(site: Option<&str>, event_time: DateTime<Utc>) -> CollectEvent {
        CollectEvent {
            kind: EventKind::Pageviews,
            claimed_site_id: site.map(String::from),
            payload: EventPayload { randomized_bit: Some(1), ..Default::default() },
            epsilon_used: 0.5,
            sampling_rate: 1.0,
            event_time,
        }
    }

    #[tokio::test]
    async fn accepts_fresh_matching_events() {
        let store = MockStore::new();
        let now = Utc::now();
        let clock = MockClock::new(now);
        let summary = collect_batch(
            &store,
            &clock,
            &NullMetrics,
            300,
            "site-a",
            vec![event(Some("site-a"), now)],
        )
        .await
        .unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.dropped_stale, 0);
    }

    #[tokio::test]
    async fn drops_stale_events() {
        let store = MockStore::new();
        let now = Utc::now();
        let clock = MockClock::new(now);
        let stale_time = now - chrono::Duration::seconds(600);
        let summary = collect_batch(
            &store,
            &clock,
            &NullMetrics,
            300,
            "site-a",
            vec![event(Some("site-a"), stale_time)],
        )
        .await
        .unwrap();
        assert_eq!(summary.accepted, 0);
        assert_eq!(summary.dropped_stale, 1);
    }

    #[tokio::test]
    async fn drops_cross_site_events() {
        let store = MockStore::new();
        let now = Utc::now();
        let clock = MockClock::new(now);
        let summary = collect_batch(
            &store,
            &clock,
            &NullMetrics,
            300,
            "site-a",
            vec![event(Some("site-b"), now)],
        )
        .await
        .unwrap();
        assert_eq!(summary.accepted, 0);
        assert_eq!(summary.dropped_site_mismatch, 1);
    }

    #[tokio::test]
    async fn pro_plan_routes_to_ldp_reports() {
        let store = MockStore::new();
        let now = Utc::now();
        let clock = MockClock::new(now);
        store
            .upsert_site_plan(SitePlan {
                site_id: "site-a".to_string(),
                plan: Plan::Pro,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        collect_batch(&store, &clock, &NullMetrics, 300, "site-a", vec![event(Some("site-a"), now)])
            .await
            .unwrap();

        let batch = store
            .fetch_reports_between(now - chrono::Duration::seconds(1), now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(batch.ldp.len(), 1);
        assert_eq!(batch.raw.len(), 0);
    }

    #[tokio::test]
    async fn pro_plan_rejects_non_ldp_payload_and_records_no_rows() {
        let store = MockStore::new();
        let now = Utc::now();
        let clock = MockClock::new(now);
        store
            .upsert_site_plan(SitePlan {
                site_id: "site-a".to_string(),
                plan: Plan::Pro,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let mut bad_event = event(Some("site-a"), now);
        bad_event.payload.randomized_bit = None;

        let err = collect_batch(&store, &clock, &NullMetrics, 300, "site-a", vec![bad_event])
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::PlanForbidden));

        let batch = store
            .fetch_reports_between(now - chrono::Duration::seconds(1), now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(batch.ldp.len(), 0);
        assert_eq!(batch.raw.len(), 0);
    }

    #[tokio::test]
    async fn plan_routes_reports_to_the_right_table() {
        let store = MockStore::new();
        let now = Utc::now();
        let clock = MockClock::new(now);

        store
            .upsert_site_plan(SitePlan {
                site_id: "site-free".to_string(),
                plan: Plan::Free,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
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

        collect_batch(
            &store,
            &clock,
            &NullMetrics,
            300,
            "site-free",
            vec![CollectEvent {
                kind: EventKind::Pageviews,
                claimed_site_id: Some("site-free".to_string()),
                payload: EventPayload::default(),
                epsilon_used: 0.0,
                sampling_rate: 1.0,
                event_time: now,
            }],
        )
        .await
        .unwrap();

        collect_batch(
            &store,
            &clock,
            &NullMetrics,
            300,
            "site-pro",
            vec![CollectEvent {
                kind: EventKind::Pageviews,
                claimed_site_id: Some("site-pro".to_string()),
                payload: EventPayload { randomized_bit: Some(1), ..Default::default() },
                epsilon_used: 0.5,
                sampling_rate: 1.0,
                event_time: now,
            }],
        )
        .await
        .unwrap();

        let batch = store
            .fetch_reports_between(now - chrono::Duration::seconds(1), now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(batch.raw.len(), 1);
        assert_eq!(batch.raw[0].site_id, "site-free");
        assert_eq!(batch.ldp.len(), 1);
        assert_eq!(batch.ldp[0].site_id, "site-pro");
    }
}
