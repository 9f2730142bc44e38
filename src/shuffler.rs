//! Shuffler stage.
//!
//! Verifies the bearer token, admits the request under the site's rate
//! limit, rejects replays by nonce, holds the batch for a random delay to
//! decorrelate arrival time from event time, then hands off to the
//! collector. Mirrors the reference `routers/shuffle.py` handler's shape
//! one stage at a time rather than as one monolithic function, matching how
//! `tinyzkp_api`'s handlers separate auth/rate-limit/work into discrete
//! steps rather than one big match arm.

use rand::Rng;

use crate::clock::Clock;
use crate::collector::{self, CollectEvent, CollectSummary, CollectorError};
use crate::metrics::Metrics;
use crate::ratelimit::{RateLimitError, RateLimiter};
use crate::store::{Plan, Store, StoreError};
use crate::token::{self, TokenError};

#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("replayed nonce")]
    Replay,
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One in this many requests also triggers a nonce-table purge, so cleanup
/// happens continuously without adding a DELETE to every hot-path request.
const PURGE_SAMPLE_RATE: u32 = 100;

pub struct ShuffleOutcome {
    pub site_id: String,
    pub summary: CollectSummary,
    pub held_for_seconds: f64,
}

/// Runs one shuffle request end to end. `skip_hold` lets tests and the
/// admin/debug path bypass the random delay; production always holds.
#[allow(clippy::too_many_arguments)]
pub async fn shuffle_and_forward<S: Store>(
    store: &S,
    clock: &dyn Clock,
    rate_limiter: &RateLimiter,
    metrics: &dyn Metrics,
    token_secret: &[u8],
    enforce_token_budget: bool,
    max_out_of_order_seconds: i64,
    shuffle_hold_max_seconds: u64,
    nonce_retention_seconds: i64,
    skip_hold: bool,
    token: &str,
    nonce: &str,
    request_origin: &str,
    source_ip: &str,
    events: Vec<CollectEvent>,
) -> Result<ShuffleOutcome, ShuffleError> {
    let row = token::verify_token(store, clock, token_secret, enforce_token_budget, token, request_origin)
        .await?;

    let plan = store
        .get_site_plan(&row.site_id)
        .await?
        .map(|p| p.plan)
        .unwrap_or(Plan::Free);

    if rate_limiter.admit(&row.site_id, source_ip, plan).is_err() {
        metrics.incr_shuffle_rejected(&row.site_id, "rate_limited");
        return Err(ShuffleError::RateLimit(RateLimitError::Exceeded));
    }

    let now = clock.now();
    if !store.insert_nonce_if_absent(nonce, &row.site_id, now).await? {
        metrics.incr_shuffle_rejected(&row.site_id, "replay");
        return Err(ShuffleError::Replay);
    }
    metrics.incr_shuffle_admitted(&row.site_id);

    let held_for_seconds = if skip_hold || shuffle_hold_max_seconds == 0 {
        0.0
    } else {
        let hold_ms = rand::thread_rng().gen_range(0..=shuffle_hold_max_seconds * 1000);
        tokio::time::sleep(std::time::Duration::from_millis(hold_ms)).await;
        hold_ms as f64 / 1000.0
    };
    metrics.observe_shuffle_hold_seconds(held_for_seconds);

    let epsilon_in_batch: f64 = events.iter().map(|e| e.epsilon_used).sum();
    let summary = collector::collect_batch(
        store,
        clock,
        metrics,
        max_out_of_order_seconds,
        &row.site_id,
        events,
    )
    .await?;

    if epsilon_in_batch > 0.0 {
        store
            .record_token_epsilon_consumed(&row.jti, epsilon_in_batch)
            .await?;
    }

    if rand::thread_rng().gen_ratio(1, PURGE_SAMPLE_RATE) {
        let cutoff = now - chrono::Duration::seconds(nonce_retention_seconds);
        let _ = store.purge_nonces_older_than(cutoff).await;
    }

    Ok(ShuffleOutcome { site_id: row.site_id, summary, held_for_seconds })
}
