//! Per-`(site_id, source_ip)` sliding-window admission control for the
//! shuffler.
//!
//! In-process and `dashmap`-backed rather than Redis-backed like
//! `tinyzkp_api`'s `Kvs` usage counters — the shuffler's window is short
//! (60s) and per-instance admission control doesn't need to survive a
//! restart, so the extra network hop would just add latency to the hot path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::Config;
use crate::store::Plan;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for this site/source")]
    Exceeded,
}

struct Bucket {
    window_start: Instant,
    count: usize,
}

/// Sliding-window limiter keyed by `(site_id, source_ip)`. The bucket size
/// is plan-dependent: free sites get the smallest allowance, pro the
/// largest, matching §4.3's plan-aware admission policy.
pub struct RateLimiter {
    config: Arc<Config>,
    buckets: DashMap<(String, String), Bucket>,
}

impl RateLimiter {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, buckets: DashMap::new() }
    }

    /// Admits one request for `(site_id, source_ip)` under `plan`'s bucket
    /// size, resetting the window once 60 seconds have elapsed.
    pub fn admit(&self, site_id: &str, source_ip: &str, plan: Plan) -> Result<(), RateLimitError> {
        let limit = self.config.rate_limit_bucket_for(plan);
        let key = (site_id.to_string(), source_ip.to_string());
        let now = Instant::now();

        let mut entry = self.buckets.entry(key).or_insert_with(|| Bucket {
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.window_start) >= Duration::from_secs(60) {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            return Err(RateLimitError::Exceeded);
        }
        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_plan_bucket_then_rejects() {
        let mut cfg = Config::for_tests();
        cfg.rate_limit_bucket_per_min_free = 3;
        let limiter = RateLimiter::new(Arc::new(cfg));

        for _ in 0..3 {
            limiter.admit("site-a", "1.2.3.4", Plan::Free).unwrap();
        }
        assert!(limiter.admit("site-a", "1.2.3.4", Plan::Free).is_err());
    }

    #[test]
    fn separate_sources_have_separate_buckets() {
        let mut cfg = Config::for_tests();
        cfg.rate_limit_bucket_per_min_free = 1;
        let limiter = RateLimiter::new(Arc::new(cfg));

        limiter.admit("site-a", "1.2.3.4", Plan::Free).unwrap();
        limiter.admit("site-a", "5.6.7.8", Plan::Free).unwrap();
    }

    #[test]
    fn higher_plans_get_larger_buckets() {
        let mut cfg = Config::for_tests();
        cfg.rate_limit_bucket_per_min_free = 1;
        cfg.rate_limit_bucket_per_min_pro = 5;
        let limiter = RateLimiter::new(Arc::new(cfg));

        for _ in 0..5 {
            limiter.admit("site-a", "1.2.3.4", Plan::Pro).unwrap();
        }
        assert!(limiter.admit("site-a", "1.2.3.4", Plan::Pro).is_err());
    }
}
