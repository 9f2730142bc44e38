//! Crate root: public surface, shared aliases, and protocol-wide invariants
//!
//! This module is the single canonical entry-point for downstream users of
//! the library. It centralizes the error taxonomy, the shared `AppContext`
//! wiring, and re-exports the submodules that implement the pipeline
//! described in the design document: upload tokens, the shuffler, the
//! randomized-response decoder, the reducer, and the relational store.
//!
//! ## Invariants
//!
//! - **No mutable singletons.** Every component that needs shared state
//!   (rate limiter, store, noise source, clock, metrics) receives it through
//!   an explicit `AppContext`, constructed once at startup. Tests substitute
//!   mocks by building their own `AppContext`.
//! - **Errors are values.** Components return `Result<_, SomeError>` where
//!   `SomeError` is a `thiserror`-derived enum local to the module; nothing
//!   panics on a bad request. The HTTP layer is the only place errors are
//!   mapped to status codes.
//! - **Privacy accounting is idempotent.** The reducer recomputes ledger
//!   totals from scratch over the processed range rather than incrementing,
//!   so replaying a reducer run never double-counts ε.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Application configuration loaded from the environment.
pub mod config;
/// Abstraction over wall-clock time so tests can control "now".
pub mod clock;
/// Randomized-response decoder: unbiased estimator + variance, no I/O.
pub mod rr;
/// Noise sources for the central-DP (standard plan) aggregation path.
pub mod noise;
/// Upload-token lifecycle: issue, verify, revoke, replay defense.
pub mod token;
/// Per-(site, source) sliding-window admission control.
pub mod ratelimit;
/// Shuffler stage: random hold, replay/origin checks, forwards to collector.
pub mod shuffler;
/// Collector: freshness checks, raw/LDP report persistence.
pub mod collector;
/// Reducer: buckets reports into windows, applies plan noise, upserts aggregates.
pub mod reducer;
/// Metrics sink abstraction (counters/histograms for the ingress/reducer path).
pub mod metrics;
/// Relational store trait plus the Postgres and in-memory implementations.
pub mod store;
/// Thin billing seam (plan upgrades from webhook events); no Stripe SDK calls.
pub mod billing;
/// HTTP surface: axum router and handlers wiring the components together.
pub mod http;

pub use config::Config;
pub use store::Store;

/// Shared application wiring passed to every handler and background task.
///
/// Constructed once at startup (see `src/bin/server.rs`); never a global.
#[derive(Clone)]
pub struct AppContext<S: Store> {
    pub store: S,
    pub clock: std::sync::Arc<dyn clock::Clock>,
    pub noise: std::sync::Arc<dyn noise::NoiseSource>,
    pub metrics: std::sync::Arc<dyn metrics::Metrics>,
    pub rate_limiter: std::sync::Arc<ratelimit::RateLimiter>,
    pub config: std::sync::Arc<Config>,
}

impl<S: Store> AppContext<S> {
    pub fn new(
        store: S,
        clock: std::sync::Arc<dyn clock::Clock>,
        noise: std::sync::Arc<dyn noise::NoiseSource>,
        metrics: std::sync::Arc<dyn metrics::Metrics>,
        config: std::sync::Arc<Config>,
    ) -> Self {
        let rate_limiter = std::sync::Arc::new(ratelimit::RateLimiter::new(config.clone()));
        Self { store, clock, noise, metrics, rate_limiter, config }
    }
}
