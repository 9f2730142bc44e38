//! On-demand/periodic reducer runner.
//!
//! Invoked either for a single backfill day (`--day`) or left to loop on
//! `REDUCER_INTERVAL_SECONDS`, reducing "yesterday" each tick — the
//! equivalent of the reference project's nightly cron job, minus the cron.

use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;

use privhouse::clock::SystemClock;
use privhouse::metrics::NullMetrics;
use privhouse::noise::CryptoNoiseSource;
use privhouse::reducer::{self, NoiseFactory, ReducerParams};
use privhouse::store::PgStore;
use privhouse::Config;

#[derive(Parser)]
struct Args {
    /// UTC day to reduce, as YYYY-MM-DD. Defaults to yesterday, run once.
    #[arg(long)]
    day: Option<chrono::NaiveDate>,
    /// Keep running, reducing the previous day every REDUCER_INTERVAL_SECONDS.
    #[arg(long)]
    loop_forever: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "privhouse=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
    store.ensure_schema().await?;

    let clock = SystemClock;
    let noise = Arc::new(CryptoNoiseSource);
    let factory: &NoiseFactory = &{
        let noise = noise.clone();
        move |_site: &str, _metric: &str, _window_start: chrono::DateTime<Utc>| {
            Box::new(PassthroughNoise(noise.clone())) as Box<dyn privhouse::noise::NoiseSource>
        }
    };
    let params = ReducerParams {
        min_reports_per_window: config.min_reports_per_window,
        alpha_smoothing: config.alpha_smoothing,
        snr_floor: config.snr_floor,
        aggregate_dp_epsilon: config.aggregate_dp_epsilon,
        noise_factory: factory,
    };

    loop {
        let day = args.day.unwrap_or_else(|| (Utc::now() - Duration::days(1)).date_naive());
        tracing::info!(%day, "running reducer");
        let summary = reducer::run_once(&store, &clock, &NullMetrics, &params, day).await?;
        tracing::info!(
            published = summary.windows_published,
            skipped_insufficient = summary.windows_skipped_insufficient,
            skipped_low_snr = summary.windows_skipped_low_snr,
            "reducer run complete"
        );

        if !args.loop_forever {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(config.reducer_interval_seconds)).await;
    }

    Ok(())
}

struct PassthroughNoise(Arc<dyn privhouse::noise::NoiseSource>);

impl privhouse::noise::NoiseSource for PassthroughNoise {
    fn laplace(&self, b: f64) -> f64 {
        self.0.laplace(b)
    }
}
