//! Environment-driven configuration.
//!
//! Mirrors the `tinyzkp_api` binary's own `std::env::var(..).ok().and_then(..)`
//! idiom rather than pulling in a config-file crate: every knob enumerated in
//! the design document has an environment variable and a sane default.

/// All tunables for the ingestion → privacy-accounting → aggregation pipeline.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_addr: std::net::SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,

    pub upload_token_secret: Vec<u8>,
    pub upload_token_ttl_seconds: i64,
    pub enforce_token_budget: bool,
    pub admin_token: String,
    pub stripe_webhook_secret: String,

    pub min_reports_per_window: usize,
    pub max_out_of_order_seconds: i64,
    pub live_watermark_seconds: i64,

    pub rate_limit_bucket_per_min_free: usize,
    pub rate_limit_bucket_per_min_standard: usize,
    pub rate_limit_bucket_per_min_pro: usize,

    pub alpha_smoothing: f64,
    pub aggregate_dp_epsilon: f64,
    pub snr_floor: f64,

    pub shuffle_hold_max_seconds: u64,

    pub reducer_interval_seconds: u64,

    pub cors_allowed_origins: Vec<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from the process environment, applying `.env` first
    /// if present (dev convenience, same as `cooprefr-bettersys`'s `dotenv`).
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let secret = std::env::var("UPLOAD_TOKEN_SECRET")
            .map_err(|_| anyhow::anyhow!("UPLOAD_TOKEN_SECRET is required"))?;
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;

        let addr: std::net::SocketAddr = env_string_or("SERVER_ADDR", "127.0.0.1:8080")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid SERVER_ADDR: {e}"))?;

        let cors_allowed_origins = env_string_or("CORS_ALLOWED_ORIGINS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            server_addr: addr,
            database_url,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),

            upload_token_secret: secret.into_bytes(),
            upload_token_ttl_seconds: env_or("UPLOAD_TOKEN_TTL_SECONDS", 900),
            enforce_token_budget: env_or("ENFORCE_TOKEN_BUDGET", true),
            admin_token: env_string_or("ADMIN_TOKEN", "changeme-admin"),
            stripe_webhook_secret: env_string_or("STRIPE_WEBHOOK_SECRET", ""),

            min_reports_per_window: env_or("MIN_REPORTS_PER_WINDOW", 40),
            max_out_of_order_seconds: env_or("MAX_OUT_OF_ORDER_SECONDS", 300),
            live_watermark_seconds: env_or("LIVE_WATERMARK_SECONDS", 120),

            rate_limit_bucket_per_min_free: env_or("RATE_LIMIT_BUCKET_PER_MIN_FREE", 60),
            rate_limit_bucket_per_min_standard: env_or("RATE_LIMIT_BUCKET_PER_MIN_STANDARD", 200),
            rate_limit_bucket_per_min_pro: env_or("RATE_LIMIT_BUCKET_PER_MIN_PRO", 600),

            alpha_smoothing: env_or("ALPHA_SMOOTHING", 0.5),
            aggregate_dp_epsilon: env_or("AGGREGATE_DP_EPSILON", 1.0),
            snr_floor: env_or("SNR_FLOOR", 1.5),

            shuffle_hold_max_seconds: env_or("SHUFFLE_HOLD_MAX_SECONDS", 120),

            reducer_interval_seconds: env_or("REDUCER_INTERVAL_SECONDS", 60),

            cors_allowed_origins,
        })
    }

    /// A config with safe, fixed defaults for tests (no env lookups, zero hold).
    pub fn for_tests() -> Self {
        Self {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            database_url: "postgres://localhost/test".into(),
            database_max_connections: 5,
            upload_token_secret: b"test-secret-key-at-least-32-bytes".to_vec(),
            upload_token_ttl_seconds: 900,
            enforce_token_budget: true,
            admin_token: "test-admin-token".to_string(),
            stripe_webhook_secret: "whsec_test".to_string(),
            min_reports_per_window: 40,
            max_out_of_order_seconds: 300,
            live_watermark_seconds: 120,
            rate_limit_bucket_per_min_free: 60,
            rate_limit_bucket_per_min_standard: 200,
            rate_limit_bucket_per_min_pro: 600,
            alpha_smoothing: 0.5,
            aggregate_dp_epsilon: 1.0,
            snr_floor: 1.5,
            shuffle_hold_max_seconds: 0,
            reducer_interval_seconds: 60,
            cors_allowed_origins: vec![],
        }
    }

    /// Bucket size for a given plan, per §4.3 (plan-aware: free < standard < pro).
    pub fn rate_limit_bucket_for(&self, plan: crate::store::Plan) -> usize {
        match plan {
            crate::store::Plan::Free => self.rate_limit_bucket_per_min_free,
            crate::store::Plan::Standard => self.rate_limit_bucket_per_min_standard,
            crate::store::Plan::Pro => self.rate_limit_bucket_per_min_pro,
        }
    }
}
