//! Row types mirroring the privacy pipeline's relational schema.
//!
//! Column names and types follow the reference SQLAlchemy models
//! (`app/models.py`) closely enough that a migration written against either
//! schema reads the same way; this is the Rust side's single source of
//! truth for what a row looks like.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Billing tier. Drives rate-limit bucket size, ingestion table routing, and
/// the reducer's noise policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Standard,
    Pro,
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Plan::Free => write!(f, "free"),
            Plan::Standard => write!(f, "standard"),
            Plan::Pro => write!(f, "pro"),
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "standard" => Ok(Plan::Standard),
            "pro" => Ok(Plan::Pro),
            _ => Err(()),
        }
    }
}

/// The event kind a report is bucketed under (the `kind` column).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Uniques,
    Pageviews,
    Sessions,
    Conversions,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Uniques => write!(f, "uniques"),
            EventKind::Pageviews => write!(f, "pageviews"),
            EventKind::Sessions => write!(f, "sessions"),
            EventKind::Conversions => write!(f, "conversions"),
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniques" => Ok(EventKind::Uniques),
            "pageviews" => Ok(EventKind::Pageviews),
            "sessions" => Ok(EventKind::Sessions),
            "conversions" => Ok(EventKind::Conversions),
            _ => Err(()),
        }
    }
}

/// Per-site plan assignment, including the billing identifiers the thin
/// Stripe seam flips on webhook receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SitePlan {
    pub site_id: String,
    pub plan: Plan,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A minted upload token row. `token_hash` is the argon2id hash of the
/// bearer token the client actually holds; the plaintext is never stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadToken {
    pub id: i64,
    pub site_id: String,
    pub jti: String,
    pub token_hash: String,
    pub allowed_origin: String,
    pub sampling_rate: f64,
    pub epsilon_budget: Option<f64>,
    pub epsilon_consumed: f64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl UploadToken {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn budget_exhausted(&self) -> bool {
        match self.epsilon_budget {
            Some(budget) => self.epsilon_consumed >= budget,
            None => false,
        }
    }
}

/// Replay-defense record: one row per `jti` ever admitted by the shuffler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenNonce {
    pub jti: String,
    pub site_id: String,
    pub seen_at: DateTime<Utc>,
}

/// The per-event payload, stored as JSON at rest. Fields are a concrete,
/// typed superset of what any single kind populates rather than an opaque
/// `HashMap` — the reducer reads only the fields relevant to a report's
/// `kind`, same as the reference decoder's permissive field lookups.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomized_bit: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub historical_import: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// A clear-text (free/standard plan) report row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawReport {
    pub id: i64,
    pub site_id: String,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub epsilon_used: f64,
    pub sampling_rate: f64,
    pub event_time: DateTime<Utc>,
    pub server_received_at: DateTime<Utc>,
}

/// A randomized-response (pro plan) report row. Same shape as `RawReport`;
/// kept as a distinct table/type because mixing privatized and clear-text
/// counts in one bucket would be a privacy bug, not just a modeling one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LdpReport {
    pub id: i64,
    pub site_id: String,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub epsilon_used: f64,
    pub sampling_rate: f64,
    pub event_time: DateTime<Utc>,
    pub server_received_at: DateTime<Utc>,
}

/// One published aggregate window. `metric` is the qualified bucket name —
/// the event kind's name for everything but conversions, which are split
/// per `conversion_type` as `conversion:<type>` so each conversion funnel
/// gets its own window instead of collapsing into one `conversions` bucket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DpWindow {
    pub id: i64,
    pub site_id: String,
    pub plan: Plan,
    pub metric: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: f64,
    pub variance: f64,
    pub ci80_low: f64,
    pub ci80_high: f64,
    pub ci95_low: f64,
    pub ci95_high: f64,
    pub report_count: i64,
    pub published_at: DateTime<Utc>,
}

/// Daily cumulative privacy-budget ledger entry for a site.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteEpsilonLog {
    pub site_id: String,
    pub day: chrono::NaiveDate,
    pub plan: Plan,
    pub epsilon_total: f64,
}
