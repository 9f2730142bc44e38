//! Request handlers. Each one does auth/header plumbing and delegates the
//! actual work to the module that owns it — handlers never touch the store
//! or a crypto primitive directly.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::billing;
use crate::collector::CollectEvent;
use crate::http::error::ApiError;
use crate::reducer;
use crate::shuffler;
use crate::store::{EventKind, EventPayload, Plan, SitePlan, Store};
use crate::token;
use crate::AppContext;

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))
}

fn origin_header(headers: &HeaderMap) -> &str {
    headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn source_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string()
}

fn require_admin<S: Store>(ctx: &AppContext<S>, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers.get("x-admin-token").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided != ctx.config.admin_token {
        return Err(ApiError(StatusCode::UNAUTHORIZED, "invalid admin token".to_string()));
    }
    Ok(())
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Readiness additionally checks the store is reachable.
pub async fn readiness<S: Store>(State(ctx): State<AppContext<S>>) -> StatusCode {
    match ctx.store.get_site_plan("__readiness_probe__").await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub site_id: String,
    pub allowed_origin: String,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    pub epsilon_budget: Option<f64>,
}

fn default_sampling_rate() -> f64 {
    1.0
}

#[derive(Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
    pub token_id: i64,
}

pub async fn issue_token<S: Store>(
    State(ctx): State<AppContext<S>>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, ApiError> {
    let (tok, id) = token::issue_token(
        &ctx.store,
        ctx.clock.as_ref(),
        &ctx.config.upload_token_secret,
        &req.site_id,
        &req.allowed_origin,
        req.sampling_rate,
        req.epsilon_budget,
        ctx.config.upload_token_ttl_seconds,
    )
    .await?;
    ctx.metrics.incr_tokens_issued(&req.site_id);
    Ok(Json(IssueTokenResponse { token: tok, token_id: id }))
}

#[derive(Deserialize)]
pub struct RevokeTokenRequest {
    pub token_id: i64,
}

pub async fn revoke_token<S: Store>(
    State(ctx): State<AppContext<S>>,
    headers: HeaderMap,
    Json(req): Json<RevokeTokenRequest>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx, &headers)?;
    token::revoke_token(&ctx.store, ctx.clock.as_ref(), req.token_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RevokeSiteTokensRequest {
    pub site_id: String,
}

pub async fn revoke_tokens_for_site<S: Store>(
    State(ctx): State<AppContext<S>>,
    headers: HeaderMap,
    Json(req): Json<RevokeSiteTokensRequest>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx, &headers)?;
    let count = token::revoke_tokens_for_site(&ctx.store, ctx.clock.as_ref(), &req.site_id).await?;
    ctx.metrics.incr_tokens_revoked(&req.site_id);
    tracing::info!(site_id = %req.site_id, count, "revoked site tokens");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct EventDto {
    pub kind: EventKind,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub payload: EventPayload,
    pub epsilon_used: f64,
    pub sampling_rate: f64,
    pub event_time: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct ShuffleRequest {
    pub nonce: String,
    pub events: Vec<EventDto>,
}

#[derive(Serialize)]
pub struct ShuffleResponse {
    pub accepted: usize,
    pub dropped_stale: usize,
    pub dropped_site_mismatch: usize,
    pub held_for_seconds: f64,
}

pub async fn shuffle<S: Store>(
    State(ctx): State<AppContext<S>>,
    headers: HeaderMap,
    Json(req): Json<ShuffleRequest>,
) -> Result<Json<ShuffleResponse>, ApiError> {
    let tok = bearer_token(&headers)?.to_string();
    let origin = origin_header(&headers).to_string();
    let ip = source_ip(&headers);

    let events = req
        .events
        .into_iter()
        .map(|e| CollectEvent {
            kind: e.kind,
            claimed_site_id: e.site_id,
            payload: e.payload,
            epsilon_used: e.epsilon_used,
            sampling_rate: e.sampling_rate,
            event_time: e.event_time,
        })
        .collect();

    let outcome = shuffler::shuffle_and_forward(
        &ctx.store,
        ctx.clock.as_ref(),
        &ctx.rate_limiter,
        ctx.metrics.as_ref(),
        &ctx.config.upload_token_secret,
        ctx.config.enforce_token_budget,
        ctx.config.max_out_of_order_seconds,
        ctx.config.shuffle_hold_max_seconds,
        ctx.config.upload_token_ttl_seconds * 4,
        false,
        &tok,
        &req.nonce,
        &origin,
        &ip,
        events,
    )
    .await?;

    Ok(Json(ShuffleResponse {
        accepted: outcome.summary.accepted,
        dropped_stale: outcome.summary.dropped_stale,
        dropped_site_mismatch: outcome.summary.dropped_site_mismatch,
        held_for_seconds: outcome.held_for_seconds,
    }))
}

#[derive(Deserialize)]
pub struct AggregateQuery {
    pub site_id: String,
    pub metric: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct AggregatePoint {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: f64,
    pub ci80: (f64, f64),
    pub ci95: (f64, f64),
    pub report_count: i64,
}

pub async fn aggregate<S: Store>(
    State(ctx): State<AppContext<S>>,
    Query(q): Query<AggregateQuery>,
) -> Result<Json<Vec<AggregatePoint>>, ApiError> {
    let windows = ctx.store.fetch_dp_windows(&q.site_id, &q.metric, q.start, q.end).await?;
    Ok(Json(
        windows
            .into_iter()
            .map(|w| AggregatePoint {
                window_start: w.window_start,
                window_end: w.window_end,
                value: w.value,
                ci80: (w.ci80_low, w.ci80_high),
                ci95: (w.ci95_low, w.ci95_high),
                report_count: w.report_count,
            })
            .collect(),
    ))
}

pub async fn stripe_webhook<S: Store>(
    State(ctx): State<AppContext<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let sig_header = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(StatusCode::BAD_REQUEST, "missing stripe-signature".to_string()))?;
    let payload_str = std::str::from_utf8(&body)
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, "invalid utf-8 payload".to_string()))?;

    billing::verify_webhook_signature(sig_header, payload_str, &ctx.config.stripe_webhook_secret)?;

    let payload: serde_json::Value = serde_json::from_str(payload_str)
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    if let Some(flip) = billing::parse_plan_flip(&payload)? {
        billing::apply_plan_flip(&ctx.store, ctx.clock.now(), flip).await?;
    }
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct RunReducerRequest {
    pub day: NaiveDate,
}

#[derive(Serialize)]
pub struct RunReducerResponse {
    pub windows_published: usize,
    pub windows_skipped_insufficient: usize,
    pub windows_skipped_low_snr: usize,
    pub reports_processed: usize,
}

/// Admin-triggered, on-demand reducer run. The long-running periodic loop
/// lives in `bin/reducer_once.rs`; this exists for backfills and tests.
pub async fn run_reducer<S: Store>(
    State(ctx): State<AppContext<S>>,
    headers: HeaderMap,
    Json(req): Json<RunReducerRequest>,
) -> Result<Json<RunReducerResponse>, ApiError> {
    require_admin(&ctx, &headers)?;
    let noise = ctx.noise.clone();
    let factory = move |_site: &str, _metric: &str, _window_start: DateTime<Utc>| -> Box<dyn crate::noise::NoiseSource> {
        Box::new(PassthroughNoise(noise.clone()))
    };
    let params = reducer::ReducerParams {
        min_reports_per_window: ctx.config.min_reports_per_window,
        alpha_smoothing: ctx.config.alpha_smoothing,
        snr_floor: ctx.config.snr_floor,
        aggregate_dp_epsilon: ctx.config.aggregate_dp_epsilon,
        noise_factory: &factory,
    };
    let summary = reducer::run_once(&ctx.store, ctx.clock.as_ref(), ctx.metrics.as_ref(), &params, req.day).await?;
    Ok(Json(RunReducerResponse {
        windows_published: summary.windows_published,
        windows_skipped_insufficient: summary.windows_skipped_insufficient,
        windows_skipped_low_snr: summary.windows_skipped_low_snr,
        reports_processed: summary.reports_processed,
    }))
}

struct PassthroughNoise(std::sync::Arc<dyn crate::noise::NoiseSource>);

impl crate::noise::NoiseSource for PassthroughNoise {
    fn laplace(&self, b: f64) -> f64 {
        self.0.laplace(b)
    }
}

#[derive(Deserialize)]
pub struct UpsertSitePlanRequest {
    pub site_id: String,
    pub plan: Plan,
}

pub async fn upsert_site_plan<S: Store>(
    State(ctx): State<AppContext<S>>,
    headers: HeaderMap,
    Json(req): Json<UpsertSitePlanRequest>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx, &headers)?;
    let now = ctx.clock.now();
    let existing = ctx.store.get_site_plan(&req.site_id).await?;
    let created_at = existing.as_ref().map(|p| p.created_at).unwrap_or(now);
    let stripe_customer_id = existing.as_ref().and_then(|p| p.stripe_customer_id.clone());
    let stripe_subscription_id = existing.as_ref().and_then(|p| p.stripe_subscription_id.clone());
    ctx.store
        .upsert_site_plan(SitePlan {
            site_id: req.site_id,
            plan: req.plan,
            stripe_customer_id,
            stripe_subscription_id,
            created_at,
            updated_at: now,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
