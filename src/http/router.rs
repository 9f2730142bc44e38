//! Router assembly: wires handlers, CORS, and request tracing the way
//! `tinyzkp_api::main()` wires its own `Router`.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::store::Store;
use crate::AppContext;

pub fn build_router<S: Store>(ctx: AppContext<S>) -> Router {
    let cors = if ctx.config.cors_allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = ctx
            .config
            .cors_allowed_origins
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-admin-token"),
            ])
            .max_age(std::time::Duration::from_secs(3600))
    };

    Router::new()
        .route("/health/liveness", get(handlers::health))
        .route("/health/readiness", get(handlers::readiness::<S>))
        .route("/upload-token", post(handlers::issue_token::<S>))
        .route("/admin/revoke-token", post(handlers::revoke_token::<S>))
        .route("/admin/revoke-tokens", post(handlers::revoke_tokens_for_site::<S>))
        .route("/admin/site-plan", post(handlers::upsert_site_plan::<S>))
        .route("/admin/run-reducer", post(handlers::run_reducer::<S>))
        .route("/shuffle", post(handlers::shuffle::<S>))
        .route("/aggregate", get(handlers::aggregate::<S>))
        .route("/stripe/webhook", post(handlers::stripe_webhook::<S>))
        .with_state(ctx)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
