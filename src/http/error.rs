//! Error-to-status-code mapping for the HTTP surface.
//!
//! Every handler returns `Result<_, ApiError>`; this is the one place a
//! `thiserror` enum from a lower module becomes a status code, matching how
//! `tinyzkp_api`'s handlers return `(StatusCode, String)` rather than
//! leaking internal error types across the wire.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::billing::BillingError;
use crate::collector::CollectorError;
use crate::ratelimit::RateLimitError;
use crate::reducer::ReducerError;
use crate::shuffler::ShuffleError;
use crate::store::StoreError;
use crate::token::TokenError;

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct ApiError(pub StatusCode, pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError(StatusCode::NOT_FOUND, e.to_string()),
            StoreError::Conflict => ApiError(StatusCode::CONFLICT, e.to_string()),
            StoreError::Backend(_) => ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        let status = match e {
            TokenError::Malformed | TokenError::BadSignature => StatusCode::BAD_REQUEST,
            TokenError::NotFound => StatusCode::UNAUTHORIZED,
            TokenError::Expired => StatusCode::UNAUTHORIZED,
            TokenError::Revoked => StatusCode::UNAUTHORIZED,
            TokenError::OriginMismatch => StatusCode::FORBIDDEN,
            TokenError::BudgetExceeded => StatusCode::CONFLICT,
            TokenError::Hash(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TokenError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        ApiError(StatusCode::TOO_MANY_REQUESTS, e.to_string())
    }
}

impl From<CollectorError> for ApiError {
    fn from(e: CollectorError) -> Self {
        match e {
            CollectorError::PlanForbidden => ApiError(StatusCode::FORBIDDEN, e.to_string()),
            CollectorError::Store(_) => ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<ShuffleError> for ApiError {
    fn from(e: ShuffleError) -> Self {
        match e {
            ShuffleError::Token(inner) => inner.into(),
            ShuffleError::RateLimit(inner) => inner.into(),
            ShuffleError::Replay => ApiError(StatusCode::CONFLICT, "replayed nonce".to_string()),
            ShuffleError::Collector(inner) => inner.into(),
            ShuffleError::Store(inner) => inner.into(),
        }
    }
}

impl From<ReducerError> for ApiError {
    fn from(e: ReducerError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        let status = match e {
            BillingError::MissingSignatureHeader | BillingError::MalformedSignatureHeader => {
                StatusCode::BAD_REQUEST
            }
            BillingError::SignatureMismatch => StatusCode::BAD_REQUEST,
            BillingError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            BillingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}
