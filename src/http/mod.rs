//! HTTP surface: axum router, handlers, and error-to-status mapping.

pub mod error;
pub mod handlers;
pub mod router;

pub use router::build_router;
