//! API Module
//!
//! Liveness endpoint served next to the controllers.

pub mod health;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

pub fn create_router() -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .layer(TraceLayer::new_for_http())
}
