//! API router.
//!
//! Combines the availability, booking and payment endpoints into one
//! centrally configured REST surface.

use axum::{routing::get, routing::post, Json, Router};
use std::sync::Arc;

use crate::shared::state::AppState;

/// Configure all API routes from all modules.
pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // ===== Availability =====
        .route("/availability", get(crate::availability::get_availability))
        // ===== Bookings =====
        .route("/bookings", post(crate::booking::api::create_booking))
        .route("/bookings/:id", get(crate::booking::api::get_booking))
        .route(
            "/bookings/:id/cancel",
            post(crate::booking::api::cancel_booking),
        )
        .route(
            "/bookings/:id/complete",
            post(crate::booking::api::complete_booking),
        )
        .route(
            "/bookings/:id/no-show",
            post(crate::booking::api::no_show_booking),
        )
        // ===== Payments =====
        .route(
            "/payments/intents",
            post(crate::payments::api::create_intent),
        )
        .route(
            "/payments/intents/confirm",
            post(crate::payments::api::confirm_intent),
        )
        .route(
            "/payments/refunds",
            post(crate::payments::api::refund_payment),
        )
        .route("/payments/:id", get(crate::payments::api::get_payment))
        .route(
            "/payments/webhooks/:provider",
            post(crate::payments::api::receive_webhook),
        )
        // ===== Operational =====
        .route("/health", get(health))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
