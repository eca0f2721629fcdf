//! Payment HTTP surface.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::payments::intent::{
    self, ConfirmRequest, ConfirmResponse, CreateIntentRequest, PaymentIntentResponse,
    RefundRequest, RefundResponse,
};
use crate::payments::webhook::{self, Receipt};
use crate::payments::{self, BookingPayment};
use crate::shared::actor::Actor;
use crate::shared::error::ApiError;
use crate::shared::state::AppState;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn create_intent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateIntentRequest>,
) -> Result<(StatusCode, Json<PaymentIntentResponse>), ApiError> {
    let response = intent::create_intent(&state, &request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn confirm_intent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let response = intent::confirm(&state, &request).await?;
    Ok(Json(response))
}

pub async fn refund_payment(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(request): Json<RefundRequest>,
) -> Result<Json<RefundResponse>, ApiError> {
    actor.require_refund()?;
    let response = intent::refund(&state, &request).await?;
    Ok(Json(response))
}

pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<BookingPayment>, ApiError> {
    let mut conn = state.conn.get()?;
    Ok(Json(payments::get_payment(&mut conn, payment_id)?))
}

#[derive(Debug, Serialize)]
pub struct WebhookReceipt {
    pub received: bool,
    pub duplicate: bool,
}

/// Provider webhook intake. The raw body is verified against the provider's
/// shared secret before anything is parsed or persisted.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReceipt>, ApiError> {
    let provider_config = state
        .config
        .provider(&provider)
        .ok_or_else(|| ApiError::NotFound(format!("unknown webhook provider '{provider}'")))?;
    if provider_config.webhook_secret.is_empty() {
        return Err(ApiError::Unauthorized(format!(
            "provider '{provider}' has no webhook secret configured"
        )));
    }
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::Unauthorized(format!("missing {SIGNATURE_HEADER} header"))
        })?;

    let mut conn = state.conn.get()?;
    let receipt = webhook::receive(
        &mut conn,
        &state.webhooks,
        &provider_config.webhook_secret,
        &provider,
        signature,
        &body,
        Utc::now(),
    )?;
    Ok(Json(WebhookReceipt {
        received: true,
        duplicate: receipt == Receipt::Duplicate,
    }))
}
