//! Booking HTTP surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::booking::scheduler::{self, CreateBookingRequest};
use crate::booking::{self, state_machine, Booking, BookingHistoryEntry};
use crate::catalog;
use crate::notify::Notification;
use crate::payments::{self, intent, BookingPayment};
use crate::shared::actor::Actor;
use crate::shared::error::ApiError;
use crate::shared::state::AppState;

#[derive(Debug, Serialize)]
pub struct BookingDetailResponse {
    pub booking: Booking,
    pub payments: Vec<BookingPayment>,
    pub history: Vec<BookingHistoryEntry>,
    /// Whether a required deposit is past its grace period and still unpaid.
    pub deposit_due: bool,
}

pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<Booking>), ApiError> {
    let mut conn = state.conn.get()?;
    let booking = scheduler::create_booking(&mut conn, &request)?;
    Ok((StatusCode::CREATED, Json(booking)))
}

pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingDetailResponse>, ApiError> {
    let mut conn = state.conn.get()?;
    let booking = booking::get_booking(&mut conn, booking_id)?;
    let payments = payments::payments_for_booking(&mut conn, booking_id)?;
    let history = booking::history_for(&mut conn, booking_id)?;

    let has_paid_deposit_leg = payments
        .iter()
        .any(|p| p.status == "succeeded" && (p.mode == "deposit" || p.mode == "full"));
    let deposit_due = match booking.service_id {
        Some(service_id) if booking.deposit_amount > 0 => {
            match catalog::get_active_service(&mut conn, service_id) {
                Ok(service) => crate::policy::deposit_is_due(
                    booking.created_at,
                    service.deposit_due_hours,
                    has_paid_deposit_leg,
                    Utc::now(),
                ),
                // A since-retired service leaves no enforceable grace period.
                Err(ApiError::NotFound(_)) => false,
                Err(err) => return Err(err),
            }
        }
        _ => false,
    };

    Ok(Json(BookingDetailResponse {
        booking,
        payments,
        history,
        deposit_due,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelBookingRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelBookingResponse {
    pub booking: Booking,
    pub penalty_applied: bool,
    pub forfeited: i64,
    pub refundable: i64,
    /// False when no refund was owed or the provider call must be retried.
    pub refund_issued: bool,
}

/// Cancel a booking. The transition and its forfeiture split commit first;
/// the gateway refund runs afterwards so a provider outage can never hold
/// the booking row hostage.
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    actor: Actor,
    Json(request): Json<CancelBookingRequest>,
) -> Result<Json<CancelBookingResponse>, ApiError> {
    let outcome = {
        let mut conn = state.conn.get()?;
        state_machine::cancel(
            &mut conn,
            booking_id,
            &actor.label(),
            request.reason,
            Utc::now(),
        )?
    };

    let mut refund_issued = false;
    if let Some(payment) = &outcome.refund_target {
        if outcome.refundable > 0 {
            match intent::cancellation_refund(&state, booking_id, payment, outcome.refundable).await
            {
                Ok(()) => refund_issued = true,
                Err(err) => {
                    // The cancellation stands; the refund is keyed by booking
                    // id and safe to re-drive manually.
                    tracing::error!(
                        %booking_id,
                        "cancellation refund failed, needs retry: {err}"
                    );
                }
            }
        }
    }

    state.notifications.enqueue(Notification::BookingCancelled {
        booking_id,
        forfeited: outcome.forfeited,
        refunded: if refund_issued { outcome.refundable } else { 0 },
    });

    Ok(Json(CancelBookingResponse {
        booking: outcome.booking,
        penalty_applied: outcome.penalty_applied,
        forfeited: outcome.forfeited,
        refundable: outcome.refundable,
        refund_issued,
    }))
}

pub async fn complete_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<Booking>, ApiError> {
    actor.require_manage()?;
    let mut conn = state.conn.get()?;
    let booking = state_machine::complete(&mut conn, booking_id, &actor.label())?;
    Ok(Json(booking))
}

pub async fn no_show_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<Booking>, ApiError> {
    actor.require_manage()?;
    let mut conn = state.conn.get()?;
    let booking = state_machine::no_show(&mut conn, booking_id, &actor.label())?;
    Ok(Json(booking))
}
