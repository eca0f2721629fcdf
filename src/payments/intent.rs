//! Idempotent payment-intent operations.
//!
//! Every mutating operation is wrapped in idempotency check-then-act: a
//! completed key replays the cached response, an in-flight key fails with
//! `Conflict`, and a definitive provider failure releases the key so the
//! caller can retry. On a timeout the key stays locked until its TTL
//! lapses; the provider outcome is unknown and re-charging would risk
//! double payment.

use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::{state_machine, BookingStatus};
use crate::notify::Notification;
use crate::payments::gateway::{ChargeRequest, ChargeState, GatewayError};
use crate::payments::idempotency::{self, Begin};
use crate::payments::{
    self, BookingPayment, NewBookingPayment, PaymentMode, PaymentStatus,
};
use crate::shared::error::ApiError;
use crate::shared::models::schema::booking_payments;
use crate::shared::state::AppState;

const SCOPE_CREATE_INTENT: &str = "payments.create_intent";
const SCOPE_CONFIRM: &str = "payments.confirm";
const SCOPE_REFUND: &str = "payments.refund";
const SCOPE_CANCEL_REFUND: &str = "payments.cancel_refund";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    pub booking_id: Uuid,
    pub provider: String,
    pub mode: PaymentMode,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntentResponse {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub provider: String,
    pub intent_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub mode: PaymentMode,
    pub status: PaymentStatus,
    pub booking_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub provider: String,
    pub intent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub status: PaymentStatus,
    pub booking_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResponse {
    pub payment_id: Uuid,
    pub refunded_now: i64,
    pub total_refunded: i64,
    pub status: PaymentStatus,
}

/// Whether a failed operation should free its idempotency key for retry.
/// Timeouts keep the lock: the provider outcome is unknown.
enum KeyDisposition {
    Release,
    Keep,
}

fn classify_gateway_error(err: &GatewayError) -> KeyDisposition {
    match err {
        GatewayError::Timeout => KeyDisposition::Keep,
        _ => KeyDisposition::Release,
    }
}

/// Failure of a staged refund. The gateway error is kept as a variant so
/// the key disposition is decided on it, not on stringified messages.
enum RefundFailure {
    Gateway(GatewayError),
    Other(ApiError),
}

impl RefundFailure {
    fn disposition(&self) -> KeyDisposition {
        match self {
            Self::Gateway(err) => classify_gateway_error(err),
            Self::Other(_) => KeyDisposition::Release,
        }
    }
}

impl From<GatewayError> for RefundFailure {
    fn from(err: GatewayError) -> Self {
        Self::Gateway(err)
    }
}

impl From<ApiError> for RefundFailure {
    fn from(err: ApiError) -> Self {
        Self::Other(err)
    }
}

impl From<diesel::result::Error> for RefundFailure {
    fn from(err: diesel::result::Error) -> Self {
        Self::Other(err.into())
    }
}

impl From<r2d2::Error> for RefundFailure {
    fn from(err: r2d2::Error) -> Self {
        Self::Other(err.into())
    }
}

impl From<RefundFailure> for ApiError {
    fn from(failure: RefundFailure) -> Self {
        match failure {
            RefundFailure::Gateway(err) => err.into(),
            RefundFailure::Other(err) => err,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(format!("serialization: {e}")))
}

fn from_json<T: for<'de> Deserialize<'de>>(value: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::Internal(format!("cached response corrupt: {e}")))
}

fn charge_state_to_status(state: ChargeState) -> PaymentStatus {
    match state {
        ChargeState::Succeeded => PaymentStatus::Succeeded,
        ChargeState::Failed => PaymentStatus::Failed,
        ChargeState::Pending => PaymentStatus::Pending,
    }
}

fn expected_amount(
    booking: &crate::booking::Booking,
    mode: PaymentMode,
) -> Result<i64, ApiError> {
    let expected = match mode {
        PaymentMode::Deposit => {
            if booking.deposit_amount <= 0 {
                return Err(ApiError::BadRequest(
                    "this booking requires no deposit".to_string(),
                ));
            }
            booking.deposit_amount
        }
        PaymentMode::Full => booking.price_amount,
        PaymentMode::Balance => booking.balance_amount,
        PaymentMode::Hold | PaymentMode::PayOnArrival => 0,
    };
    Ok(expected)
}

/// Create a payment intent for a booking leg. Exactly one provider call is
/// made per distinct request body regardless of how many callers race.
pub async fn create_intent(
    state: &AppState,
    request: &CreateIntentRequest,
) -> Result<PaymentIntentResponse, ApiError> {
    // Resolving the gateway up front keeps bad provider names from ever
    // claiming a key or touching booking rows.
    let gateway = state.gateways.get(&request.provider)?;
    let hash = idempotency::request_hash(SCOPE_CREATE_INTENT, &to_json(request)?);
    let ttl = idempotency::ttl_from_hours(state.config.payments.idempotency_ttl_hours);

    let key_id = {
        let mut conn = state.conn.get()?;
        match idempotency::begin(&mut conn, SCOPE_CREATE_INTENT, &hash, ttl)? {
            Begin::Completed(cached) => return from_json(cached),
            Begin::Fresh(key_id) => key_id,
        }
    };

    // Validate and stage the payment row before calling out.
    let staged = {
        let mut conn = state.conn.get()?;
        conn.transaction::<(crate::booking::Booking, BookingPayment), ApiError, _>(|conn| {
            let booking = crate::booking::get_booking_for_update(conn, request.booking_id)?;
            let status = booking.status()?;
            if !matches!(status, BookingStatus::Pending | BookingStatus::PendingPayment) {
                return Err(ApiError::BadRequest(format!(
                    "booking is {status} and cannot open a payment intent"
                )));
            }
            let expected = expected_amount(&booking, request.mode)?;
            if request.amount != expected {
                return Err(ApiError::BadRequest(format!(
                    "amount {} does not match the snapshotted {} amount {}",
                    request.amount,
                    request.mode.as_str(),
                    expected
                )));
            }
            if let Some(existing) = payments::open_payment_for_leg(conn, booking.id, request.mode)? {
                return Err(ApiError::Conflict(format!(
                    "a {} payment is already {} for this booking",
                    request.mode.as_str(),
                    existing.status
                )));
            }

            let booking = if request.mode.charges_now() {
                state_machine::mark_pending_payment(conn, &booking, "payments")?
            } else {
                booking
            };

            let now = Utc::now();
            let payment: BookingPayment = diesel::insert_into(booking_payments::table)
                .values(&NewBookingPayment {
                    id: Uuid::new_v4(),
                    booking_id: booking.id,
                    provider: request.provider.clone(),
                    intent_id: None,
                    charge_id: None,
                    amount: request.amount,
                    currency: booking.currency.clone(),
                    mode: request.mode.as_str().to_string(),
                    is_deposit: request.mode.is_deposit(),
                    status: PaymentStatus::Pending.as_str().to_string(),
                    provider_response: None,
                    refunded_amount: 0,
                    created_at: now,
                    updated_at: now,
                })
                .returning(BookingPayment::as_returning())
                .get_result(conn)?;
            Ok((booking, payment))
        })
    };
    let (booking, payment) = match staged {
        Ok(staged) => staged,
        Err(err) => {
            let mut conn = state.conn.get()?;
            idempotency::release(&mut conn, key_id)?;
            return Err(err);
        }
    };

    // Pay-on-arrival and hold modes confirm without moving money.
    if !request.mode.charges_now() {
        let mut conn = state.conn.get()?;
        let booking =
            state_machine::confirm(&mut conn, booking.id, "payments", Some("no upfront charge".to_string()))?;
        let response = PaymentIntentResponse {
            payment_id: payment.id,
            booking_id: booking.id,
            provider: payment.provider.clone(),
            intent_id: None,
            amount: payment.amount,
            currency: payment.currency.clone(),
            mode: request.mode,
            status: PaymentStatus::Pending,
            booking_status: booking.status.clone(),
        };
        idempotency::complete(&mut conn, key_id, &to_json(&response)?)?;
        state
            .notifications
            .enqueue(Notification::BookingConfirmed { booking_id: booking.id });
        return Ok(response);
    }

    let outcome = gateway
        .create_charge(&ChargeRequest {
            reference: payment.id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            description: format!("booking {}", booking.id),
        })
        .await;

    match outcome {
        Ok(charge) => {
            let status = charge_state_to_status(charge.state);
            let mut conn = state.conn.get()?;
            let response = conn.transaction::<PaymentIntentResponse, ApiError, _>(|conn| {
                diesel::update(booking_payments::table.find(payment.id))
                    .set((
                        booking_payments::intent_id.eq(Some(charge.intent_id.clone())),
                        booking_payments::charge_id.eq(charge.charge_id.clone()),
                        booking_payments::status.eq(status.as_str()),
                        booking_payments::provider_response.eq(Some(charge.raw.clone())),
                        booking_payments::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                let booking = if status == PaymentStatus::Succeeded {
                    state_machine::confirm(
                        conn,
                        booking.id,
                        "payments",
                        Some(format!("{} payment succeeded", request.mode.as_str())),
                    )?
                } else {
                    crate::booking::get_booking(conn, booking.id)?
                };
                let response = PaymentIntentResponse {
                    payment_id: payment.id,
                    booking_id: booking.id,
                    provider: payment.provider.clone(),
                    intent_id: Some(charge.intent_id.clone()),
                    amount: payment.amount,
                    currency: payment.currency.clone(),
                    mode: request.mode,
                    status,
                    booking_status: booking.status.clone(),
                };
                idempotency::complete(conn, key_id, &to_json(&response)?)?;
                Ok(response)
            })?;
            if response.status == PaymentStatus::Succeeded {
                state
                    .notifications
                    .enqueue(Notification::BookingConfirmed { booking_id: booking.id });
            }
            Ok(response)
        }
        Err(err) => {
            let mut conn = state.conn.get()?;
            match classify_gateway_error(&err) {
                KeyDisposition::Release => {
                    diesel::update(booking_payments::table.find(payment.id))
                        .set((
                            booking_payments::status.eq(PaymentStatus::Failed.as_str()),
                            booking_payments::updated_at.eq(Utc::now()),
                        ))
                        .execute(&mut conn)?;
                    idempotency::release(&mut conn, key_id)?;
                    state.notifications.enqueue(Notification::PaymentFailed {
                        booking_id: booking.id,
                        payment_id: payment.id,
                    });
                }
                KeyDisposition::Keep => {
                    tracing::warn!(
                        payment_id = %payment.id,
                        "provider call timed out; key stays locked until TTL"
                    );
                }
            }
            Err(err.into())
        }
    }
}

/// Confirm an intent after the client reports completion. The charge state
/// is re-verified with the provider; the client is never trusted.
pub async fn confirm(
    state: &AppState,
    request: &ConfirmRequest,
) -> Result<ConfirmResponse, ApiError> {
    let gateway = state.gateways.get(&request.provider)?;
    let hash = idempotency::request_hash(SCOPE_CONFIRM, &to_json(request)?);
    let ttl = idempotency::ttl_from_hours(state.config.payments.idempotency_ttl_hours);

    let (key_id, payment) = {
        let mut conn = state.conn.get()?;
        let key_id = match idempotency::begin(&mut conn, SCOPE_CONFIRM, &hash, ttl)? {
            Begin::Completed(cached) => return from_json(cached),
            Begin::Fresh(key_id) => key_id,
        };
        let payment =
            match payments::find_by_provider_ref(&mut conn, &request.provider, &request.intent_id)? {
                Some(payment) => payment,
                None => {
                    idempotency::release(&mut conn, key_id)?;
                    return Err(ApiError::NotFound(format!(
                        "no payment for intent {}",
                        request.intent_id
                    )));
                }
            };
        (key_id, payment)
    };

    let verified = gateway.verify(&request.intent_id).await;
    let charge = match verified {
        Ok(charge) => charge,
        Err(err) => {
            let mut conn = state.conn.get()?;
            if matches!(classify_gateway_error(&err), KeyDisposition::Release) {
                idempotency::release(&mut conn, key_id)?;
            }
            return Err(err.into());
        }
    };
    if charge.state != ChargeState::Succeeded {
        let mut conn = state.conn.get()?;
        idempotency::release(&mut conn, key_id)?;
        return Err(ApiError::BadRequest(
            "the provider does not report this charge as succeeded".to_string(),
        ));
    }

    let mut conn = state.conn.get()?;
    // The provider keeps reporting the charge as succeeded even after a
    // refund, so the row's own status decides: pending settles, succeeded
    // replays, anything else never moves backwards.
    match payment.status()? {
        PaymentStatus::Pending => {}
        PaymentStatus::Succeeded => {
            let booking = crate::booking::get_booking(&mut conn, payment.booking_id)?;
            let response = ConfirmResponse {
                payment_id: payment.id,
                booking_id: booking.id,
                status: PaymentStatus::Succeeded,
                booking_status: booking.status.clone(),
            };
            idempotency::complete(&mut conn, key_id, &to_json(&response)?)?;
            return Ok(response);
        }
        PaymentStatus::Refunded | PaymentStatus::Failed => {
            idempotency::release(&mut conn, key_id)?;
            return Err(ApiError::Conflict(format!(
                "payment is {} and cannot be confirmed",
                payment.status
            )));
        }
    }
    let response = conn.transaction::<ConfirmResponse, ApiError, _>(|conn| {
        diesel::update(booking_payments::table.find(payment.id))
            .set((
                booking_payments::status.eq(PaymentStatus::Succeeded.as_str()),
                booking_payments::charge_id.eq(charge.charge_id.clone()),
                booking_payments::provider_response.eq(Some(charge.raw.clone())),
                booking_payments::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;
        let booking = state_machine::confirm(
            conn,
            payment.booking_id,
            "payments",
            Some("payment confirmed with provider".to_string()),
        )?;
        let response = ConfirmResponse {
            payment_id: payment.id,
            booking_id: booking.id,
            status: PaymentStatus::Succeeded,
            booking_status: booking.status.clone(),
        };
        idempotency::complete(conn, key_id, &to_json(&response)?)?;
        Ok(response)
    })?;
    state.notifications.enqueue(Notification::BookingConfirmed {
        booking_id: response.booking_id,
    });
    Ok(response)
}

/// Refund up to the unrefunded remainder of a succeeded payment.
pub async fn refund(
    state: &AppState,
    request: &RefundRequest,
) -> Result<RefundResponse, ApiError> {
    let hash = idempotency::request_hash(SCOPE_REFUND, &to_json(request)?);
    let ttl = idempotency::ttl_from_hours(state.config.payments.idempotency_ttl_hours);

    let (key_id, payment, amount) = {
        let mut conn = state.conn.get()?;
        let key_id = match idempotency::begin(&mut conn, SCOPE_REFUND, &hash, ttl)? {
            Begin::Completed(cached) => return from_json(cached),
            Begin::Fresh(key_id) => key_id,
        };
        let staged = stage_refund(&mut conn, request.payment_id, request.amount);
        match staged {
            Ok((payment, amount)) => (key_id, payment, amount),
            Err(err) => {
                idempotency::release(&mut conn, key_id)?;
                return Err(err);
            }
        }
    };

    match execute_gateway_refund(state, &payment, amount).await {
        Ok(updated) => {
            let mut conn = state.conn.get()?;
            let response = RefundResponse {
                payment_id: updated.id,
                refunded_now: amount,
                total_refunded: updated.refunded_amount,
                status: updated.status()?,
            };
            idempotency::complete(&mut conn, key_id, &to_json(&response)?)?;
            Ok(response)
        }
        Err(failure) => {
            match failure.disposition() {
                KeyDisposition::Release => {
                    let mut conn = state.conn.get()?;
                    idempotency::release(&mut conn, key_id)?;
                }
                KeyDisposition::Keep => {
                    tracing::warn!(
                        payment_id = %payment.id,
                        "refund call timed out; key stays locked until TTL"
                    );
                }
            }
            Err(failure.into())
        }
    }
}

fn stage_refund(
    conn: &mut PgConnection,
    payment_id: Uuid,
    requested: Option<i64>,
) -> Result<(BookingPayment, i64), ApiError> {
    let payment = payments::get_payment(conn, payment_id)?;
    let status = payment.status()?;
    if !matches!(status, PaymentStatus::Succeeded) {
        return Err(ApiError::BadRequest(format!(
            "only succeeded payments can be refunded; payment is {}",
            payment.status
        )));
    }
    let remaining = payment.amount - payment.refunded_amount;
    let amount = requested.unwrap_or(remaining);
    if amount <= 0 || amount > remaining {
        return Err(ApiError::BadRequest(format!(
            "refund amount must be between 1 and {remaining}"
        )));
    }
    Ok((payment, amount))
}

/// Run the provider refund and apply it to the payment row. Shared by the
/// refund operation and the cancellation flow.
async fn execute_gateway_refund(
    state: &AppState,
    payment: &BookingPayment,
    amount: i64,
) -> Result<BookingPayment, RefundFailure> {
    let gateway = state.gateways.get(&payment.provider)?;
    let reference = payment
        .charge_id
        .as_deref()
        .or(payment.intent_id.as_deref())
        .ok_or_else(|| {
            ApiError::BadRequest("payment has no provider reference to refund".to_string())
        })?;
    let outcome = gateway.refund(reference, amount).await?;

    let mut conn = state.conn.get()?;
    let total_refunded = payment.refunded_amount + outcome.amount;
    let new_status = if total_refunded >= payment.amount {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::Succeeded
    };
    let updated: BookingPayment = diesel::update(booking_payments::table.find(payment.id))
        .set((
            booking_payments::refunded_amount.eq(total_refunded),
            booking_payments::status.eq(new_status.as_str()),
            booking_payments::updated_at.eq(Utc::now()),
        ))
        .returning(BookingPayment::as_returning())
        .get_result(&mut conn)?;
    Ok(updated)
}

/// Policy-driven refund issued by a cancellation. Keyed by booking id so a
/// retried cancel never refunds twice.
pub async fn cancellation_refund(
    state: &AppState,
    booking_id: Uuid,
    payment: &BookingPayment,
    amount: i64,
) -> Result<(), ApiError> {
    if amount <= 0 {
        return Ok(());
    }
    let body = serde_json::json!({ "booking_id": booking_id });
    let hash = idempotency::request_hash(SCOPE_CANCEL_REFUND, &body);
    let ttl = idempotency::ttl_from_hours(state.config.payments.idempotency_ttl_hours);

    let key_id = {
        let mut conn = state.conn.get()?;
        match idempotency::begin(&mut conn, SCOPE_CANCEL_REFUND, &hash, ttl)? {
            Begin::Completed(_) => return Ok(()),
            Begin::Fresh(key_id) => key_id,
        }
    };

    match execute_gateway_refund(state, payment, amount).await {
        Ok(updated) => {
            let mut conn = state.conn.get()?;
            idempotency::complete(
                &mut conn,
                key_id,
                &serde_json::json!({ "refunded": amount, "payment_id": updated.id }),
            )?;
            Ok(())
        }
        Err(failure) => {
            if matches!(failure.disposition(), KeyDisposition::Release) {
                let mut conn = state.conn.get()?;
                idempotency::release(&mut conn, key_id)?;
            }
            Err(failure.into())
        }
    }
}
