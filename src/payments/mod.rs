//! Payment records and the modules that manage them.
//!
//! One `BookingPayment` row represents one charge/refund attempt tied to a
//! booking. Rows are created by the intent manager and transitioned by the
//! webhook reconciler or by direct confirmation.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::error::ApiError;
use crate::shared::models::schema::booking_payments;

pub mod api;
pub mod gateway;
pub mod idempotency;
pub mod intent;
pub mod testing;
pub mod webhook;

/// Logical portion of a booking's total price a payment covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Deposit,
    Full,
    Balance,
    Hold,
    PayOnArrival,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Full => "full",
            Self::Balance => "balance",
            Self::Hold => "hold",
            Self::PayOnArrival => "pay_on_arrival",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(Self::Deposit),
            "full" => Some(Self::Full),
            "balance" => Some(Self::Balance),
            "hold" => Some(Self::Hold),
            "pay_on_arrival" => Some(Self::PayOnArrival),
            _ => None,
        }
    }

    /// Whether this mode moves money through the gateway at intent time.
    /// `hold` confirms like `pay_on_arrival`; its settlement semantics are
    /// owned by the gateway.
    pub fn charges_now(&self) -> bool {
        matches!(self, Self::Deposit | Self::Full | Self::Balance)
    }

    pub fn is_deposit(&self) -> bool {
        matches!(self, Self::Deposit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = booking_payments)]
pub struct BookingPayment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub provider: String,
    pub intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub mode: String,
    pub is_deposit: bool,
    pub status: String,
    pub provider_response: Option<serde_json::Value>,
    pub refunded_amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookingPayment {
    pub fn status(&self) -> Result<PaymentStatus, ApiError> {
        PaymentStatus::parse(&self.status).ok_or_else(|| {
            ApiError::Internal(format!("payment {} has unknown status {}", self.id, self.status))
        })
    }

    pub fn mode(&self) -> Result<PaymentMode, ApiError> {
        PaymentMode::parse(&self.mode).ok_or_else(|| {
            ApiError::Internal(format!("payment {} has unknown mode {}", self.id, self.mode))
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = booking_payments)]
pub struct NewBookingPayment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub provider: String,
    pub intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub mode: String,
    pub is_deposit: bool,
    pub status: String,
    pub provider_response: Option<serde_json::Value>,
    pub refunded_amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn get_payment(conn: &mut PgConnection, id: Uuid) -> Result<BookingPayment, ApiError> {
    booking_payments::table
        .find(id)
        .select(BookingPayment::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("payment {id} not found")))
}

/// Locate a payment by the provider-side intent or charge identifier.
pub fn find_by_provider_ref(
    conn: &mut PgConnection,
    provider: &str,
    reference: &str,
) -> Result<Option<BookingPayment>, ApiError> {
    Ok(booking_payments::table
        .filter(booking_payments::provider.eq(provider))
        .filter(
            booking_payments::intent_id
                .eq(reference)
                .or(booking_payments::charge_id.eq(reference)),
        )
        .select(BookingPayment::as_select())
        .first(conn)
        .optional()?)
}

pub fn payments_for_booking(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<Vec<BookingPayment>, ApiError> {
    Ok(booking_payments::table
        .filter(booking_payments::booking_id.eq(booking_id))
        .order(booking_payments::created_at.asc())
        .select(BookingPayment::as_select())
        .load(conn)?)
}

/// Whether any payment on the booking has succeeded (and not been refunded).
pub fn has_succeeded_payment(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<bool, ApiError> {
    let count: i64 = booking_payments::table
        .filter(booking_payments::booking_id.eq(booking_id))
        .filter(booking_payments::status.eq(PaymentStatus::Succeeded.as_str()))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// The succeeded deposit/full payment money can be returned from on a
/// policy-driven cancellation, if any.
pub fn refundable_payment(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<Option<BookingPayment>, ApiError> {
    Ok(booking_payments::table
        .filter(booking_payments::booking_id.eq(booking_id))
        .filter(booking_payments::status.eq(PaymentStatus::Succeeded.as_str()))
        .filter(
            booking_payments::mode
                .eq(PaymentMode::Deposit.as_str())
                .or(booking_payments::mode.eq(PaymentMode::Full.as_str())),
        )
        .order(booking_payments::created_at.asc())
        .select(BookingPayment::as_select())
        .first(conn)
        .optional()?)
}

/// A live payment (pending or succeeded) already covering the given leg.
pub fn open_payment_for_leg(
    conn: &mut PgConnection,
    booking_id: Uuid,
    mode: PaymentMode,
) -> Result<Option<BookingPayment>, ApiError> {
    Ok(booking_payments::table
        .filter(booking_payments::booking_id.eq(booking_id))
        .filter(booking_payments::mode.eq(mode.as_str()))
        .filter(
            booking_payments::status
                .eq(PaymentStatus::Pending.as_str())
                .or(booking_payments::status.eq(PaymentStatus::Succeeded.as_str())),
        )
        .select(BookingPayment::as_select())
        .first(conn)
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trip() {
        for mode in [
            PaymentMode::Deposit,
            PaymentMode::Full,
            PaymentMode::Balance,
            PaymentMode::Hold,
            PaymentMode::PayOnArrival,
        ] {
            assert_eq!(PaymentMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(PaymentMode::parse("gift_card"), None);
    }

    #[test]
    fn hold_and_pay_on_arrival_do_not_charge() {
        assert!(PaymentMode::Deposit.charges_now());
        assert!(PaymentMode::Full.charges_now());
        assert!(PaymentMode::Balance.charges_now());
        assert!(!PaymentMode::Hold.charges_now());
        assert!(!PaymentMode::PayOnArrival.charges_now());
    }
}
