//! Booking state machine.
//!
//! Every transition runs inside one transaction together with its side
//! effects (status write, history record, forfeiture computation), holding
//! a row lock on the booking so no two transitions interleave. A transition
//! out of a terminal state is a `Conflict`; one missing from the table is a
//! `BadRequest`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::booking::{
    get_booking_for_update, record_history, Booking, BookingHistoryEntry, BookingStatus,
};
use crate::payments::{self, BookingPayment};
use crate::policy;
use crate::shared::error::ApiError;
use crate::shared::models::schema::bookings;

pub fn allowed(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, PendingPayment)
            | (Pending, Confirmed)
            | (Pending, Cancelled)
            | (Pending, Expired)
            | (PendingPayment, Confirmed)
            | (PendingPayment, Cancelled)
            | (PendingPayment, Expired)
            | (Confirmed, Completed)
            | (Confirmed, NoShow)
            | (Confirmed, Cancelled)
    )
}

fn check_transition(from: BookingStatus, to: BookingStatus) -> Result<(), ApiError> {
    if from.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "booking is already {from} and cannot transition further"
        )));
    }
    if !allowed(from, to) {
        return Err(ApiError::BadRequest(format!(
            "invalid booking transition {from} -> {to}"
        )));
    }
    Ok(())
}

/// Apply a checked transition to an already-locked booking row.
pub(crate) fn transition_locked(
    conn: &mut PgConnection,
    booking: &Booking,
    to: BookingStatus,
    actor: &str,
    note: Option<String>,
) -> Result<Booking, ApiError> {
    let from = booking.status()?;
    check_transition(from, to)?;

    let updated: Booking = diesel::update(bookings::table.find(booking.id))
        .set((
            bookings::status.eq(to.as_str()),
            bookings::updated_at.eq(Utc::now()),
        ))
        .returning(Booking::as_returning())
        .get_result(conn)?;
    record_history(
        conn,
        &BookingHistoryEntry::new(booking.id, Some(from), to, actor, note),
    )?;
    Ok(updated)
}

fn transition(
    conn: &mut PgConnection,
    booking_id: Uuid,
    to: BookingStatus,
    actor: &str,
    note: Option<String>,
) -> Result<Booking, ApiError> {
    conn.transaction::<Booking, ApiError, _>(|conn| {
        let booking = get_booking_for_update(conn, booking_id)?;
        transition_locked(conn, &booking, to, actor, note)
    })
}

/// Confirm a booking after a succeeded full/deposit payment, or explicitly
/// for pay-on-arrival/hold modes. Confirming an already-confirmed booking
/// is a no-op so webhook replays stay idempotent.
pub fn confirm(
    conn: &mut PgConnection,
    booking_id: Uuid,
    actor: &str,
    note: Option<String>,
) -> Result<Booking, ApiError> {
    conn.transaction::<Booking, ApiError, _>(|conn| {
        let booking = get_booking_for_update(conn, booking_id)?;
        if booking.status()? == BookingStatus::Confirmed {
            return Ok(booking);
        }
        transition_locked(conn, &booking, BookingStatus::Confirmed, actor, note)
    })
}

/// Move a `PENDING` booking into `PENDING_PAYMENT` when the first payment
/// intent is opened. No-op if it is already awaiting payment.
pub(crate) fn mark_pending_payment(
    conn: &mut PgConnection,
    booking: &Booking,
    actor: &str,
) -> Result<Booking, ApiError> {
    match booking.status()? {
        BookingStatus::PendingPayment => Ok(booking.clone()),
        _ => transition_locked(conn, booking, BookingStatus::PendingPayment, actor, None),
    }
}

/// Staff action after the booking's end time has passed.
pub fn complete(conn: &mut PgConnection, booking_id: Uuid, actor: &str) -> Result<Booking, ApiError> {
    close_out(conn, booking_id, BookingStatus::Completed, actor)
}

pub fn no_show(conn: &mut PgConnection, booking_id: Uuid, actor: &str) -> Result<Booking, ApiError> {
    close_out(conn, booking_id, BookingStatus::NoShow, actor)
}

fn close_out(
    conn: &mut PgConnection,
    booking_id: Uuid,
    to: BookingStatus,
    actor: &str,
) -> Result<Booking, ApiError> {
    conn.transaction::<Booking, ApiError, _>(|conn| {
        let booking = get_booking_for_update(conn, booking_id)?;
        if booking.end_at > Utc::now() {
            return Err(ApiError::BadRequest(format!(
                "booking cannot be marked {to} before its end time"
            )));
        }
        transition_locked(conn, &booking, to, actor, None)
    })
}

#[derive(Debug)]
pub struct CancellationOutcome {
    pub booking: Booking,
    pub penalty_applied: bool,
    pub forfeited: i64,
    pub refundable: i64,
    /// The succeeded payment money should be returned from, if any.
    pub refund_target: Option<BookingPayment>,
}

/// Cancel a booking, deriving the forfeiture split from the snapshotted
/// policy. The split is computed and recorded inside the transition
/// transaction; the actual gateway refund runs after commit.
pub fn cancel(
    conn: &mut PgConnection,
    booking_id: Uuid,
    actor: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<CancellationOutcome, ApiError> {
    conn.transaction::<CancellationOutcome, ApiError, _>(|conn| {
        let booking = get_booking_for_update(conn, booking_id)?;
        check_transition(booking.status()?, BookingStatus::Cancelled)?;

        let refund_target = payments::refundable_payment(conn, booking_id)?;
        let penalty_applied = refund_target.is_some()
            && policy::penalty_applies(&booking.policy_snapshot(), booking.start_at, now);
        let split = if penalty_applied {
            policy::forfeiture_split(booking.deposit_amount, booking.policy_penalty_percent)
        } else {
            policy::forfeiture_split(booking.deposit_amount, 0)
        };
        let (forfeited, refundable) = match &refund_target {
            // The snapshotted deposit is the at-risk portion; anything paid
            // beyond it comes back in full.
            Some(payment) => (split.forfeited, (payment.amount - split.forfeited).max(0)),
            None => (0, 0),
        };

        let mut note = format!("forfeited={forfeited} refundable={refundable}");
        if let Some(reason) = reason {
            note = format!("{reason}; {note}");
        }
        let booking = transition_locked(
            conn,
            &booking,
            BookingStatus::Cancelled,
            actor,
            Some(note),
        )?;

        Ok(CancellationOutcome {
            booking,
            penalty_applied,
            forfeited,
            refundable,
            refund_target,
        })
    })
}
