//! Booking records and their lifecycle.
//!
//! Rows are created by the overlap-safe scheduler and mutated only through
//! the state machine. Price and policy terms are flattened into the row as
//! an immutable snapshot taken at creation time.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::error::ApiError;
use crate::shared::models::schema::{booking_history, bookings};

pub mod api;
pub mod scheduler;
pub mod state_machine;
pub mod status;

pub use status::BookingStatus;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = bookings)]
pub struct Booking {
    pub id: Uuid,
    pub business_id: Uuid,
    pub service_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: String,
    pub source: String,
    pub price_amount: i64,
    pub currency: String,
    pub deposit_percent: i32,
    pub deposit_amount: i64,
    pub balance_amount: i64,
    pub policy_hours_before: i32,
    pub policy_penalty_percent: i32,
    pub metadata: serde_json::Value,
    pub reminded_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn status(&self) -> Result<BookingStatus, ApiError> {
        BookingStatus::parse(&self.status).ok_or_else(|| {
            ApiError::Internal(format!("booking {} has unknown status {}", self.id, self.status))
        })
    }

    pub fn policy_snapshot(&self) -> crate::policy::PolicySnapshot {
        crate::policy::PolicySnapshot {
            hours_before: self.policy_hours_before,
            penalty_percent: self.policy_penalty_percent,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = bookings)]
pub struct NewBooking {
    pub id: Uuid,
    pub business_id: Uuid,
    pub service_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: String,
    pub source: String,
    pub price_amount: i64,
    pub currency: String,
    pub deposit_percent: i32,
    pub deposit_amount: i64,
    pub balance_amount: i64,
    pub policy_hours_before: i32,
    pub policy_penalty_percent: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = booking_history)]
pub struct BookingHistoryEntry {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BookingHistoryEntry {
    pub fn new(
        booking_id: Uuid,
        from_status: Option<BookingStatus>,
        to_status: BookingStatus,
        actor: &str,
        note: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            from_status: from_status.map(|s| s.as_str().to_string()),
            to_status: to_status.as_str().to_string(),
            actor: actor.to_string(),
            note,
            created_at: Utc::now(),
        }
    }
}

/// Load a live (non-tombstoned) booking.
pub fn get_booking(conn: &mut PgConnection, id: Uuid) -> Result<Booking, ApiError> {
    bookings::table
        .find(id)
        .filter(bookings::deleted_at.is_null())
        .select(Booking::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("booking {id} not found")))
}

/// Load a live booking with a row lock, serializing concurrent transitions.
pub fn get_booking_for_update(conn: &mut PgConnection, id: Uuid) -> Result<Booking, ApiError> {
    bookings::table
        .find(id)
        .filter(bookings::deleted_at.is_null())
        .select(Booking::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("booking {id} not found")))
}

pub fn record_history(
    conn: &mut PgConnection,
    entry: &BookingHistoryEntry,
) -> Result<(), ApiError> {
    diesel::insert_into(booking_history::table)
        .values(entry)
        .execute(conn)?;
    Ok(())
}

pub fn history_for(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<Vec<BookingHistoryEntry>, ApiError> {
    Ok(booking_history::table
        .filter(booking_history::booking_id.eq(booking_id))
        .order(booking_history::created_at.asc())
        .select(BookingHistoryEntry::as_select())
        .load(conn)?)
}
