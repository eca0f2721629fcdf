//! Overlap-safe booking creation.
//!
//! Two-layer defense: an application-level pre-check against existing
//! bookings gives callers a fast, friendly `Conflict`, and the database
//! exclusion constraint on `(resource_id, tstzrange(start_at, end_at))` is
//! the final authority under concurrency. A constraint violation is
//! translated into the same `Conflict` the pre-check would have produced.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::availability;
use crate::booking::{record_history, Booking, BookingHistoryEntry, BookingStatus, NewBooking};
use crate::catalog;
use crate::policy;
use crate::shared::error::ApiError;
use crate::shared::models::schema::bookings;

/// Name of the exclusion constraint created in the migrations.
const OVERLAP_CONSTRAINT: &str = "bookings_resource_no_overlap";

const SLOT_TAKEN: &str = "the requested time slot is no longer available";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingRequest {
    pub business_id: Uuid,
    pub service_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    /// Derived from the service duration when absent.
    pub end_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Fast pre-check: does any live booking on the resource overlap the
/// requested range, expanded by the service buffers? Racy by nature; the
/// exclusion constraint has the last word.
pub fn range_is_taken(
    conn: &mut PgConnection,
    resource_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    buffer_before_minutes: i32,
    buffer_after_minutes: i32,
) -> Result<bool, ApiError> {
    let start = start_at - Duration::minutes(i64::from(buffer_before_minutes.max(0)));
    let end = end_at + Duration::minutes(i64::from(buffer_after_minutes.max(0)));
    let blocking: Vec<String> = BookingStatus::blocking()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    let count: i64 = bookings::table
        .filter(bookings::resource_id.eq(resource_id))
        .filter(bookings::deleted_at.is_null())
        .filter(bookings::status.eq_any(blocking))
        .filter(bookings::start_at.lt(end))
        .filter(bookings::end_at.gt(start))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Create a `PENDING` booking or fail. The range must fall inside the
/// day's operating windows; price and policy are snapshotted into the row
/// here and never recomputed later.
pub fn create_booking(
    conn: &mut PgConnection,
    request: &CreateBookingRequest,
) -> Result<Booking, ApiError> {
    let business = catalog::get_active_business(conn, request.business_id)?;

    let service = match request.service_id {
        Some(id) => {
            let service = catalog::get_active_service(conn, id)?;
            if service.business_id != business.id {
                return Err(ApiError::NotFound(format!("service {id} not found")));
            }
            Some(service)
        }
        None => None,
    };

    let end_at = match request.end_at {
        Some(end) => end,
        None => {
            let duration = service
                .as_ref()
                .map(|s| i64::from(s.duration_minutes))
                .ok_or_else(|| {
                    ApiError::BadRequest(
                        "end_at is required when no service is given".to_string(),
                    )
                })?;
            request.start_at + Duration::minutes(duration)
        }
    };
    if end_at <= request.start_at {
        return Err(ApiError::BadRequest(
            "booking end must be after its start".to_string(),
        ));
    }

    if let Some(resource_id) = request.resource_id {
        let resource = catalog::get_active_resource(conn, resource_id)?;
        if resource.business_id != business.id {
            return Err(ApiError::NotFound(format!("resource {resource_id} not found")));
        }
    }

    availability::check_range_bookable(
        conn,
        business.id,
        request.resource_id,
        request.start_at,
        end_at,
    )?;

    if let Some(resource_id) = request.resource_id {
        let (before, after) = service
            .as_ref()
            .map(|s| (s.buffer_before_minutes, s.buffer_after_minutes))
            .unwrap_or((0, 0));
        if range_is_taken(conn, resource_id, request.start_at, end_at, before, after)? {
            return Err(ApiError::Conflict(SLOT_TAKEN.to_string()));
        }
    }

    let price = service
        .as_ref()
        .map(policy::price_snapshot)
        .unwrap_or(policy::PriceSnapshot {
            total: 0,
            currency: "usd".to_string(),
            deposit_percent: 0,
            deposit_amount: 0,
            balance_amount: 0,
        });
    let policy_snapshot = match &service {
        Some(service) => policy::resolve_policy(conn, service)?,
        None => policy::PolicySnapshot::zero(),
    };

    let now = Utc::now();
    let new_booking = NewBooking {
        id: Uuid::new_v4(),
        business_id: business.id,
        service_id: request.service_id,
        resource_id: request.resource_id,
        customer_id: request.customer_id,
        start_at: request.start_at,
        end_at,
        status: BookingStatus::Pending.as_str().to_string(),
        source: request.source.clone().unwrap_or_else(|| "api".to_string()),
        price_amount: price.total,
        currency: price.currency,
        deposit_percent: price.deposit_percent,
        deposit_amount: price.deposit_amount,
        balance_amount: price.balance_amount,
        policy_hours_before: policy_snapshot.hours_before,
        policy_penalty_percent: policy_snapshot.penalty_percent,
        metadata: request.metadata.clone().unwrap_or_else(|| json!({})),
        created_at: now,
        updated_at: now,
    };

    conn.transaction::<Booking, ApiError, _>(|conn| {
        let inserted = diesel::insert_into(bookings::table)
            .values(&new_booking)
            .returning(Booking::as_returning())
            .get_result::<Booking>(conn)
            .map_err(translate_overlap)?;
        record_history(
            conn,
            &BookingHistoryEntry::new(
                inserted.id,
                None,
                BookingStatus::Pending,
                "scheduler",
                None,
            ),
        )?;
        Ok(inserted)
    })
}

/// Map the storage-layer overlap violation onto the same `Conflict` the
/// pre-check produces, so callers see one error taxonomy regardless of
/// which layer caught the race.
fn translate_overlap(err: diesel::result::Error) -> ApiError {
    if let diesel::result::Error::DatabaseError(_, info) = &err {
        if info.constraint_name() == Some(OVERLAP_CONSTRAINT) {
            return ApiError::Conflict(SLOT_TAKEN.to_string());
        }
    }
    err.into()
}
