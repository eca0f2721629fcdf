//! Availability engine.
//!
//! Computes the slot lattice for a resource on a given date by intersecting
//! business operating hours (minus holidays), staff working windows (minus
//! date-specific exceptions) and the complement of existing bookings
//! expanded by the service's buffer times. Purely derived; no side effects.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::booking::status::BookingStatus;
use crate::catalog;
use crate::shared::error::ApiError;
use crate::shared::models::schema::bookings;
use crate::shared::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    fn is_valid(&self) -> bool {
        self.end > self.start
    }

    fn intersect(&self, other: &TimeWindow) -> Option<TimeWindow> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end > start {
            Some(TimeWindow { start, end })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub available: bool,
}

/// Everything the lattice computation needs, already loaded.
#[derive(Debug, Clone)]
pub struct SlotInputs {
    pub day: NaiveDate,
    pub slot_minutes: i64,
    /// Business operating windows for the weekday; empty on holidays or
    /// closed days.
    pub open_windows: Vec<TimeWindow>,
    /// Staff working windows after applying exceptions; empty means the
    /// resource follows the business hours unrestricted.
    pub staff_windows: Vec<TimeWindow>,
    /// Existing bookings on the resource, already expanded by buffers.
    pub busy: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Compute the ordered slot lattice at `slot_minutes` granularity.
///
/// Slots inside the effective windows are always emitted; the ones that
/// collide with a busy interval carry `available: false` so callers can
/// render a full grid.
pub fn compute_slots(inputs: &SlotInputs) -> Vec<Slot> {
    if inputs.slot_minutes <= 0 {
        return Vec::new();
    }
    let step = Duration::minutes(inputs.slot_minutes);

    let effective: Vec<TimeWindow> = if inputs.staff_windows.is_empty() {
        inputs
            .open_windows
            .iter()
            .copied()
            .filter(TimeWindow::is_valid)
            .collect()
    } else {
        let mut windows = Vec::new();
        for open in inputs.open_windows.iter().filter(|w| w.is_valid()) {
            for staff in inputs.staff_windows.iter().filter(|w| w.is_valid()) {
                if let Some(overlap) = open.intersect(staff) {
                    windows.push(overlap);
                }
            }
        }
        windows
    };

    let mut slots = Vec::new();
    for window in &effective {
        let mut cursor = inputs.day.and_time(window.start).and_utc();
        let close = inputs.day.and_time(window.end).and_utc();
        loop {
            let slot_end = cursor + step;
            if slot_end > close {
                break;
            }
            let free = !inputs
                .busy
                .iter()
                .any(|(busy_start, busy_end)| cursor < *busy_end && slot_end > *busy_start);
            slots.push(Slot {
                starts_at: cursor,
                ends_at: slot_end,
                available: free,
            });
            cursor = slot_end;
        }
    }
    slots.sort_by_key(|s| s.starts_at);
    slots.dedup_by_key(|s| s.starts_at);
    slots
}

/// Load the busy intervals for a resource on one day, expanded by the
/// service buffers. Only live bookings block the calendar.
pub fn busy_intervals(
    conn: &mut PgConnection,
    resource_id: Uuid,
    day: NaiveDate,
    buffer_before_minutes: i32,
    buffer_after_minutes: i32,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, ApiError> {
    let day_start = day.and_time(NaiveTime::MIN).and_utc();
    let day_end = day_start + Duration::days(1);
    let blocking: Vec<String> = BookingStatus::blocking()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();

    let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = bookings::table
        .filter(bookings::resource_id.eq(resource_id))
        .filter(bookings::deleted_at.is_null())
        .filter(bookings::status.eq_any(blocking))
        .filter(bookings::start_at.lt(day_end))
        .filter(bookings::end_at.gt(day_start))
        .select((bookings::start_at, bookings::end_at))
        .load(conn)?;

    let before = Duration::minutes(i64::from(buffer_before_minutes.max(0)));
    let after = Duration::minutes(i64::from(buffer_after_minutes.max(0)));
    Ok(rows
        .into_iter()
        .map(|(start, end)| (start - before, end + after))
        .collect())
}

const OUT_OF_HOURS: &str = "the requested time is outside operating hours";

/// Validate a concrete booking range against the day's effective windows.
///
/// Only enforced where the catalog constrains the day: a holiday or a
/// weekday marked closed rejects outright, and configured business hours
/// (intersected with the resource's staff windows, when any exist) must
/// contain the whole range. A business with no configured hours imposes
/// nothing.
pub fn check_range_bookable(
    conn: &mut PgConnection,
    business_id: Uuid,
    resource_id: Option<Uuid>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
) -> Result<(), ApiError> {
    let day = start_at.date_naive();
    if catalog::is_holiday(conn, business_id, day)? {
        return Err(ApiError::BadRequest(OUT_OF_HOURS.to_string()));
    }

    let weekday = day.weekday().num_days_from_monday() as i32;
    let hours = catalog::hours_for_weekday(conn, business_id, weekday)?;
    if hours.iter().any(|h| h.is_closed) {
        return Err(ApiError::BadRequest(OUT_OF_HOURS.to_string()));
    }
    let open: Option<Vec<TimeWindow>> = if hours.is_empty() {
        None
    } else {
        Some(
            hours
                .iter()
                .map(|h| TimeWindow::new(h.opens_at, h.closes_at))
                .collect(),
        )
    };

    let staff: Option<Vec<TimeWindow>> = match resource_id {
        Some(resource_id) => match staff_windows_for(conn, resource_id, day)? {
            None => return Err(ApiError::BadRequest(OUT_OF_HOURS.to_string())),
            Some(windows) if windows.is_empty() => None,
            Some(windows) => Some(windows),
        },
        None => None,
    };

    let effective = match (open, staff) {
        (None, None) => return Ok(()),
        (Some(open), None) => open,
        (None, Some(staff)) => staff,
        (Some(open), Some(staff)) => {
            let mut windows = Vec::new();
            for o in open.iter().filter(|w| w.is_valid()) {
                for s in staff.iter().filter(|w| w.is_valid()) {
                    if let Some(overlap) = o.intersect(s) {
                        windows.push(overlap);
                    }
                }
            }
            windows
        }
    };

    // A constrained day never spans midnight, so a range that does cannot
    // fit any window.
    if end_at.date_naive() != day || !windows_cover(&effective, start_at.time(), end_at.time()) {
        return Err(ApiError::BadRequest(OUT_OF_HOURS.to_string()));
    }
    Ok(())
}

fn windows_cover(windows: &[TimeWindow], start: NaiveTime, end: NaiveTime) -> bool {
    windows
        .iter()
        .any(|w| w.is_valid() && w.start <= start && end <= w.end)
}

fn staff_windows_for(
    conn: &mut PgConnection,
    resource_id: Uuid,
    day: NaiveDate,
) -> Result<Option<Vec<TimeWindow>>, ApiError> {
    let exceptions = catalog::exceptions_on(conn, resource_id, day)?;
    if exceptions.iter().any(|e| !e.is_available) {
        // Whole day blocked for this resource.
        return Ok(None);
    }
    if !exceptions.is_empty() {
        let windows = exceptions
            .iter()
            .filter_map(|e| match (e.starts_at, e.ends_at) {
                (Some(start), Some(end)) => Some(TimeWindow::new(start, end)),
                _ => None,
            })
            .collect();
        return Ok(Some(windows));
    }

    let weekday = day.weekday().num_days_from_monday() as i32;
    let regular = catalog::staff_windows(conn, resource_id, weekday)?;
    Ok(Some(
        regular
            .iter()
            .map(|s| TimeWindow::new(s.starts_at, s.ends_at))
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub business_id: Uuid,
    pub service_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub date: NaiveDate,
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub business_id: Uuid,
    pub resource_id: Option<Uuid>,
    pub date: NaiveDate,
    pub slot_minutes: i64,
    pub slots: Vec<Slot>,
}

pub async fn get_availability(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let mut conn = state.conn.get()?;

    let business = catalog::get_active_business(&mut conn, query.business_id)?;

    let service = match query.service_id {
        Some(id) => {
            let service = catalog::get_active_service(&mut conn, id)?;
            if service.business_id != business.id {
                return Err(ApiError::NotFound(format!("service {id} not found")));
            }
            Some(service)
        }
        None => None,
    };

    let slot_minutes = query
        .duration_minutes
        .or_else(|| service.as_ref().map(|s| i64::from(s.duration_minutes)))
        .ok_or_else(|| {
            ApiError::BadRequest("either service_id or duration_minutes is required".to_string())
        })?;
    if slot_minutes <= 0 {
        return Err(ApiError::BadRequest(
            "duration_minutes must be positive".to_string(),
        ));
    }

    let weekday = query.date.weekday().num_days_from_monday() as i32;
    let open_windows: Vec<TimeWindow> = if catalog::is_holiday(&mut conn, business.id, query.date)?
    {
        Vec::new()
    } else {
        let hours = catalog::hours_for_weekday(&mut conn, business.id, weekday)?;
        if hours.iter().any(|h| h.is_closed) {
            Vec::new()
        } else {
            hours
                .iter()
                .map(|h| TimeWindow::new(h.opens_at, h.closes_at))
                .collect()
        }
    };

    let (staff_windows, busy) = match query.resource_id {
        Some(resource_id) => {
            let resource = catalog::get_active_resource(&mut conn, resource_id)?;
            if resource.business_id != business.id {
                return Err(ApiError::NotFound(format!(
                    "resource {resource_id} not found"
                )));
            }
            let windows = match staff_windows_for(&mut conn, resource_id, query.date)? {
                Some(windows) => windows,
                None => {
                    // Resource blocked for the whole day.
                    return Ok(Json(AvailabilityResponse {
                        business_id: business.id,
                        resource_id: Some(resource_id),
                        date: query.date,
                        slot_minutes,
                        slots: Vec::new(),
                    }));
                }
            };
            let (before, after) = service
                .as_ref()
                .map(|s| (s.buffer_before_minutes, s.buffer_after_minutes))
                .unwrap_or((0, 0));
            let busy = busy_intervals(&mut conn, resource_id, query.date, before, after)?;
            (windows, busy)
        }
        None => (Vec::new(), Vec::new()),
    };

    let slots = compute_slots(&SlotInputs {
        day: query.date,
        slot_minutes,
        open_windows,
        staff_windows,
        busy,
    });

    Ok(Json(AvailabilityResponse {
        business_id: business.id,
        resource_id: query.resource_id,
        date: query.date,
        slot_minutes,
        slots,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        day().and_time(t(h, m)).and_utc()
    }

    #[test]
    fn full_day_lattice_without_bookings() {
        let slots = compute_slots(&SlotInputs {
            day: day(),
            slot_minutes: 60,
            open_windows: vec![TimeWindow::new(t(9, 0), t(17, 0))],
            staff_windows: Vec::new(),
            busy: Vec::new(),
        });
        assert_eq!(slots.len(), 8);
        assert!(slots.iter().all(|s| s.available));
        assert_eq!(slots[0].starts_at, at(9, 0));
        assert_eq!(slots[7].ends_at, at(17, 0));
    }

    #[test]
    fn staff_window_narrows_business_hours() {
        let slots = compute_slots(&SlotInputs {
            day: day(),
            slot_minutes: 60,
            open_windows: vec![TimeWindow::new(t(9, 0), t(17, 0))],
            staff_windows: vec![TimeWindow::new(t(10, 0), t(14, 0))],
            busy: Vec::new(),
        });
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].starts_at, at(10, 0));
        assert_eq!(slots[3].ends_at, at(14, 0));
    }

    #[test]
    fn buffered_booking_blocks_adjacent_slots() {
        // A 10:00-11:00 booking expanded by 15-minute buffers occupies
        // 9:45-11:15, so the 9:00, 10:00 and 11:00 slots all collide.
        let slots = compute_slots(&SlotInputs {
            day: day(),
            slot_minutes: 60,
            open_windows: vec![TimeWindow::new(t(9, 0), t(13, 0))],
            staff_windows: Vec::new(),
            busy: vec![(at(9, 45), at(11, 15))],
        });
        let availability: Vec<bool> = slots.iter().map(|s| s.available).collect();
        assert_eq!(availability, vec![false, false, false, true]);
    }

    #[test]
    fn partial_slot_at_close_is_not_emitted() {
        let slots = compute_slots(&SlotInputs {
            day: day(),
            slot_minutes: 45,
            open_windows: vec![TimeWindow::new(t(9, 0), t(10, 30))],
            staff_windows: Vec::new(),
            busy: Vec::new(),
        });
        // 9:00-9:45 and 9:45-10:30; a third slot would cross closing time.
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn closed_day_yields_no_slots() {
        let slots = compute_slots(&SlotInputs {
            day: day(),
            slot_minutes: 30,
            open_windows: Vec::new(),
            staff_windows: vec![TimeWindow::new(t(9, 0), t(17, 0))],
            busy: Vec::new(),
        });
        assert!(slots.is_empty());
    }

    #[test]
    fn disjoint_staff_window_yields_no_slots() {
        let slots = compute_slots(&SlotInputs {
            day: day(),
            slot_minutes: 30,
            open_windows: vec![TimeWindow::new(t(9, 0), t(12, 0))],
            staff_windows: vec![TimeWindow::new(t(13, 0), t(17, 0))],
            busy: Vec::new(),
        });
        assert!(slots.is_empty());
    }

    #[test]
    fn containment_requires_the_whole_range_inside_one_window() {
        let windows = vec![
            TimeWindow::new(t(9, 0), t(12, 0)),
            TimeWindow::new(t(13, 0), t(17, 0)),
        ];
        assert!(windows_cover(&windows, t(9, 0), t(10, 0)));
        assert!(windows_cover(&windows, t(13, 0), t(17, 0)));
        // Spills past closing, starts before opening, straddles the break.
        assert!(!windows_cover(&windows, t(16, 30), t(17, 30)));
        assert!(!windows_cover(&windows, t(8, 0), t(9, 30)));
        assert!(!windows_cover(&windows, t(11, 30), t(13, 30)));
    }

    #[test]
    fn inverted_window_is_ignored() {
        let slots = compute_slots(&SlotInputs {
            day: day(),
            slot_minutes: 30,
            open_windows: vec![TimeWindow::new(t(17, 0), t(9, 0))],
            staff_windows: Vec::new(),
            busy: Vec::new(),
        });
        assert!(slots.is_empty());
    }
}
