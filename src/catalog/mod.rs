//! Read-only catalog providers.
//!
//! Businesses, services, resources, operating hours, staff schedules and
//! cancellation policies are owned by the CRUD surface; the booking core
//! only reads them. Inactive or missing entities surface as `NotFound`.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::error::ApiError;
use crate::shared::models::schema::{
    business_holidays, business_hours, businesses, cancellation_policies, resources,
    schedule_exceptions, services, staff_schedules,
};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = businesses)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub timezone: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = services)]
pub struct Service {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub duration_minutes: i32,
    pub price_amount: i64,
    pub currency: String,
    pub requires_deposit: bool,
    pub deposit_percent: i32,
    pub deposit_due_hours: i32,
    pub buffer_before_minutes: i32,
    pub buffer_after_minutes: i32,
    pub policy_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = resources)]
pub struct Resource {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Operating hours for one weekday. Weekdays are numbered from Monday = 0,
/// matching `chrono::Weekday::num_days_from_monday`.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = business_hours)]
pub struct BusinessHours {
    pub id: Uuid,
    pub business_id: Uuid,
    pub weekday: i32,
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
    pub is_closed: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = staff_schedules)]
pub struct StaffSchedule {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub weekday: i32,
    pub starts_at: NaiveTime,
    pub ends_at: NaiveTime,
}

/// Date-specific override of a resource's regular schedule. When
/// `is_available` is false the whole day is blocked; otherwise the optional
/// times replace the regular window.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schedule_exceptions)]
pub struct ScheduleException {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub day_on: NaiveDate,
    pub is_available: bool,
    pub starts_at: Option<NaiveTime>,
    pub ends_at: Option<NaiveTime>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = cancellation_policies)]
pub struct CancellationPolicy {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub hours_before: i32,
    pub penalty_percent: i32,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

pub fn get_active_business(conn: &mut PgConnection, id: Uuid) -> Result<Business, ApiError> {
    let business = businesses::table
        .find(id)
        .select(Business::as_select())
        .first::<Business>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("business {id} not found")))?;
    if !business.is_active {
        return Err(ApiError::NotFound(format!("business {id} not found")));
    }
    Ok(business)
}

pub fn get_active_service(conn: &mut PgConnection, id: Uuid) -> Result<Service, ApiError> {
    let service = services::table
        .find(id)
        .select(Service::as_select())
        .first::<Service>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("service {id} not found")))?;
    if !service.is_active {
        return Err(ApiError::NotFound(format!("service {id} not found")));
    }
    Ok(service)
}

pub fn get_active_resource(conn: &mut PgConnection, id: Uuid) -> Result<Resource, ApiError> {
    let resource = resources::table
        .find(id)
        .select(Resource::as_select())
        .first::<Resource>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("resource {id} not found")))?;
    if !resource.is_active {
        return Err(ApiError::NotFound(format!("resource {id} not found")));
    }
    Ok(resource)
}

pub fn hours_for_weekday(
    conn: &mut PgConnection,
    business: Uuid,
    weekday: i32,
) -> Result<Vec<BusinessHours>, ApiError> {
    Ok(business_hours::table
        .filter(business_hours::business_id.eq(business))
        .filter(business_hours::weekday.eq(weekday))
        .select(BusinessHours::as_select())
        .load(conn)?)
}

pub fn is_holiday(
    conn: &mut PgConnection,
    business: Uuid,
    day: NaiveDate,
) -> Result<bool, ApiError> {
    let count: i64 = business_holidays::table
        .filter(business_holidays::business_id.eq(business))
        .filter(business_holidays::holiday_on.eq(day))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

pub fn staff_windows(
    conn: &mut PgConnection,
    resource: Uuid,
    weekday: i32,
) -> Result<Vec<StaffSchedule>, ApiError> {
    Ok(staff_schedules::table
        .filter(staff_schedules::resource_id.eq(resource))
        .filter(staff_schedules::weekday.eq(weekday))
        .select(StaffSchedule::as_select())
        .load(conn)?)
}

pub fn exceptions_on(
    conn: &mut PgConnection,
    resource: Uuid,
    day: NaiveDate,
) -> Result<Vec<ScheduleException>, ApiError> {
    Ok(schedule_exceptions::table
        .filter(schedule_exceptions::resource_id.eq(resource))
        .filter(schedule_exceptions::day_on.eq(day))
        .select(ScheduleException::as_select())
        .load(conn)?)
}

pub fn get_policy(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<CancellationPolicy>, ApiError> {
    Ok(cancellation_policies::table
        .find(id)
        .select(CancellationPolicy::as_select())
        .first(conn)
        .optional()?)
}

pub fn default_policy(
    conn: &mut PgConnection,
    business: Uuid,
) -> Result<Option<CancellationPolicy>, ApiError> {
    Ok(cancellation_policies::table
        .filter(cancellation_policies::business_id.eq(business))
        .filter(cancellation_policies::is_default.eq(true))
        .select(CancellationPolicy::as_select())
        .first(conn)
        .optional()?)
}
