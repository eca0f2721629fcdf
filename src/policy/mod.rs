//! Cancellation-policy resolution and deposit/forfeiture arithmetic.
//!
//! The calculator is pure integer math over minor currency units. Amounts
//! are snapshotted into the booking row at creation time, so later edits to
//! a service's price or policy never change an existing booking's terms.

use chrono::{DateTime, Duration, Utc};
use diesel::PgConnection;
use serde::{Deserialize, Serialize};

use crate::catalog::{self, Service};
use crate::shared::error::ApiError;

/// Immutable copy of the cancellation terms at booking time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub hours_before: i32,
    pub penalty_percent: i32,
}

impl PolicySnapshot {
    pub fn zero() -> Self {
        Self {
            hours_before: 0,
            penalty_percent: 0,
        }
    }
}

/// Immutable copy of the pricing terms at booking time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub total: i64,
    pub currency: String,
    pub deposit_percent: i32,
    pub deposit_amount: i64,
    pub balance_amount: i64,
}

/// Resolve the effective cancellation policy for a service: its explicit
/// policy if set, otherwise the business default, otherwise no penalty.
pub fn resolve_policy(
    conn: &mut PgConnection,
    service: &Service,
) -> Result<PolicySnapshot, ApiError> {
    let policy = match service.policy_id {
        Some(id) => catalog::get_policy(conn, id)?,
        None => None,
    };
    let policy = match policy {
        Some(p) => Some(p),
        None => catalog::default_policy(conn, service.business_id)?,
    };
    Ok(policy
        .map(|p| PolicySnapshot {
            hours_before: p.hours_before,
            penalty_percent: p.penalty_percent,
        })
        .unwrap_or_else(PolicySnapshot::zero))
}

/// Build the price snapshot for a service at its current catalog price.
pub fn price_snapshot(service: &Service) -> PriceSnapshot {
    let deposit = deposit_amount(
        service.price_amount,
        service.deposit_percent,
        service.requires_deposit,
    );
    PriceSnapshot {
        total: service.price_amount,
        currency: service.currency.clone(),
        deposit_percent: service.deposit_percent,
        deposit_amount: deposit,
        balance_amount: balance_amount(service.price_amount, deposit),
    }
}

/// `floor(total * percent / 100)` when a deposit is required, else 0.
pub fn deposit_amount(total: i64, deposit_percent: i32, requires_deposit: bool) -> i64 {
    if !requires_deposit || total <= 0 {
        return 0;
    }
    let percent = i64::from(deposit_percent.clamp(0, 100));
    total * percent / 100
}

pub fn balance_amount(total: i64, deposit: i64) -> i64 {
    (total - deposit).max(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForfeitureSplit {
    pub forfeited: i64,
    pub refundable: i64,
}

/// Split a paid deposit into the forfeited and refundable portions under
/// the booking's snapshotted penalty.
pub fn forfeiture_split(deposit: i64, penalty_percent: i32) -> ForfeitureSplit {
    if deposit <= 0 {
        return ForfeitureSplit {
            forfeited: 0,
            refundable: 0,
        };
    }
    let percent = i64::from(penalty_percent.clamp(0, 100));
    let forfeited = deposit * percent / 100;
    ForfeitureSplit {
        forfeited,
        refundable: deposit - forfeited,
    }
}

/// Whether the penalty applies: cancellation inside the cutoff window.
pub fn penalty_applies(policy: &PolicySnapshot, start_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now + Duration::hours(i64::from(policy.hours_before)) > start_at
}

/// A deposit is due once the grace period after creation has lapsed and no
/// succeeded deposit/full payment exists.
pub fn deposit_is_due(
    created_at: DateTime<Utc>,
    deposit_due_hours: i32,
    has_succeeded_deposit_or_full: bool,
    now: DateTime<Utc>,
) -> bool {
    !has_succeeded_deposit_or_full
        && now > created_at + Duration::hours(i64::from(deposit_due_hours))
}
