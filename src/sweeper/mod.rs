//! Background sweeper.
//!
//! Periodically expires unpaid bookings past their payment deadline, emits
//! reminders for upcoming confirmed bookings, purges lapsed idempotency
//! keys and requeues webhooks that were persisted but never reconciled.
//! Expiry candidates are locked with `SKIP LOCKED` so the sweep never
//! stalls behind an in-flight transition, and each pass is bounded so one
//! tick cannot monopolize the pool.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::booking::{state_machine, Booking, BookingStatus};
use crate::notify::Notification;
use crate::payments::{self, idempotency, webhook};
use crate::shared::error::ApiError;
use crate::shared::models::schema::bookings;
use crate::shared::state::AppState;

/// How long a persisted webhook may sit unprocessed before the sweeper
/// assumes its queue entry was lost.
const WEBHOOK_REQUEUE_AGE_SECS: i64 = 60;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reminded: usize,
    pub keys_purged: usize,
    pub webhooks_requeued: usize,
}

/// One full sweep pass. Safe to run concurrently with API traffic and with
/// other sweeper instances.
pub fn run_once(state: &AppState, now: DateTime<Utc>) -> Result<SweepReport, ApiError> {
    let mut report = SweepReport::default();
    let batch = state.config.booking.sweep_batch_size;

    let expired = expire_overdue(state, now, batch)?;
    report.expired = expired.len();
    for booking_id in expired {
        state
            .notifications
            .enqueue(Notification::BookingExpired { booking_id });
    }

    let reminded = send_reminders(state, now, batch)?;
    report.reminded = reminded.len();
    for (booking_id, start_at) in reminded {
        state
            .notifications
            .enqueue(Notification::BookingReminder {
                booking_id,
                start_at,
            });
    }

    {
        let mut conn = state.conn.get()?;
        report.keys_purged = idempotency::purge_expired(&mut conn, now)?;
        report.webhooks_requeued = webhook::requeue_unprocessed(
            &mut conn,
            &state.webhooks,
            now - Duration::seconds(WEBHOOK_REQUEUE_AGE_SECS),
            batch,
        )?;
    }

    Ok(report)
}

/// Expire a bounded batch of unpaid bookings whose payment deadline has
/// passed. Rows another transaction holds are skipped, not waited on; a
/// booking that gained a succeeded payment since candidacy is left alone
/// for the reconciler to confirm.
fn expire_overdue(
    state: &AppState,
    now: DateTime<Utc>,
    batch: i64,
) -> Result<Vec<Uuid>, ApiError> {
    let deadline = now - Duration::minutes(state.config.booking.expiry_minutes);
    let unpaid: Vec<String> = [BookingStatus::Pending, BookingStatus::PendingPayment]
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();

    let mut conn = state.conn.get()?;
    conn.transaction::<Vec<Uuid>, ApiError, _>(|conn| {
        let candidates: Vec<Booking> = bookings::table
            .filter(bookings::status.eq_any(&unpaid))
            .filter(bookings::deleted_at.is_null())
            .filter(bookings::created_at.lt(deadline))
            .order(bookings::created_at.asc())
            .limit(batch)
            .select(Booking::as_select())
            .for_update()
            .skip_locked()
            .load(conn)?;

        let mut expired = Vec::with_capacity(candidates.len());
        for booking in candidates {
            if payments::has_succeeded_payment(conn, booking.id)? {
                continue;
            }
            state_machine::transition_locked(
                conn,
                &booking,
                BookingStatus::Expired,
                "sweeper",
                Some("payment deadline passed".to_string()),
            )?;
            expired.push(booking.id);
        }
        Ok(expired)
    })
}

/// Mark confirmed bookings inside the reminder window. `reminded_at` is the
/// dedup guard: each booking gets at most one reminder.
fn send_reminders(
    state: &AppState,
    now: DateTime<Utc>,
    batch: i64,
) -> Result<Vec<(Uuid, DateTime<Utc>)>, ApiError> {
    let horizon = now + Duration::minutes(state.config.booking.reminder_lead_minutes);

    let mut conn = state.conn.get()?;
    conn.transaction::<Vec<(Uuid, DateTime<Utc>)>, ApiError, _>(|conn| {
        let due: Vec<(Uuid, DateTime<Utc>)> = bookings::table
            .filter(bookings::status.eq(BookingStatus::Confirmed.as_str()))
            .filter(bookings::deleted_at.is_null())
            .filter(bookings::reminded_at.is_null())
            .filter(bookings::start_at.gt(now))
            .filter(bookings::start_at.le(horizon))
            .order(bookings::start_at.asc())
            .limit(batch)
            .select((bookings::id, bookings::start_at))
            .for_update()
            .skip_locked()
            .load(conn)?;

        let ids: Vec<Uuid> = due.iter().map(|(id, _)| *id).collect();
        if !ids.is_empty() {
            diesel::update(bookings::table.filter(bookings::id.eq_any(&ids)))
                .set(bookings::reminded_at.eq(Some(now)))
                .execute(conn)?;
        }
        Ok(due)
    })
}

pub struct Sweeper {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Sweeper {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            tracing::error!("sweeper terminated abnormally: {err}");
        }
    }
}

/// Spawn the periodic sweep loop. The first tick fires after one full
/// interval so startup is not front-loaded with a sweep.
pub fn spawn(state: AppState) -> Sweeper {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let interval = std::time::Duration::from_secs(state.config.booking.sweep_interval_secs);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match run_once(&state, Utc::now()) {
                        Ok(report) => tracing::info!(
                            expired = report.expired,
                            reminded = report.reminded,
                            keys_purged = report.keys_purged,
                            webhooks_requeued = report.webhooks_requeued,
                            "sweep pass finished"
                        ),
                        Err(err) => tracing::error!("sweep pass failed: {err}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::debug!("sweeper shutting down");
                    break;
                }
            }
        }
    });
    Sweeper { handle, shutdown }
}
