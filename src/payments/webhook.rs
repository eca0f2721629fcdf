//! Provider webhook intake and reconciliation.
//!
//! Events arrive signed with the provider's shared secret, are persisted
//! exactly once keyed on `(provider, event_id)`, and are reconciled against
//! payment rows by a background worker. Processing failures retry with
//! exponential backoff up to a bounded attempt count, after which the event
//! is parked as permanently failed and surfaced for operator review.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::booking::state_machine;
use crate::config::PaymentsConfig;
use crate::notify::{Notification, NotificationQueue};
use crate::payments::{self, BookingPayment, PaymentStatus};
use crate::shared::error::ApiError;
use crate::shared::models::schema::{booking_payments, payment_webhooks};
use crate::shared::utils::DbPool;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the signature timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = payment_webhooks)]
pub struct PaymentWebhook {
    pub id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub signature: String,
    pub payload: serde_json::Value,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub permanently_failed: bool,
    pub created_at: DateTime<Utc>,
}

/// Wire shape shared by the reconciled charge events. The event type is
/// dispatched from the stored row, not re-parsed here.
#[derive(Debug, Deserialize)]
struct WireEvent {
    event_id: String,
    intent_id: String,
    charge_id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
}

/// Verify a `t=<unix>,v1=<hex>` signature header over the raw payload.
/// The signed message is `"{t}.{payload}"`; timestamps outside the
/// tolerance window are rejected to blunt replay.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let mut timestamp: Option<i64> = None;
    let mut provided: Option<Vec<u8>> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => provided = hex::decode(value).ok(),
            _ => {}
        }
    }
    let (timestamp, provided) = match (timestamp, provided) {
        (Some(t), Some(sig)) => (t, sig),
        _ => {
            return Err(ApiError::Unauthorized(
                "malformed webhook signature header".to_string(),
            ))
        }
    };

    if (now.timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(ApiError::Unauthorized(
            "webhook signature timestamp outside tolerance".to_string(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Internal(format!("hmac init: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&provided)
        .map_err(|_| ApiError::Unauthorized("webhook signature mismatch".to_string()))
}

/// Produce a valid signature header for the given payload. Used by the
/// scripted provider in tests and by local tooling.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, PartialEq, Eq)]
pub enum Receipt {
    /// First sight of this event; queued for reconciliation.
    Accepted(Uuid),
    /// `(provider, event_id)` was already persisted; nothing re-runs.
    Duplicate,
}

/// Verify, persist and enqueue an incoming webhook. Returns before any
/// reconciliation work happens; delivery acknowledgment must not wait on
/// downstream effects. Any verified event with an id is recorded, whether
/// or not its shape is reconcilable; rejecting it here would only provoke
/// provider retry storms and lose the audit row.
pub fn receive(
    conn: &mut PgConnection,
    queue: &WebhookQueue,
    secret: &str,
    provider: &str,
    signature_header: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<Receipt, ApiError> {
    verify_signature(secret, signature_header, body, now)?;

    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("webhook body is not valid JSON: {e}")))?;
    // Dedup is keyed on the event id; everything else is the worker's
    // problem.
    let event_id = payload
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::BadRequest("webhook event has no event_id".to_string()))?
        .to_string();
    let event_type = payload
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let webhook_id = Uuid::new_v4();
    let inserted = diesel::insert_into(payment_webhooks::table)
        .values((
            payment_webhooks::id.eq(webhook_id),
            payment_webhooks::provider.eq(provider),
            payment_webhooks::event_id.eq(&event_id),
            payment_webhooks::event_type.eq(&event_type),
            payment_webhooks::signature.eq(signature_header),
            payment_webhooks::payload.eq(&payload),
            payment_webhooks::retry_count.eq(0),
            payment_webhooks::permanently_failed.eq(false),
            payment_webhooks::created_at.eq(now),
        ))
        .on_conflict_do_nothing()
        .execute(conn)?;
    if inserted == 0 {
        return Ok(Receipt::Duplicate);
    }

    queue.enqueue(webhook_id);
    Ok(Receipt::Accepted(webhook_id))
}

/// Apply one persisted event to its payment row. Errors here are retried
/// by the worker; an event type we do not reconcile is acknowledged as
/// processed without effect.
pub fn process_event(
    conn: &mut PgConnection,
    notifications: &NotificationQueue,
    webhook: &PaymentWebhook,
) -> Result<(), ApiError> {
    match webhook.event_type.as_str() {
        "charge.succeeded" => {
            let event = wire_event(webhook)?;
            let payment = payment_for(conn, webhook, &event)?;
            // Events arrive in provider order, not ours: a success is only
            // applied to a pending payment. A replay after success is a
            // no-op, and a delayed success must never resurrect a row the
            // refund or failure path already settled.
            match payment.status()? {
                PaymentStatus::Pending => {}
                PaymentStatus::Succeeded => return Ok(()),
                PaymentStatus::Refunded | PaymentStatus::Failed => {
                    tracing::warn!(
                        payment_id = %payment.id,
                        event_id = %webhook.event_id,
                        status = %payment.status,
                        "ignoring out-of-order success event"
                    );
                    return Ok(());
                }
            }
            conn.transaction::<(), ApiError, _>(|conn| {
                diesel::update(booking_payments::table.find(payment.id))
                    .set((
                        booking_payments::status.eq(PaymentStatus::Succeeded.as_str()),
                        booking_payments::charge_id.eq(event.charge_id.clone()),
                        booking_payments::provider_response.eq(Some(webhook.payload.clone())),
                        booking_payments::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                state_machine::confirm(
                    conn,
                    payment.booking_id,
                    "webhook",
                    Some(format!("{} event {}", webhook.provider, event.event_id)),
                )?;
                Ok(())
            })?;
            notifications.enqueue(Notification::BookingConfirmed {
                booking_id: payment.booking_id,
            });
        }
        "charge.failed" => {
            let event = wire_event(webhook)?;
            let payment = payment_for(conn, webhook, &event)?;
            // A stale failure after a recorded success is provider noise.
            if payment.status()? == PaymentStatus::Pending {
                diesel::update(booking_payments::table.find(payment.id))
                    .set((
                        booking_payments::status.eq(PaymentStatus::Failed.as_str()),
                        booking_payments::provider_response.eq(Some(webhook.payload.clone())),
                        booking_payments::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                notifications.enqueue(Notification::PaymentFailed {
                    booking_id: payment.booking_id,
                    payment_id: payment.id,
                });
            }
        }
        "charge.refunded" => {
            let event = wire_event(webhook)?;
            let payment = payment_for(conn, webhook, &event)?;
            let refunded = event.amount.unwrap_or(payment.amount);
            let total = refunded.min(payment.amount).max(payment.refunded_amount);
            let status = if total >= payment.amount {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::Succeeded
            };
            diesel::update(booking_payments::table.find(payment.id))
                .set((
                    booking_payments::refunded_amount.eq(total),
                    booking_payments::status.eq(status.as_str()),
                    booking_payments::provider_response.eq(Some(webhook.payload.clone())),
                    booking_payments::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
        }
        other => {
            tracing::debug!(event_type = other, "ignoring unreconciled webhook event type");
        }
    }
    Ok(())
}

fn wire_event(webhook: &PaymentWebhook) -> Result<WireEvent, ApiError> {
    serde_json::from_value(webhook.payload.clone())
        .map_err(|e| ApiError::Internal(format!("stored webhook payload corrupt: {e}")))
}

fn payment_for(
    conn: &mut PgConnection,
    webhook: &PaymentWebhook,
    event: &WireEvent,
) -> Result<BookingPayment, ApiError> {
    payments::find_by_provider_ref(conn, &webhook.provider, &event.intent_id)?.ok_or_else(|| {
        // The intent write may still be racing us; retry will find it.
        ApiError::NotFound(format!("no payment for intent {}", event.intent_id))
    })
}

/// Exponential backoff with a hard cap: `base * 2^attempt`, saturating.
pub fn backoff_delay(attempt: i32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = attempt.clamp(0, 20) as u32;
    let delay = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(cap_ms))
}

/// Cloneable producer handle held in `AppState`.
#[derive(Clone)]
pub struct WebhookQueue {
    tx: mpsc::Sender<Uuid>,
}

impl WebhookQueue {
    pub fn enqueue(&self, webhook_id: Uuid) {
        if let Err(err) = self.tx.try_send(webhook_id) {
            // The row is persisted; the sweeper's requeue pass picks it up.
            tracing::warn!("webhook queue unavailable, deferring {webhook_id}: {err}");
        }
    }
}

pub struct WebhookWorker {
    handle: JoinHandle<()>,
}

impl WebhookWorker {
    pub async fn stop(self) {
        if let Err(err) = self.handle.await {
            tracing::error!("webhook worker terminated abnormally: {err}");
        }
    }
}

pub fn channel(capacity: usize) -> (WebhookQueue, mpsc::Receiver<Uuid>) {
    let (tx, rx) = mpsc::channel(capacity);
    (WebhookQueue { tx }, rx)
}

/// Drain the queue, reconciling each event with retry/backoff. The worker
/// exits once every producer handle is dropped and the queue is drained.
pub fn spawn_worker(
    pool: DbPool,
    config: PaymentsConfig,
    notifications: NotificationQueue,
    mut rx: mpsc::Receiver<Uuid>,
) -> WebhookWorker {
    let handle = tokio::spawn(async move {
        while let Some(webhook_id) = rx.recv().await {
            if let Err(err) = reconcile(&pool, &config, &notifications, webhook_id).await {
                tracing::error!(%webhook_id, "webhook reconciliation aborted: {err}");
            }
        }
        tracing::debug!("webhook queue drained");
    });
    WebhookWorker { handle }
}

async fn reconcile(
    pool: &DbPool,
    config: &PaymentsConfig,
    notifications: &NotificationQueue,
    webhook_id: Uuid,
) -> Result<(), ApiError> {
    loop {
        let webhook: PaymentWebhook = {
            let mut conn = pool.get()?;
            payment_webhooks::table
                .find(webhook_id)
                .select(PaymentWebhook::as_select())
                .first(&mut conn)?
        };
        if webhook.processed_at.is_some() || webhook.permanently_failed {
            return Ok(());
        }

        let attempt_result = {
            let mut conn = pool.get()?;
            process_event(&mut conn, notifications, &webhook)
        };
        match attempt_result {
            Ok(()) => {
                let mut conn = pool.get()?;
                diesel::update(payment_webhooks::table.find(webhook_id))
                    .set((
                        payment_webhooks::processed_at.eq(Some(Utc::now())),
                        payment_webhooks::last_error.eq(None::<String>),
                    ))
                    .execute(&mut conn)?;
                return Ok(());
            }
            Err(err) => {
                let attempts = webhook.retry_count + 1;
                let exhausted = attempts >= config.webhook_max_retries;
                {
                    let mut conn = pool.get()?;
                    diesel::update(payment_webhooks::table.find(webhook_id))
                        .set((
                            payment_webhooks::retry_count.eq(attempts),
                            payment_webhooks::last_error.eq(Some(err.to_string())),
                            payment_webhooks::permanently_failed.eq(exhausted),
                        ))
                        .execute(&mut conn)?;
                }
                if exhausted {
                    tracing::error!(
                        %webhook_id,
                        attempts,
                        "webhook permanently failed: {err}"
                    );
                    notifications.enqueue(Notification::WebhookDeadLettered {
                        webhook_id,
                        provider: webhook.provider.clone(),
                    });
                    return Ok(());
                }
                tracing::warn!(%webhook_id, attempts, "webhook attempt failed, backing off: {err}");
                tokio::time::sleep(backoff_delay(
                    attempts,
                    config.webhook_backoff_base_ms,
                    config.webhook_backoff_cap_ms,
                ))
                .await;
            }
        }
    }
}

/// Requeue persisted-but-unprocessed events, e.g. after a crash or a full
/// queue at receive time. Called by the sweeper.
pub fn requeue_unprocessed(
    conn: &mut PgConnection,
    queue: &WebhookQueue,
    older_than: DateTime<Utc>,
    limit: i64,
) -> Result<usize, ApiError> {
    let ids: Vec<Uuid> = payment_webhooks::table
        .filter(payment_webhooks::processed_at.is_null())
        .filter(payment_webhooks::permanently_failed.eq(false))
        .filter(payment_webhooks::created_at.lt(older_than))
        .order(payment_webhooks::created_at.asc())
        .limit(limit)
        .select(payment_webhooks::id)
        .load(conn)?;
    let count = ids.len();
    for id in ids {
        queue.enqueue(id);
    }
    Ok(count)
}
