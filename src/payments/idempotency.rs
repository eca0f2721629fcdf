//! Idempotency-key check-then-act for payment operations.
//!
//! A key is `(scope, hash of the normalized request body)`. A `processing`
//! row acts as a short-lived mutual-exclusion lock: concurrent identical
//! requests fail with `Conflict` while one execution is in flight. A
//! `completed` row returns the cached response without re-executing side
//! effects. Rows expire after a bounded TTL, so a crash between
//! `processing` and `completed` is recoverable by retrying once the stuck
//! key lapses.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::shared::error::ApiError;
use crate::shared::models::schema::idempotency_keys;

const STATUS_PROCESSING: &str = "processing";
const STATUS_COMPLETED: &str = "completed";

/// Stable hash of the normalized request body. `serde_json` maps are
/// ordered, so semantically equal bodies hash identically regardless of
/// the field order the client sent.
pub fn request_hash(scope: &str, body: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
pub enum Begin {
    /// No prior execution; the caller now holds the processing lock.
    Fresh(Uuid),
    /// A prior execution finished; its cached response.
    Completed(serde_json::Value),
}

/// Claim the key or report the prior outcome. Runs in its own transaction
/// so the claim is visible to concurrent requests immediately.
pub fn begin(
    conn: &mut PgConnection,
    scope: &str,
    hash: &str,
    ttl: Duration,
) -> Result<Begin, ApiError> {
    conn.transaction::<Begin, ApiError, _>(|conn| {
        let now = Utc::now();

        // Lapsed keys are dead weight; clear them so the insert can claim.
        diesel::delete(
            idempotency_keys::table
                .filter(idempotency_keys::scope.eq(scope))
                .filter(idempotency_keys::request_hash.eq(hash))
                .filter(idempotency_keys::expires_at.lt(now)),
        )
        .execute(conn)?;

        let key_id = Uuid::new_v4();
        let claimed = diesel::insert_into(idempotency_keys::table)
            .values((
                idempotency_keys::id.eq(key_id),
                idempotency_keys::scope.eq(scope),
                idempotency_keys::request_hash.eq(hash),
                idempotency_keys::status.eq(STATUS_PROCESSING),
                idempotency_keys::expires_at.eq(now + ttl),
                idempotency_keys::created_at.eq(now),
            ))
            .on_conflict_do_nothing()
            .execute(conn)?;
        if claimed == 1 {
            return Ok(Begin::Fresh(key_id));
        }

        let existing: (String, Option<serde_json::Value>) = idempotency_keys::table
            .filter(idempotency_keys::scope.eq(scope))
            .filter(idempotency_keys::request_hash.eq(hash))
            .select((idempotency_keys::status, idempotency_keys::response))
            .first(conn)?;
        match (existing.0.as_str(), existing.1) {
            (STATUS_COMPLETED, Some(response)) => Ok(Begin::Completed(response)),
            _ => Err(ApiError::Conflict(
                "an identical request is already in flight".to_string(),
            )),
        }
    })
}

/// Finalize a claimed key with the response to replay to retries. A
/// completed key is never mutated again.
pub fn complete(
    conn: &mut PgConnection,
    key_id: Uuid,
    response: &serde_json::Value,
) -> Result<(), ApiError> {
    diesel::update(
        idempotency_keys::table
            .find(key_id)
            .filter(idempotency_keys::status.eq(STATUS_PROCESSING)),
    )
    .set((
        idempotency_keys::status.eq(STATUS_COMPLETED),
        idempotency_keys::response.eq(Some(response.clone())),
    ))
    .execute(conn)?;
    Ok(())
}

/// Release a claimed key after a *definitive* provider failure, allowing
/// the caller to retry. Never called on timeouts: with an unknown provider
/// outcome the key must stay locked until its TTL lapses, so the same
/// charge is never re-attempted mid-flight.
pub fn release(conn: &mut PgConnection, key_id: Uuid) -> Result<(), ApiError> {
    diesel::delete(
        idempotency_keys::table
            .find(key_id)
            .filter(idempotency_keys::status.eq(STATUS_PROCESSING)),
    )
    .execute(conn)?;
    Ok(())
}

pub fn ttl_from_hours(hours: i64) -> Duration {
    Duration::hours(hours.max(1))
}

/// Purge expired keys; called opportunistically by the sweeper.
pub fn purge_expired(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<usize, ApiError> {
    Ok(diesel::delete(
        idempotency_keys::table.filter(idempotency_keys::expires_at.lt(now)),
    )
    .execute(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_client_field_order() {
        // serde_json maps sort keys, so both parse to the same value.
        let a: serde_json::Value =
            serde_json::from_str(r#"{"amount":3000,"booking_id":"b1","mode":"deposit"}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"mode":"deposit","booking_id":"b1","amount":3000}"#).unwrap();
        assert_eq!(
            request_hash("payments.create_intent", &a),
            request_hash("payments.create_intent", &b)
        );
    }

    #[test]
    fn hash_distinguishes_scope_and_body() {
        let body = json!({"booking_id": "b1", "amount": 3000});
        assert_ne!(
            request_hash("payments.create_intent", &body),
            request_hash("payments.refund", &body)
        );
        assert_ne!(
            request_hash("payments.create_intent", &body),
            request_hash("payments.create_intent", &json!({"booking_id": "b1", "amount": 3001}))
        );
    }
}
