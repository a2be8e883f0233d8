use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::AppError;
use crate::models::NewIdempotencyRecord;
use crate::schema::idempotency_keys;

#[derive(Debug, Clone)]
pub enum Begin {
    /// This caller won the key and must execute the operation.
    Fresh,
    /// Another executor holds the key and has not completed yet.
    InFlight,
    /// The operation already completed; replay the cached response.
    Done(serde_json::Value),
}

/// Reserves `key` for the current request. The insert-on-conflict-do-nothing
/// is the atomic check-and-set: exactly one concurrent caller sees `Fresh`.
/// Runs outside the business transaction so the reservation is visible to
/// concurrent requests immediately.
pub async fn begin(
    conn: &mut AsyncPgConnection,
    key: &str,
    ttl_secs: i64,
) -> Result<Begin, AppError> {
    // Lazy expiry: reclaim dead keys before attempting the reservation.
    diesel::delete(idempotency_keys::table.filter(idempotency_keys::expires_at.lt(Utc::now())))
        .execute(conn)
        .await?;

    let record = NewIdempotencyRecord {
        key: key.to_string(),
        response: None,
        expires_at: Utc::now() + Duration::seconds(ttl_secs),
    };
    let inserted = diesel::insert_into(idempotency_keys::table)
        .values(&record)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;

    if inserted == 1 {
        return Ok(Begin::Fresh);
    }

    let cached: Option<Option<serde_json::Value>> = idempotency_keys::table
        .filter(idempotency_keys::key.eq(key))
        .select(idempotency_keys::response)
        .first(conn)
        .await
        .optional()?;

    match cached {
        Some(Some(response)) => Ok(Begin::Done(response)),
        Some(None) => Ok(Begin::InFlight),
        // The holder released between our insert and the read; let the
        // caller retry rather than guessing.
        None => Ok(Begin::InFlight),
    }
}

/// Caches the successful response for the remainder of the key's lifetime.
pub async fn complete(
    conn: &mut AsyncPgConnection,
    key: &str,
    response: &serde_json::Value,
) -> Result<(), AppError> {
    diesel::update(idempotency_keys::table.filter(idempotency_keys::key.eq(key)))
        .set(idempotency_keys::response.eq(response))
        .execute(conn)
        .await?;
    Ok(())
}

/// Frees the key after a failed execution so a client retry is not wedged
/// behind a reservation that will never complete.
pub async fn release(conn: &mut AsyncPgConnection, key: &str) -> Result<(), AppError> {
    diesel::delete(idempotency_keys::table.filter(idempotency_keys::key.eq(key)))
        .execute(conn)
        .await?;
    Ok(())
}
