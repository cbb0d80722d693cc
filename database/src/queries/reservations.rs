//! Reservation queries

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, SqliteExecutor};
use standctl_core::{Error, RequestedCounts, Result};
use tracing::instrument;

use crate::models::{Reservation, ReservationWithUnits};

const RESERVATION_COLUMNS: &str =
    "id, requester, requested_counts, status, created_at, expires_at, released_at";

/// Insert a new ACTIVE reservation together with its unit history rows
#[instrument(skip(conn, requested_counts))]
pub async fn insert_reservation(
    conn: &mut SqliteConnection,
    id: &str,
    requester: &str,
    requested_counts: &RequestedCounts,
    unit_ids: &[String],
    expires_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let counts = serde_json::to_string(requested_counts)?;

    sqlx::query(
        r#"
        INSERT INTO reservations (id, requester, requested_counts, status, created_at, expires_at)
        VALUES (?, ?, ?, 'active', ?, ?)
        "#,
    )
    .bind(id)
    .bind(requester)
    .bind(counts)
    .bind(Utc::now())
    .bind(expires_at)
    .execute(&mut *conn)
    .await
    .context("Failed to insert reservation")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    for unit_id in unit_ids {
        sqlx::query("INSERT INTO reservation_units (reservation_id, unit_id) VALUES (?, ?)")
            .bind(id)
            .bind(unit_id)
            .execute(&mut *conn)
            .await
            .context("Failed to record reserved unit")
            .map_err(|e| Error::DatabaseError(e.to_string()))?;
    }

    Ok(())
}

/// Compare-and-set ACTIVE -> RELEASED. Returns false if the reservation was not active.
#[instrument(skip(executor))]
pub async fn mark_reservation_released<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: &str,
    released_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE reservations
        SET status = 'released', released_at = ?
        WHERE id = ? AND status = 'active'
        "#,
    )
    .bind(released_at)
    .bind(id)
    .execute(executor)
    .await
    .context("Failed to release reservation")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.rows_affected() == 1)
}

/// Units a reservation was created with
#[instrument(skip(executor))]
pub async fn reservation_unit_ids<'e, E: SqliteExecutor<'e>>(
    executor: E,
    reservation_id: &str,
) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT unit_id FROM reservation_units
        WHERE reservation_id = ?
        ORDER BY unit_id
        "#,
    )
    .bind(reservation_id)
    .fetch_all(executor)
    .await
    .context("Failed to list reservation units")
    .map_err(|e| Error::DatabaseError(e.to_string()))
}

/// Get reservation row by ID
#[instrument(skip(executor))]
pub async fn get_reservation_row<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: &str,
) -> Result<Reservation> {
    sqlx::query_as::<_, Reservation>(&format!(
        "SELECT {} FROM reservations WHERE id = ?",
        RESERVATION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
    .context("Failed to get reservation")
    .map_err(|e| Error::DatabaseError(e.to_string()))?
    .ok_or_else(|| Error::ReservationNotFound(format!("reservation '{}'", id)))
}

/// Get reservation by ID with its units
#[instrument(skip(pool))]
pub async fn get_reservation(pool: &Pool<Sqlite>, id: &str) -> Result<ReservationWithUnits> {
    let reservation = get_reservation_row(pool, id).await?;
    let units = reservation_unit_ids(pool, id).await?;
    Ok(ReservationWithUnits::new(reservation, units))
}

/// List reservations, newest first. `active_only` hides released ones.
#[instrument(skip(pool))]
pub async fn list_reservations(
    pool: &Pool<Sqlite>,
    active_only: bool,
) -> Result<Vec<ReservationWithUnits>> {
    let rows = sqlx::query_as::<_, Reservation>(&format!(
        "SELECT {} FROM reservations ORDER BY created_at DESC, id",
        RESERVATION_COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list reservations")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    let mut reservations = Vec::with_capacity(rows.len());
    for row in rows {
        if active_only && !row.is_active() {
            continue;
        }
        let units = reservation_unit_ids(pool, &row.id).await?;
        reservations.push(ReservationWithUnits::new(row, units));
    }

    Ok(reservations)
}

/// ACTIVE reservations whose expiry is at or before `now`
#[instrument(skip(pool))]
pub async fn list_expired_reservations(
    pool: &Pool<Sqlite>,
    now: DateTime<Utc>,
) -> Result<Vec<Reservation>> {
    let rows = sqlx::query_as::<_, Reservation>(&format!(
        r#"
        SELECT {} FROM reservations
        WHERE status = 'active' AND expires_at IS NOT NULL
        ORDER BY expires_at
        "#,
        RESERVATION_COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list expiring reservations")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(rows.into_iter().filter(|r| r.is_expired_at(now)).collect())
}
