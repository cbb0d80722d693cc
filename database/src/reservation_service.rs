//! Reservation manager: leases units to requesters and hands them back

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use standctl_core::allocation::{describe_shortfall, shortfall, validate_request};
use standctl_core::{select_units, Error, Result};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::models::{CreateReservation, ReservationWithUnits, UnitFilter};
use crate::queries::{reservations, units};

/// How many times a select + commit cycle is attempted before giving up
pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Creates and releases reservations against the unit registry
#[derive(Clone)]
pub struct ReservationManager {
    db_pool: Pool<Sqlite>,
    default_ttl: Option<Duration>,
    max_attempts: u32,
}

impl ReservationManager {
    /// Create a new reservation manager
    pub fn new(db_pool: Pool<Sqlite>, default_ttl: Option<Duration>) -> Self {
        Self {
            db_pool,
            default_ttl,
            max_attempts: MAX_COMMIT_ATTEMPTS,
        }
    }

    /// Lease units satisfying the requested counts.
    ///
    /// Either every requested unit is leased to the new reservation or
    /// nothing changes.
    #[instrument(skip(self, request), fields(requester = %request.requester))]
    pub async fn create_reservation(
        &self,
        request: &CreateReservation,
    ) -> Result<ReservationWithUnits> {
        if request.requester.trim().is_empty() {
            return Err(Error::InvalidRequest("requester must not be empty".to_string()));
        }
        validate_request(&request.requested_counts)?;

        // Could the stand satisfy this at all, with every unit free?
        let inventory = units::list_units(&self.db_pool, &UnitFilter::default()).await?;
        let missing = shortfall(&inventory, &request.requested_counts);
        if !missing.is_empty() {
            return Err(Error::InsufficientResources(format!(
                "not enough units on the stand to make this request, check the request and the stand configuration ({})",
                describe_shortfall(&missing)
            )));
        }

        let ttl = request
            .ttl_secs
            .map(Duration::from_secs)
            .or(self.default_ttl);
        expiry(Utc::now(), ttl)?;

        let mut last_conflict = String::new();
        for attempt in 1..=self.max_attempts {
            // Snapshot
            let available =
                units::list_available(&self.db_pool, None, &UnitFilter::default()).await?;
            let headroom = units::group_headroom(&self.db_pool).await?;

            let selected: Vec<String> =
                select_units(&request.requested_counts, &available, &headroom)?
                    .into_iter()
                    .map(|u| u.id.clone())
                    .collect();

            match self.commit(request, &selected, ttl).await {
                Ok(reservation) => {
                    info!(
                        reservation_id = %reservation.id(),
                        units = ?reservation.leased_units,
                        attempt,
                        "Reservation created"
                    );
                    return Ok(reservation);
                }
                Err(Error::AllocationConflict(msg)) => {
                    warn!(attempt, conflict = %msg, "Lease commit lost a race, retrying");
                    last_conflict = msg;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::AllocationConflict(format!(
            "gave up after {} attempts: {}",
            self.max_attempts, last_conflict
        )))
    }

    /// Insert the reservation and lease `selected` in one transaction
    async fn commit(
        &self,
        request: &CreateReservation,
        selected: &[String],
        ttl: Option<Duration>,
    ) -> Result<ReservationWithUnits> {
        let id = uuid::Uuid::new_v4().to_string();
        let expires_at = expiry(Utc::now(), ttl)?;

        let mut tx = self
            .db_pool
            .begin()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        reservations::insert_reservation(
            &mut *tx,
            &id,
            &request.requester,
            &request.requested_counts,
            selected,
            expires_at,
        )
        .await?;

        // Dropping `tx` on any error below rolls everything back
        units::mark_leased(&mut *tx, selected, &id).await?;

        let over = units::groups_over_capacity(&mut *tx).await?;
        if !over.is_empty() {
            return Err(Error::AllocationConflict(format!(
                "capacity groups would be over their bound: {}",
                over.join(", ")
            )));
        }

        tx.commit()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;

        reservations::get_reservation(&self.db_pool, &id).await
    }

    /// Release a reservation and return its units to the pool.
    ///
    /// A reservation that is unknown or already released yields
    /// `ReservationNotFound` and changes nothing.
    #[instrument(skip(self))]
    pub async fn release_reservation(&self, id: &str) -> Result<ReservationWithUnits> {
        self.release_at(id, Utc::now()).await
    }

    async fn release_at(&self, id: &str, now: DateTime<Utc>) -> Result<ReservationWithUnits> {
        let mut tx = self
            .db_pool
            .begin()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        if !reservations::mark_reservation_released(&mut *tx, id, now).await? {
            return Err(Error::ReservationNotFound(format!(
                "no active reservation '{}'",
                id
            )));
        }

        let owned = units::leased_unit_ids(&mut *tx, id).await?;
        let released = units::mark_released(&mut *tx, &owned).await?;

        tx.commit()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;

        info!(reservation_id = %id, released, "Reservation released");
        reservations::get_reservation(&self.db_pool, id).await
    }

    /// Release the whole reservation owning `unit_id`
    #[instrument(skip(self))]
    pub async fn release_by_unit(&self, unit_id: &str) -> Result<ReservationWithUnits> {
        let reservation_id = self.owning_reservation(unit_id).await?;
        self.release_reservation(&reservation_id).await
    }

    /// Get reservation by ID
    pub async fn get_reservation(&self, id: &str) -> Result<ReservationWithUnits> {
        reservations::get_reservation(&self.db_pool, id).await
    }

    /// Active reservation currently holding `unit_id`
    pub async fn get_reservation_by_unit(&self, unit_id: &str) -> Result<ReservationWithUnits> {
        let reservation_id = self.owning_reservation(unit_id).await?;
        reservations::get_reservation(&self.db_pool, &reservation_id).await
    }

    /// List reservations, newest first
    pub async fn list_reservations(&self, active_only: bool) -> Result<Vec<ReservationWithUnits>> {
        reservations::list_reservations(&self.db_pool, active_only).await
    }

    /// Release every ACTIVE reservation whose expiry is at or before `now`
    #[instrument(skip(self))]
    pub async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<ReservationWithUnits>> {
        let expired = reservations::list_expired_reservations(&self.db_pool, now).await?;
        let mut released = Vec::with_capacity(expired.len());

        for reservation in expired {
            match self.release_at(&reservation.id, now).await {
                Ok(r) => released.push(r),
                // Released by its owner in the meantime
                Err(Error::ReservationNotFound(_)) => {
                    debug!(reservation_id = %reservation.id, "Already released");
                }
                Err(e) => return Err(e),
            }
        }

        if !released.is_empty() {
            info!(count = released.len(), "Released expired reservations");
        }

        Ok(released)
    }

    async fn owning_reservation(&self, unit_id: &str) -> Result<String> {
        let unit = units::get_unit(&self.db_pool, unit_id).await?;
        unit.reservation_id.ok_or_else(|| {
            Error::ReservationNotFound(format!("unit '{}' is not reserved", unit_id))
        })
    }
}

/// When a lease taken at `now` for `ttl` runs out
fn expiry(now: DateTime<Utc>, ttl: Option<Duration>) -> Result<Option<DateTime<Utc>>> {
    let Some(ttl) = ttl else {
        return Ok(None);
    };
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map(Some)
        .ok_or_else(|| Error::InvalidRequest(format!("ttl of {}s is out of range", ttl.as_secs())))
}
