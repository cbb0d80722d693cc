use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use standctl_core::{RequestedCounts, ReservationStatus};

/// Reservation row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    #[serde(rename = "reservation_id")]
    pub id: String,
    pub requester: String,
    /// JSON object of unit type -> count
    #[sqlx(rename = "requested_counts")]
    #[serde(skip)]
    pub requested_counts_json: String,
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Get status as enum
    pub fn status(&self) -> Option<ReservationStatus> {
        ReservationStatus::from_str(&self.status_str)
    }

    pub fn is_active(&self) -> bool {
        self.status() == Some(ReservationStatus::Active)
    }

    /// Parse the requested counts
    pub fn get_requested_counts(&self) -> RequestedCounts {
        serde_json::from_str(&self.requested_counts_json).unwrap_or_default()
    }

    /// Whether the reservation has outlived its TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Reservation together with the units it leased
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationWithUnits {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub requested_counts: RequestedCounts,
    pub leased_units: Vec<String>,
}

impl ReservationWithUnits {
    pub fn new(reservation: Reservation, leased_units: Vec<String>) -> Self {
        let requested_counts = reservation.get_requested_counts();
        Self {
            reservation,
            requested_counts,
            leased_units,
        }
    }

    pub fn id(&self) -> &str {
        &self.reservation.id
    }
}

/// Input for creating a reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReservation {
    pub requester: String,
    pub requested_counts: RequestedCounts,
    /// Lifetime in seconds; falls back to the configured default
    pub ttl_secs: Option<u64>,
}
