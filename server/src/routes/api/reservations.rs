//! Reservation endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use standctl_database::CreateReservation;
use tracing::{info, instrument};

use super::{ApiError, ApiJson, ApiQuery, ApiResult};
use crate::state::AppState;

/// Create reservations router
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_reservations).post(create_reservation))
        .route("/{id}", get(get_reservation).delete(release_reservation))
        .route(
            "/by-unit/{unit_id}",
            get(get_reservation_by_unit).delete(release_by_unit),
        )
}

#[derive(Debug, Default, Deserialize)]
struct ListReservationsParams {
    /// Only reservations still holding units
    #[serde(default)]
    active: bool,
}

/// List reservations, newest first
#[instrument(skip(state))]
async fn list_reservations(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ListReservationsParams>,
) -> ApiResult<impl IntoResponse> {
    let reservations = state
        .lab
        .reservations
        .list_reservations(params.active)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(json!({ "reservations": reservations })))
}

/// Lease units for a requester
#[instrument(skip(state, input), fields(requester = %input.requester))]
async fn create_reservation(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<CreateReservation>,
) -> ApiResult<impl IntoResponse> {
    let reservation = state
        .lab
        .reservations
        .create_reservation(&input)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    info!(
        reservation_id = %reservation.id(),
        units = reservation.leased_units.len(),
        "Reservation created"
    );

    Ok((StatusCode::CREATED, Json(reservation)))
}

/// Get reservation by ID
#[instrument(skip(state))]
async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let reservation = state
        .lab
        .reservations
        .get_reservation(&id)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(reservation))
}

/// Get the active reservation holding a unit
#[instrument(skip(state))]
async fn get_reservation_by_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let reservation = state
        .lab
        .reservations
        .get_reservation_by_unit(&unit_id)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(reservation))
}

/// Release a reservation and all of its units
#[instrument(skip(state))]
async fn release_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let reservation = state
        .lab
        .reservations
        .release_reservation(&id)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(reservation))
}

/// Release the reservation holding a unit
#[instrument(skip(state))]
async fn release_by_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let reservation = state
        .lab
        .reservations
        .release_by_unit(&unit_id)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(reservation))
}
