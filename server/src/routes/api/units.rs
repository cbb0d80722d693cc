//! Unit and capacity group endpoints
//!
//! Read-only views of the registry; units change only through reservations.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use standctl_database::{queries, UnitFilter};
use tracing::instrument;

use super::{ApiError, ApiQuery, ApiResult};
use crate::state::AppState;

/// Create units router
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_units))
        .route("/{id}", get(get_unit))
}

/// Create capacity groups router
pub fn group_routes() -> Router<AppState> {
    Router::new().route("/", get(list_groups))
}

/// List units, optionally filtered by kind, type, status or group
#[instrument(skip(state))]
async fn list_units(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<UnitFilter>,
) -> ApiResult<impl IntoResponse> {
    let units = queries::list_units(state.pool(), &filter)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(json!({ "units": units })))
}

/// Get unit by ID
#[instrument(skip(state))]
async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let unit = queries::get_unit(state.pool(), &id)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(unit))
}

/// List capacity groups with their member and lease counts
#[instrument(skip(state))]
async fn list_groups(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let groups = queries::list_groups(state.pool())
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    let groups: Vec<_> = groups
        .into_iter()
        .map(|g| {
            json!({
                "id": g.id,
                "capacity": g.capacity,
                "members": g.members,
                "leased": g.leased,
                "headroom": g.headroom(),
            })
        })
        .collect();

    Ok(Json(json!({ "groups": groups })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{app, send};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_list_units_with_filter() {
        let (app, _lanes) = app().await;

        let (status, body) = send(&app, "GET", "/v1/units", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["units"].as_array().unwrap().len(), 4);

        let (status, body) = send(&app, "GET", "/v1/units?kind=pin&group=gpio-a", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = body["units"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["pin-1", "pin-2"]);
    }

    #[tokio::test]
    async fn test_get_unit() {
        let (app, _lanes) = app().await;

        let (status, body) = send(&app, "GET", "/v1/units/dut-02", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "device");
        assert_eq!(body["status"], "available");
        assert_eq!(body["ssh_port"], 2222);

        let (status, body) = send(&app, "GET", "/v1/units/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_list_groups() {
        let (app, _lanes) = app().await;

        let (status, body) = send(&app, "GET", "/v1/groups", None).await;
        assert_eq!(status, StatusCode::OK);
        let group = &body["groups"][0];
        assert_eq!(group["id"], "gpio-a");
        assert_eq!(group["members"], 2);
        assert_eq!(group["leased"], 0);
        assert_eq!(group["headroom"], 2);
    }
}
