//! API routes

pub mod api;

use axum::Router;

use crate::state::AppState;

/// Create main router with all routes
pub fn api_routes(state: AppState) -> Router {
    Router::new().nest("/v1", api::routes()).with_state(state)
}
