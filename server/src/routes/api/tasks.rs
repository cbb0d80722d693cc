//! Remote-command task endpoints
//!
//! Submission answers immediately with a handle; execution happens on the
//! lanes and is observed by polling the status location.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use standctl_database::TaskFilter;
use standctl_scheduler::JobSpec;
use tracing::{info, instrument};

use super::{ApiError, ApiJson, ApiQuery, ApiResult};
use crate::state::AppState;

/// Create tasks router
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(submit_task))
        .route("/{id}", get(get_task))
        .route("/{id}/cancel", post(cancel_task))
}

/// Queue a task on a leased device
#[instrument(skip(state, spec), fields(unit = %spec.target_unit, transport = %spec.transport))]
async fn submit_task(
    State(state): State<AppState>,
    ApiJson(spec): ApiJson<JobSpec>,
) -> ApiResult<impl IntoResponse> {
    if spec.target_unit.trim().is_empty() {
        return Err(ApiError::bad_request("target_unit must not be empty"));
    }

    let handle = state
        .lab
        .dispatcher
        .submit(spec)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    info!(task_id = %handle.task_id, "Task accepted");

    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, handle.status_location.clone())],
        Json(handle),
    ))
}

/// List tasks, optionally by state or unit
#[instrument(skip(state))]
async fn list_tasks(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<TaskFilter>,
) -> ApiResult<impl IntoResponse> {
    let tasks = state
        .lab
        .dispatcher
        .list(&filter)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    let tasks: Vec<_> = tasks
        .into_iter()
        .map(|t| {
            json!({
                "id": t.id,
                "unit_id": t.unit_id,
                "transport": t.transport_str,
                "operation": t.operation,
                "state": t.state_str,
                "attempts": t.attempts,
                "max_retries": t.max_retries,
                "created_at": t.created_at,
                "finished_at": t.finished_at,
            })
        })
        .collect();

    Ok(Json(json!({ "tasks": tasks })))
}

/// Task status, result and transition history
#[instrument(skip(state))]
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .lab
        .dispatcher
        .status(&id)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(status))
}

/// Cancel a task that has not started running
#[instrument(skip(state))]
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .lab
        .dispatcher
        .cancel(&id)
        .await
        .map_err(|e| ApiError::from_error(&e))?;

    Ok(Json(status))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{app, send};
    use axum::http::StatusCode;
    use serde_json::{json, Value};
    use standctl_core::TransportKind;

    async fn reserve_all_devices(app: &axum::Router) {
        let (status, _) = send(
            app,
            "POST",
            "/v1/reservations",
            Some(json!({ "requester": "ci", "requested_counts": { "tedix-v1-02": 2 } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    fn serial_read(unit: &str) -> Value {
        json!({
            "target_unit": unit,
            "transport": "serial",
            "operation": { "kind": "write_then_read", "text": "uname -a\n" }
        })
    }

    #[tokio::test]
    async fn test_submit_poll_and_cancel() {
        let (app, mut lanes) = app().await;
        reserve_all_devices(&app).await;

        let (status, body) = send(&app, "POST", "/v1/tasks", Some(serial_read("dut-01"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["task_id"].as_str().unwrap().to_string();
        assert_eq!(body["status_location"], format!("/api/v1/tasks/{}", task_id));

        // Queued on the serial lane only
        let mut serial = lanes.take(TransportKind::Serial).unwrap();
        let job = serial.try_recv().unwrap();
        assert_eq!(job.task_id, task_id);
        assert_eq!(job.attempt, 0);
        assert!(lanes.take(TransportKind::Shell).unwrap().try_recv().is_err());

        let (status, body) = send(&app, "GET", &format!("/v1/tasks/{}", task_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "PENDING");
        assert_eq!(body["attempts"], 0);
        assert_eq!(body["history"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", "/v1/tasks?state=PENDING&unit=dut-01", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"].as_array().unwrap().len(), 1);
        assert_eq!(body["tasks"][0]["operation"], "write_then_read");

        let (status, body) =
            send(&app, "POST", &format!("/v1/tasks/{}/cancel", task_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "CANCELLED");

        // Terminal tasks cannot be cancelled again
        let (status, _) = send(&app, "POST", &format!("/v1/tasks/{}/cancel", task_id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_rejections() {
        let (app, _lanes) = app().await;

        // Not reserved yet
        let (status, body) = send(&app, "POST", "/v1/tasks", Some(serial_read("dut-01"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "RESOURCE_NOT_LEASED");

        reserve_all_devices(&app).await;

        // dut-02 has no serial binding
        let (status, _) = send(&app, "POST", "/v1/tasks", Some(serial_read("dut-02"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // exec is a shell operation
        let (status, _) = send(
            &app,
            "POST",
            "/v1/tasks",
            Some(json!({
                "target_unit": "dut-01",
                "transport": "serial",
                "operation": { "kind": "exec", "command": "uptime" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/v1/tasks", Some(serial_read("dut-99"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", "/v1/tasks", Some(serial_read(" "))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/v1/tasks/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
