//! REST API v1 endpoints
//!
//! ## API Structure
//!
//! ```text
//! /api/v1/
//! ├── health                            GET     Health check
//! ├── units                             GET     List units (kind, unit_type, status, group)
//! │   └── {id}                          GET     Unit details
//! ├── groups                            GET     Capacity groups with usage
//! ├── reservations                      GET     List, POST create
//! │   ├── {id}                          GET     Details, DELETE release
//! │   └── by-unit/{unit_id}             GET     Owning reservation, DELETE release
//! └── tasks                             GET     List (state, unit), POST submit
//!     ├── {id}                          GET     Status and history
//!     └── {id}/cancel                   POST    Cancel a queued task
//! ```

pub mod reservations;
pub mod tasks;
pub mod units;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use standctl_core::Error;
use tracing::{debug, error, instrument};

use crate::state::AppState;

/// Standard API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: ApiErrorDetails,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetails {
    pub code: String,
    pub message: String,
}

/// Error half of every handler result
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

impl ApiError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ApiErrorDetails {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::BAD_REQUEST,
            Json(Self::new("BAD_REQUEST", message)),
        )
    }

    /// Map a domain error onto its HTTP status
    pub fn from_error(e: &Error) -> (StatusCode, Json<Self>) {
        let status = match e {
            Error::ResourceNotFound(_) | Error::ReservationNotFound(_) | Error::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::InsufficientResources(_)
            | Error::AllocationConflict(_)
            | Error::ResourceNotLeased(_) => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %e, category = e.category(), "Request failed");
        } else {
            debug!(error = %e, category = e.category(), "Request rejected");
        }

        (
            status,
            Json(Self::new(&e.category().to_uppercase(), e.to_string())),
        )
    }
}

/// JSON body extractor that rejects with the API error envelope
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiRejection))]
pub struct ApiJson<T>(pub T);

/// Query string extractor that rejects with the API error envelope
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiRejection))]
pub struct ApiQuery<T>(pub T);

/// A request body or query string that could not be decoded
#[derive(Debug)]
pub struct ApiRejection(String);

impl From<JsonRejection> for ApiRejection {
    fn from(rejection: JsonRejection) -> Self {
        Self(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiRejection {
    fn from(rejection: QueryRejection) -> Self {
        Self(rejection.body_text())
    }
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response {
        debug!(reason = %self.0, "Malformed request");
        ApiError::bad_request(self.0).into_response()
    }
}

/// Create the complete v1 API router
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .nest("/units", units::routes())
        .nest("/groups", units::group_routes())
        .nest("/reservations", reservations::routes())
        .nest("/tasks", tasks::routes())
}

/// Health check endpoint
#[instrument(skip(state))]
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Health check requested");
    let lanes = &state.config.lanes;
    Json(json!({
        "status": "ok",
        "service": "standctl",
        "version": env!("CARGO_PKG_VERSION"),
        "lanes": {
            "shell": { "workers": lanes.shell.workers },
            "serial": { "workers": lanes.serial.workers }
        }
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use standctl_database::{
        load_inventory, Database, DeviceSpec, GroupSpec, Inventory, PinSpec, ReservationManager,
    };
    use standctl_scheduler::{Dispatcher, DispatcherConfig, Lanes};
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::state::{AppState, LabContext};

    /// Two devices and two pins sharing one group
    pub fn inventory() -> Inventory {
        Inventory {
            groups: vec![GroupSpec {
                id: "gpio-a".to_string(),
                capacity: 2,
            }],
            devices: vec![
                DeviceSpec {
                    id: "dut-01".to_string(),
                    unit_type: "tedix-v1-02".to_string(),
                    host: Some("10.0.0.11".to_string()),
                    ssh_port: None,
                    serial_port: Some("/dev/ttyUSB0".to_string()),
                    image: Some("dev".to_string()),
                },
                DeviceSpec {
                    id: "dut-02".to_string(),
                    unit_type: "tedix-v1-02".to_string(),
                    host: Some("10.0.0.12".to_string()),
                    ssh_port: Some(2222),
                    serial_port: None,
                    image: Some("release".to_string()),
                },
            ],
            pins: vec![
                PinSpec {
                    id: "pin-1".to_string(),
                    unit_type: "power".to_string(),
                    group: "gpio-a".to_string(),
                    number: Some(1),
                },
                PinSpec {
                    id: "pin-2".to_string(),
                    unit_type: "power".to_string(),
                    group: "gpio-a".to_string(),
                    number: Some(2),
                },
            ],
        }
    }

    /// Router over an in-memory stand. The lanes are returned undrained so
    /// submitted jobs stay queued.
    pub async fn app() -> (Router, Lanes) {
        let database = Database::in_memory().await.unwrap();
        load_inventory(database.pool(), &inventory()).await.unwrap();

        let reservations = ReservationManager::new(database.pool().clone(), None);
        let (dispatcher, lanes) =
            Dispatcher::new(database.pool().clone(), DispatcherConfig::default());

        let state = AppState::new(
            Config::default(),
            LabContext::new(database, reservations, dispatcher),
        );
        (crate::routes::api_routes(state), lanes)
    }

    pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        call(app, request).await
    }

    /// POST a raw JSON body, well-formed or not
    pub async fn send_raw(app: &Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        call(app, request).await
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{app, send, send_raw};
    use super::*;

    #[tokio::test]
    async fn test_health() {
        let (app, _lanes) = app().await;
        let (status, body) = send(&app, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["lanes"]["shell"]["workers"], 4);
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (Error::ReservationNotFound("r".into()), StatusCode::NOT_FOUND),
            (Error::TaskNotFound("t".into()), StatusCode::NOT_FOUND),
            (Error::InsufficientResources("x".into()), StatusCode::CONFLICT),
            (Error::AllocationConflict("x".into()), StatusCode::CONFLICT),
            (Error::ResourceNotLeased("x".into()), StatusCode::CONFLICT),
            (Error::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (Error::DatabaseError("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let (status, Json(body)) = ApiError::from_error(&err);
            assert_eq!(status, expected, "{}", err);
            assert!(!body.success);
            assert_eq!(body.error.code, err.category().to_uppercase());
        }
    }

    #[tokio::test]
    async fn test_malformed_requests_use_error_envelope() {
        let (app, _lanes) = app().await;

        let bodies = [
            ("/v1/reservations", "{not json"),
            ("/v1/reservations", r#"{"requester": "bob"}"#),
            ("/v1/reservations", r#"{"requester": "bob", "requested_counts": {"power": -1}}"#),
            ("/v1/tasks", r#"{"target_unit": "dut-01", "transport": "telnet"}"#),
            ("/v1/tasks", ""),
        ];
        for (uri, raw) in bodies {
            let (status, body) = send_raw(&app, uri, raw).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{} {}", uri, raw);
            assert_eq!(body["success"], false);
            assert_eq!(body["error"]["code"], "BAD_REQUEST");
            assert!(!body["error"]["message"].as_str().unwrap().is_empty());
        }

        let (status, body) = send(&app, "GET", "/v1/tasks?state=BOGUS", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");

        let (status, body) = send(&app, "GET", "/v1/reservations?active=maybe", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }
}
