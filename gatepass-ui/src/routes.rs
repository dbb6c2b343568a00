//! HTTP route handlers for the dashboard API.
//!
//! Credentials arrive in request bodies and go straight to the controller;
//! no response ever carries them back.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use gatepass::control::StatusSnapshot;
use gatepass::core::errors::ConfigError;
use gatepass::credentials::Credentials;
use gatepass::io::config::{ScheduleConfig, Settings, load_settings, write_settings};
use gatepass::io::form_profile::{FormProfile, load_form_profile, write_form_profile};
use gatepass::retry::SlotBusy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/form-profile", get(get_form_profile).put(put_form_profile))
        .route("/schedule/arm", post(arm_schedule))
        .route("/schedule/disarm", post(disarm_schedule))
        .route("/fire", post(fire_now))
        .route("/passcode", post(submit_passcode))
        .route("/stop", post(stop))
}

/// Error response with a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(err: &anyhow::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("{err:#}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = if err.downcast_ref::<ConfigError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if err.downcast_ref::<SlotBusy>().is_some() {
            StatusCode::CONFLICT
        } else {
            warn!(error = %format!("{err:#}"), "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - orchestrator status, next fire time and last run.
async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.controller.snapshot())
}

/// GET /api/settings
async fn get_settings(State(state): State<AppState>) -> ApiResult<Settings> {
    Ok(Json(load_settings(&state.paths.settings_path)?))
}

/// PUT /api/settings - validate and persist. Applies from the next trigger.
async fn put_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> ApiResult<Settings> {
    write_settings(&state.paths.settings_path, &settings)?;
    info!("settings saved");
    Ok(Json(settings))
}

/// GET /api/form-profile
async fn get_form_profile(State(state): State<AppState>) -> ApiResult<FormProfile> {
    Ok(Json(load_form_profile(&state.paths.form_profile_path)?))
}

/// PUT /api/form-profile
async fn put_form_profile(
    State(state): State<AppState>,
    Json(profile): Json<FormProfile>,
) -> ApiResult<FormProfile> {
    write_form_profile(&state.paths.form_profile_path, &profile)?;
    info!("form profile saved");
    Ok(Json(profile))
}

/// Portal login typed into the dashboard.
#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

impl LoginRequest {
    fn into_credentials(self) -> Credentials {
        Credentials::new(self.username, self.password)
    }
}

#[derive(Deserialize)]
struct ArmRequest {
    #[serde(flatten)]
    login: LoginRequest,
    /// Falls back to the stored schedule.
    #[serde(default)]
    schedule: Option<ScheduleConfig>,
}

#[derive(Debug, Serialize)]
struct ArmResponse {
    next_fire_at: DateTime<Utc>,
}

/// POST /api/schedule/arm
async fn arm_schedule(
    State(state): State<AppState>,
    Json(request): Json<ArmRequest>,
) -> ApiResult<ArmResponse> {
    let schedule = match request.schedule {
        Some(schedule) => schedule,
        None => load_settings(&state.paths.settings_path)?.schedule,
    };
    let next_fire_at = state
        .controller
        .arm_schedule(schedule, request.login.into_credentials())?;
    Ok(Json(ArmResponse { next_fire_at }))
}

/// POST /api/schedule/disarm - future triggers only; a running cycle finishes.
async fn disarm_schedule(State(state): State<AppState>) -> Json<Value> {
    let disarmed = state.controller.disarm_schedule();
    Json(json!({ "disarmed": disarmed }))
}

/// POST /api/fire - start a manual cycle. Returns as soon as it is running;
/// progress arrives over `/events`.
async fn fire_now(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    // The cycle reports through the event sinks; the handle is not needed.
    let _cycle = state.controller.fire_now(request.into_credentials())?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "started": true }))))
}

#[derive(Deserialize)]
struct PasscodeRequest {
    code: String,
}

/// POST /api/passcode
async fn submit_passcode(
    State(state): State<AppState>,
    Json(request): Json<PasscodeRequest>,
) -> ApiResult<Value> {
    state
        .controller
        .submit_passcode(&request.code)
        .map_err(|err| ApiError::bad_request(&err))?;
    Ok(Json(json!({ "accepted": true })))
}

/// POST /api/stop - disarm the schedule and cancel the remaining attempts
/// of the running cycle.
async fn stop(State(state): State<AppState>) -> Json<Value> {
    state.controller.stop();
    Json(json!({ "stopping": true }))
}
