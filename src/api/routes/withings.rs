//! Withings connection and sync endpoints.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::types::ApiError;
use crate::db::SensorSummary;
use crate::withings::{ConnectionStatus, SyncCounts, SyncOutcome};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub synced: SyncCounts,
    pub message: String,
}

fn sync_response(outcome: SyncOutcome, label: &str) -> Result<Json<SyncResponse>, ApiError> {
    match outcome {
        SyncOutcome::Completed(synced) => Ok(Json(SyncResponse {
            success: true,
            message: format!(
                "{label}: {} weight, {} activity, {} sleep records",
                synced.weight, synced.activity, synced.sleep
            ),
            synced,
        })),
        SyncOutcome::Skipped => Err(ApiError::conflict(
            "SYNC_IN_PROGRESS",
            "A Withings sync is already running",
        )),
        SyncOutcome::NotConnected => Err(ApiError::not_found(
            "SENSOR_NOT_CONNECTED",
            "No active Withings sensor found",
        )),
    }
}

/// POST /api/sensors/withings/sync
pub async fn sync(State(state): State<AppState>) -> Result<Json<SyncResponse>, ApiError> {
    let outcome = state
        .sync
        .sync(&state.user_id)
        .await
        .map_err(|err| ApiError::internal(err, "Withings sync failed"))?;
    sync_response(outcome, "Synced")
}

/// POST /api/sensors/withings/full-sync
pub async fn full_sync(State(state): State<AppState>) -> Result<Json<SyncResponse>, ApiError> {
    let outcome = state
        .sync
        .full_sync(&state.user_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to complete full sync"))?;
    sync_response(outcome, "Full sync completed")
}

/// GET /api/sensors/withings/status
pub async fn status(State(state): State<AppState>) -> Result<Json<ConnectionStatus>, ApiError> {
    state
        .sync
        .status(&state.user_id)
        .await
        .map(Json)
        .map_err(|err| ApiError::internal(err, "Failed to get status"))
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

/// POST /api/sensors/withings/disconnect
pub async fn disconnect(
    State(state): State<AppState>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    state
        .sync
        .disconnect(&state.user_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to disconnect"))?;
    Ok(Json(DisconnectResponse { success: true }))
}

/// GET /api/sensors/withings/connect
pub async fn connect(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let url = state
        .sync
        .client()
        .authorize_url(&Uuid::new_v4().to_string())
        .map_err(|err| ApiError::internal(err, "Failed to build authorization url"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub sensor: SensorSummary,
}

/// GET /api/sensors/withings/callback?code=...
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<CallbackResponse>, ApiError> {
    if let Some(error) = query.error {
        return Err(ApiError::bad_request(
            "WITHINGS_AUTH_FAILED",
            format!("Withings authorization failed: {error}"),
        ));
    }
    let code = query
        .code
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("MISSING_CODE", "Missing authorization code"))?;

    let sensor = state
        .sync
        .connect(&state.user_id, &code)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to connect Withings"))?;

    Ok(Json(CallbackResponse {
        success: true,
        sensor: SensorSummary::from_sensor(&sensor, chrono::Utc::now()),
    }))
}
