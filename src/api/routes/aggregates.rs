//! Aggregation trigger and read endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::types::ApiError;
use crate::db::SensorAggregate;
use crate::periods::{current_bucket, parse_period_key, PeriodKind};
use crate::AppState;

const DEFAULT_LIMIT: usize = 12;
const MAX_LIMIT: usize = 520;

#[derive(Debug, Serialize)]
pub struct AggregateTriggerResponse {
    pub success: bool,
    pub message: String,
}

/// POST /api/sensors/aggregate
pub async fn trigger_aggregation(
    State(state): State<AppState>,
) -> Result<Json<AggregateTriggerResponse>, ApiError> {
    let summary = state
        .aggregator
        .aggregate_all_periods_at(&state.user_id, &state.now())
        .await
        .map_err(|err| ApiError::internal(err, "Failed to aggregate sensor data"))?;

    Ok(Json(AggregateTriggerResponse {
        success: true,
        message: format!(
            "Aggregated {} weeks, {} months, {} years",
            summary.weeks, summary.months, summary.years
        ),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListAggregatesQuery {
    pub period: Option<String>,
    pub limit: Option<usize>,
}

fn parse_kind(value: &str) -> Result<PeriodKind, ApiError> {
    value.parse().map_err(|_| {
        ApiError::bad_request(
            "INVALID_PERIOD",
            format!("Unknown period '{value}'. Use week, month or year."),
        )
    })
}

/// GET /api/sensors/aggregates?period=week&limit=12
pub async fn list_aggregates(
    State(state): State<AppState>,
    Query(query): Query<ListAggregatesQuery>,
) -> Result<Json<Vec<SensorAggregate>>, ApiError> {
    let kind = match query.period.as_deref() {
        Some(period) => parse_kind(period)?,
        None => PeriodKind::Week,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(ApiError::bad_request(
            "INVALID_LIMIT",
            format!("Limit must be between 1 and {MAX_LIMIT}"),
        ));
    }

    let rows = state
        .aggregator
        .list_aggregates(&state.user_id, kind, limit)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load aggregates"))?;
    Ok(Json(rows))
}

/// GET /api/sensors/aggregates/{period}/{key}
///
/// Besides a literal key, `current` resolves to the bucket containing now and
/// `latest` to the most recent stored row.
pub async fn get_aggregate(
    State(state): State<AppState>,
    Path((period, key)): Path<(String, String)>,
) -> Result<Json<SensorAggregate>, ApiError> {
    let kind = parse_kind(&period)?;

    let found = if key == "latest" {
        state.aggregator.latest_aggregate(&state.user_id, kind).await
    } else {
        let key = if key == "current" {
            current_bucket(kind, &state.now())
                .map(|bucket| bucket.key)
                .ok_or_else(|| {
                    ApiError::not_found("AGGREGATE_NOT_FOUND", format!("No current {kind} bucket"))
                })?
        } else {
            parse_period_key(kind, &key)
                .map_err(|err| ApiError::bad_request("INVALID_PERIOD_KEY", err.to_string()))?;
            key.clone()
        };
        state.aggregator.get_aggregate(&state.user_id, kind, &key).await
    };

    found
        .map_err(|err| ApiError::internal(err, "Failed to load aggregate"))?
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found("AGGREGATE_NOT_FOUND", format!("No {kind} aggregate for {key}"))
        })
}
