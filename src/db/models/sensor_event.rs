//! Raw sensor observations.
//!
//! Events are written by the sync job. A reading is identified by its sensor,
//! data type and timestamp, so a re-fetched reading overwrites its payload. The
//! aggregator only reads them.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Measurement,
    Activity,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Measurement => "measurement",
            EventKind::Activity => "activity",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "measurement" => Ok(EventKind::Measurement),
            "activity" => Ok(EventKind::Activity),
            other => Err(anyhow!("unknown event type {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Weight,
    Activity,
    Sleep,
    Workout,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Weight => "weight",
            DataType::Activity => "activity",
            DataType::Sleep => "sleep",
            DataType::Workout => "workout",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "weight" => Ok(DataType::Weight),
            "activity" => Ok(DataType::Activity),
            "sleep" => Ok(DataType::Sleep),
            "workout" => Ok(DataType::Workout),
            other => Err(anyhow!("unknown data type {other}")),
        }
    }
}

/// Sparse numeric readings carried by an event. Every field is optional, and a
/// value of the wrong JSON type reads back as absent instead of failing the row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub fat_mass: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub muscle_mass: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub steps: Option<f64>,
    /// Meters.
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub soft: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub moderate: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub intense: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub hr_average: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub hr_min: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub hr_max: Option<f64>,
    /// Seconds.
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub sleep_duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub sleep_deep: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub sleep_light: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub sleep_rem: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub wakeup_duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub sleep_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub rr_average: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub sport_type: Option<String>,
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_f64()))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_str().map(str::to_string)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorEvent {
    pub id: String,
    pub user_id: String,
    pub sensor_id: String,
    pub event_type: EventKind,
    pub data_type: DataType,
    /// Time reported by the sensor, whole seconds.
    pub timestamp: DateTime<Utc>,
    pub data: SensorPayload,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl SensorEvent {
    pub fn new(
        user_id: impl Into<String>,
        sensor_id: impl Into<String>,
        event_type: EventKind,
        data_type: DataType,
        timestamp: DateTime<Utc>,
        data: SensorPayload,
        metadata: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            sensor_id: sensor_id.into(),
            event_type,
            data_type,
            timestamp: timestamp.trunc_subsecs(0),
            data,
            metadata,
            created_at: Utc::now(),
        }
    }
}
