//! Converts Withings API records into sensor payloads.
//!
//! Records that do not match the expected shape are skipped with a warning.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::{DataType, EventKind, SensorPayload};
use crate::log_warn;

const ENABLE_LOGS: bool = true;

const MEASURE_WEIGHT: i64 = 1;
const MEASURE_FAT_MASS: i64 = 6;
const MEASURE_MUSCLE_MASS: i64 = 76;

/// One reading ready to be stored as a sensor event.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReading {
    pub event_type: EventKind,
    pub data_type: DataType,
    pub timestamp: DateTime<Utc>,
    pub data: SensorPayload,
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
struct Measure {
    value: f64,
    #[serde(rename = "type")]
    kind: i64,
    unit: i32,
}

impl Measure {
    fn scaled(&self) -> f64 {
        self.value * 10f64.powi(self.unit)
    }
}

#[derive(Debug, Deserialize)]
struct MeasureGroup {
    #[serde(default)]
    grpid: Value,
    date: i64,
    #[serde(default)]
    deviceid: Value,
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
struct ActivityDay {
    date: String,
    steps: Option<f64>,
    distance: Option<f64>,
    calories: Option<f64>,
    elevation: Option<f64>,
    soft: Option<f64>,
    moderate: Option<f64>,
    intense: Option<f64>,
    hr_average: Option<f64>,
    hr_min: Option<f64>,
    hr_max: Option<f64>,
    #[serde(default)]
    modified: Value,
}

#[derive(Debug, Default, Deserialize)]
struct SleepData {
    total_sleep_time: Option<f64>,
    deepsleepduration: Option<f64>,
    lightsleepduration: Option<f64>,
    remsleepduration: Option<f64>,
    wakeupduration: Option<f64>,
    sleep_score: Option<f64>,
    hr_average: Option<f64>,
    rr_average: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SleepSummary {
    startdate: i64,
    #[serde(default)]
    enddate: Value,
    #[serde(default)]
    modified: Value,
    #[serde(default)]
    model: Value,
    #[serde(default)]
    data: SleepData,
}

fn decode_all<T: DeserializeOwned>(items: &[Value], what: &str) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
            Ok(record) => Some(record),
            Err(err) => {
                log_warn!("Skipping malformed withings {} record: {}", what, err);
                None
            }
        })
        .collect()
}

fn epoch(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

/// Measure groups that carry a weight (type 1). Fat and muscle mass ride along
/// when present.
pub fn parse_weight_groups(items: &[Value]) -> Vec<ParsedReading> {
    decode_all::<MeasureGroup>(items, "measure group")
        .into_iter()
        .filter_map(|group| {
            let find = |kind: i64| {
                group
                    .measures
                    .iter()
                    .find(|measure| measure.kind == kind)
                    .map(Measure::scaled)
            };
            let weight = find(MEASURE_WEIGHT)?;
            let timestamp = epoch(group.date)?;

            Some(ParsedReading {
                event_type: EventKind::Measurement,
                data_type: DataType::Weight,
                timestamp,
                data: SensorPayload {
                    weight: Some(weight),
                    fat_mass: find(MEASURE_FAT_MASS),
                    muscle_mass: find(MEASURE_MUSCLE_MASS),
                    ..Default::default()
                },
                metadata: json!({"grpid": group.grpid, "deviceid": group.deviceid}),
            })
        })
        .collect()
}

/// Daily activity summaries, stamped at UTC midnight of their date.
pub fn parse_activity_days(items: &[Value]) -> Vec<ParsedReading> {
    decode_all::<ActivityDay>(items, "activity")
        .into_iter()
        .filter_map(|day| {
            let date = match NaiveDate::parse_from_str(&day.date, "%Y-%m-%d") {
                Ok(date) => date,
                Err(err) => {
                    log_warn!("Skipping activity with bad date '{}': {}", day.date, err);
                    return None;
                }
            };

            Some(ParsedReading {
                event_type: EventKind::Activity,
                data_type: DataType::Activity,
                timestamp: date.and_time(NaiveTime::MIN).and_utc(),
                data: SensorPayload {
                    steps: day.steps,
                    distance: day.distance,
                    calories: day.calories,
                    elevation: day.elevation,
                    soft: day.soft,
                    moderate: day.moderate,
                    intense: day.intense,
                    hr_average: day.hr_average,
                    hr_min: day.hr_min,
                    hr_max: day.hr_max,
                    ..Default::default()
                },
                metadata: json!({"modified": day.modified}),
            })
        })
        .collect()
}

pub fn parse_sleep_summaries(items: &[Value]) -> Vec<ParsedReading> {
    decode_all::<SleepSummary>(items, "sleep")
        .into_iter()
        .filter_map(|sleep| {
            let timestamp = epoch(sleep.startdate)?;
            let data = sleep.data;

            Some(ParsedReading {
                event_type: EventKind::Measurement,
                data_type: DataType::Sleep,
                timestamp,
                data: SensorPayload {
                    sleep_duration: data.total_sleep_time,
                    sleep_deep: data.deepsleepduration,
                    sleep_light: data.lightsleepduration,
                    sleep_rem: data.remsleepduration,
                    wakeup_duration: data.wakeupduration,
                    sleep_score: data.sleep_score,
                    hr_average: data.hr_average,
                    rr_average: data.rr_average,
                    ..Default::default()
                },
                metadata: json!({
                    "enddate": sleep.enddate,
                    "modified": sleep.modified,
                    "model": sleep.model,
                }),
            })
        })
        .collect()
}
