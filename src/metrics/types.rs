use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct WeightMetrics {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
    /// Latest minus first reading in the bucket, 0 for a single reading.
    pub change: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StepsMetrics {
    pub sum: f64,
    pub avg: f64,
    pub max: f64,
}

/// Sleep in hours per recorded night.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SleepMetrics {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TotalMetrics {
    pub sum: f64,
    pub avg: f64,
}

/// Rollup of one bucket. A metric is present only if at least one event
/// contributed a value to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<WeightMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<StepsMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<SleepMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<TotalMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<TotalMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intense_minutes: Option<TotalMetrics>,
}
