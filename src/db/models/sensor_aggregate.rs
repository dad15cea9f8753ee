//! Pre-computed rollups over one calendar bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::SensorMetrics;
use crate::periods::PeriodKind;

/// One row per (user, period, period key). Fully derived from `sensor_events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorAggregate {
    pub user_id: String,
    pub period: PeriodKind,
    pub period_key: String,
    pub year: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub metrics: SensorMetrics,
    pub event_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
