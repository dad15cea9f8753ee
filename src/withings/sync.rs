//! Pulls Withings data into the event store.
//!
//! `SyncRunner` is shared between the scheduler and the HTTP handlers. Only one
//! sync runs at a time; a second caller gets [`SyncOutcome::Skipped`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::aggregation::{AggregationSummary, Aggregator};
use crate::db::{Database, Sensor, SensorEvent, SensorSummary};
use crate::{log_info, log_warn};

use super::client::{Resource, WithingsClient};
use super::parse::{parse_activity_days, parse_sleep_summaries, parse_weight_groups, ParsedReading};

const ENABLE_LOGS: bool = true;

pub const PROVIDER: &str = "withings";
const SENSOR_NAME: &str = "Withings Account";
const SENSOR_TYPE: &str = "health_tracker";

/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

const MEASURE_TYPE_WEIGHT: &str = "1";
const CATEGORY_REAL: &str = "1";

fn default_history_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default()
}

fn full_sync_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2017, 9, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SyncCounts {
    pub weight: usize,
    pub activity: usize,
    pub sleep: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncCounts),
    /// Another sync was already in flight.
    Skipped,
    /// The user has no active Withings sensor.
    NotConnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub syncing: bool,
    pub sensor: Option<SensorSummary>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SyncRunner {
    db: Database,
    client: WithingsClient,
    aggregator: Aggregator,
    in_flight: Arc<AtomicBool>,
}

impl SyncRunner {
    pub fn new(db: Database, client: WithingsClient, aggregator: Aggregator) -> Self {
        Self {
            db,
            client,
            aggregator,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(&self) -> &WithingsClient {
        &self.client
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(&self.in_flight))
    }

    /// Fetches everything newer than the sensor's last sync.
    pub async fn sync(&self, user_id: &str) -> Result<SyncOutcome> {
        let Some(_guard) = self.begin() else {
            log_warn!("Withings sync already running, skipping");
            return Ok(SyncOutcome::Skipped);
        };

        let Some(sensor) = self.db.get_active_sensor(user_id, PROVIDER).await? else {
            return Ok(SyncOutcome::NotConnected);
        };
        let since = sensor.last_sync;
        let counts = self.pull(&sensor, since).await?;
        Ok(SyncOutcome::Completed(counts))
    }

    /// Drops every event and aggregate of the user, re-imports the whole
    /// history and re-aggregates.
    pub async fn full_sync(&self, user_id: &str) -> Result<SyncOutcome> {
        let Some(_guard) = self.begin() else {
            log_warn!("Withings sync already running, skipping full sync");
            return Ok(SyncOutcome::Skipped);
        };

        let Some(sensor) = self.db.get_active_sensor(user_id, PROVIDER).await? else {
            return Ok(SyncOutcome::NotConnected);
        };
        let events = self.db.delete_sensor_events_for_user(user_id).await?;
        let aggregates = self.db.delete_sensor_aggregates_for_user(user_id).await?;
        log_info!(
            "Full sync for {}: removed {} events and {} aggregates",
            user_id,
            events,
            aggregates
        );

        let counts = self.pull(&sensor, Some(full_sync_start())).await?;
        let stored = self.db.count_sensor_events(user_id).await?;
        log_info!("Full sync for {} stored {} events", user_id, stored);
        let summary: AggregationSummary = self
            .aggregator
            .aggregate_all_periods(user_id)
            .await
            .context("aggregation after full sync failed")?;
        log_info!(
            "Full sync for {} re-aggregated {} weeks, {} months, {} years",
            user_id,
            summary.weeks,
            summary.months,
            summary.years
        );
        Ok(SyncOutcome::Completed(counts))
    }

    pub async fn status(&self, user_id: &str) -> Result<ConnectionStatus> {
        let sensor = self.db.get_active_sensor(user_id, PROVIDER).await?;
        Ok(ConnectionStatus {
            connected: sensor.is_some(),
            syncing: self.is_syncing(),
            sensor: sensor.map(|sensor| SensorSummary::from_sensor(&sensor, Utc::now())),
        })
    }

    pub async fn disconnect(&self, user_id: &str) -> Result<usize> {
        let deactivated = self.db.deactivate_sensors(user_id, PROVIDER).await?;
        log_info!("Disconnected {} withings sensor(s) for {}", deactivated, user_id);
        Ok(deactivated)
    }

    /// Exchanges an OAuth code and stores the resulting sensor as the user's
    /// active Withings connection.
    pub async fn connect(&self, user_id: &str, code: &str) -> Result<Sensor> {
        let grant = self.client.exchange_code(code).await?;
        let now = Utc::now();
        let credentials = grant.credentials(now.timestamp());

        let sensor = Sensor {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            provider: PROVIDER.to_string(),
            name: SENSOR_NAME.to_string(),
            sensor_type: SENSOR_TYPE.to_string(),
            credentials: credentials.encode()?,
            config: json!({
                "userId": grant.withings_user_id,
                "expiresAt": credentials.expires_at,
                "scope": grant.scope,
            }),
            is_active: true,
            last_sync: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_sensor(&sensor).await?;
        log_info!("Connected withings sensor {} for {}", sensor.id, user_id);
        Ok(sensor)
    }

    /// Returns a usable access token, refreshing and persisting new credentials
    /// when the current ones are within the expiry buffer.
    async fn access_token(&self, sensor: &Sensor) -> Result<String> {
        let credentials = sensor.credentials()?;
        let now = Utc::now();
        if !credentials.expires_within(now.timestamp(), TOKEN_EXPIRY_BUFFER_SECS) {
            return Ok(credentials.access_token);
        }

        log_info!("Refreshing withings token for sensor {}", sensor.id);
        let grant = self.client.refresh_token(&credentials.refresh_token).await?;
        let refreshed = grant.credentials(now.timestamp());
        self.db
            .update_sensor_credentials(&sensor.id, &refreshed, now)
            .await?;
        Ok(refreshed.access_token)
    }

    async fn pull(&self, sensor: &Sensor, since: Option<DateTime<Utc>>) -> Result<SyncCounts> {
        let access_token = self.access_token(sensor).await?;
        let started_at = Utc::now();
        let today = started_at.date_naive().format("%Y-%m-%d").to_string();
        let start_ymd = since
            .map(|since| since.date_naive())
            .unwrap_or_else(default_history_start)
            .format("%Y-%m-%d")
            .to_string();

        let mut weight_params = vec![
            ("meastype", MEASURE_TYPE_WEIGHT.to_string()),
            ("category", CATEGORY_REAL.to_string()),
        ];
        if let Some(since) = since {
            weight_params.push(("startdate", since.timestamp().to_string()));
        }
        let day_params = vec![
            ("startdateymd", start_ymd),
            ("enddateymd", today),
        ];

        let weights = self
            .client
            .fetch_all(&access_token, Resource::Measurements, &weight_params)
            .await
            .context("failed to fetch withings measurements")?;
        let activities = self
            .client
            .fetch_all(&access_token, Resource::Activity, &day_params)
            .await
            .context("failed to fetch withings activity")?;
        let sleeps = self
            .client
            .fetch_all(&access_token, Resource::Sleep, &day_params)
            .await
            .context("failed to fetch withings sleep")?;

        let counts = SyncCounts {
            weight: self.store(sensor, parse_weight_groups(&weights)).await?,
            activity: self.store(sensor, parse_activity_days(&activities)).await?,
            sleep: self.store(sensor, parse_sleep_summaries(&sleeps)).await?,
        };

        self.db
            .update_sensor_last_sync(&sensor.id, Some(started_at), Utc::now())
            .await?;
        log_info!(
            "Withings sync for {}: {} weight, {} activity, {} sleep",
            sensor.user_id,
            counts.weight,
            counts.activity,
            counts.sleep
        );
        Ok(counts)
    }

    async fn store(&self, sensor: &Sensor, readings: Vec<ParsedReading>) -> Result<usize> {
        let events = readings
            .into_iter()
            .map(|reading| {
                SensorEvent::new(
                    sensor.user_id.clone(),
                    sensor.id.clone(),
                    reading.event_type,
                    reading.data_type,
                    reading.timestamp,
                    reading.data,
                    json!({"source": PROVIDER, "raw": reading.metadata}),
                )
            })
            .collect();
        self.db.insert_sensor_events(events).await
    }
}
