use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use crate::db::{
    connection::Database,
    helpers::RowExt,
    models::{Sensor, SensorCredentials},
};

const SENSOR_COLUMNS: &str = "id, user_id, provider, name, sensor_type, credentials, config, is_active, last_sync, created_at, updated_at";

fn row_to_sensor(row: &Row) -> Result<Sensor, rusqlite::Error> {
    let config: String = row.get("config")?;
    let is_active: i64 = row.get("is_active")?;

    Ok(Sensor {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        provider: row.get("provider")?,
        name: row.get("name")?,
        sensor_type: row.get("sensor_type")?,
        credentials: row.get("credentials")?,
        config: serde_json::from_str(&config).unwrap_or_else(|_| Value::Object(Default::default())),
        is_active: is_active != 0,
        last_sync: row.optional_timestamp("last_sync")?,
        created_at: row.timestamp("created_at")?,
        updated_at: row.timestamp("updated_at")?,
    })
}

impl Database {
    /// Stores a newly connected sensor. Any other active sensor of the same
    /// provider for the user is deactivated first.
    pub async fn insert_sensor(&self, sensor: &Sensor) -> Result<()> {
        let record = sensor.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE sensors SET is_active = 0, updated_at = ?1
                 WHERE user_id = ?2 AND provider = ?3 AND is_active = 1",
                params![record.updated_at.to_rfc3339(), record.user_id, record.provider],
            )?;
            let config =
                serde_json::to_string(&record.config).context("failed to serialize sensor config")?;
            tx.execute(
                "INSERT INTO sensors (id, user_id, provider, name, sensor_type, credentials, config, is_active, last_sync, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.user_id,
                    record.provider,
                    record.name,
                    record.sensor_type,
                    record.credentials,
                    config,
                    record.is_active as i64,
                    record.last_sync.map(|dt| dt.to_rfc3339()),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            tx.commit().context("failed to commit sensor insert")?;
            Ok(())
        })
        .await
    }

    pub async fn get_active_sensor(&self, user_id: &str, provider: &str) -> Result<Option<Sensor>> {
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SENSOR_COLUMNS}
                 FROM sensors
                 WHERE user_id = ?1 AND provider = ?2 AND is_active = 1
                 ORDER BY created_at DESC
                 LIMIT 1"
            ))?;

            let sensor = stmt
                .query_row(params![user_id, provider], row_to_sensor)
                .optional()?;
            Ok(sensor)
        })
        .await
    }

    /// Persists refreshed tokens and mirrors the expiry into `config.expiresAt`.
    pub async fn update_sensor_credentials(
        &self,
        sensor_id: &str,
        credentials: &SensorCredentials,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let sensor_id = sensor_id.to_string();
        let encoded = credentials.encode()?;
        let expires_at = credentials.expires_at;
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let config: Option<String> = tx
                .query_row(
                    "SELECT config FROM sensors WHERE id = ?1",
                    params![sensor_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(config) = config else {
                return Err(anyhow::anyhow!("Sensor not found"));
            };

            let mut config: Value =
                serde_json::from_str(&config).unwrap_or_else(|_| Value::Object(Default::default()));
            if !config.is_object() {
                config = Value::Object(Default::default());
            }
            config["expiresAt"] = Value::from(expires_at);

            tx.execute(
                "UPDATE sensors
                 SET credentials = ?1,
                     config = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    encoded,
                    serde_json::to_string(&config)?,
                    updated_at.to_rfc3339(),
                    sensor_id,
                ],
            )?;
            tx.commit().context("failed to commit credential update")?;
            Ok(())
        })
        .await
    }

    pub async fn update_sensor_last_sync(
        &self,
        sensor_id: &str,
        last_sync: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let sensor_id = sensor_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sensors
                 SET last_sync = ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                params![
                    last_sync.map(|dt| dt.to_rfc3339()),
                    updated_at.to_rfc3339(),
                    sensor_id
                ],
            )?;

            if rows_affected == 0 {
                return Err(anyhow::anyhow!("Sensor not found"));
            }
            Ok(())
        })
        .await
    }

    /// Deactivates every active sensor of `provider` for the user. Returns how
    /// many were switched off.
    pub async fn deactivate_sensors(&self, user_id: &str, provider: &str) -> Result<usize> {
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sensors
                 SET is_active = 0,
                     updated_at = ?1
                 WHERE user_id = ?2 AND provider = ?3 AND is_active = 1",
                params![Utc::now().to_rfc3339(), user_id, provider],
            )?;
            Ok(rows_affected)
        })
        .await
    }
}
