use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{invalid_data, RowExt},
    models::{DataType, EventKind, SensorEvent, SensorPayload},
};

const EVENT_COLUMNS: &str =
    "id, user_id, sensor_id, event_type, data_type, timestamp, data, metadata, created_at";

/// Fixed-width UTC text so lexical order in SQLite equals time order.
pub(crate) fn timestamp_text(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn row_to_event(row: &Row) -> Result<SensorEvent, rusqlite::Error> {
    let event_type: String = row.get("event_type")?;
    let data_type: String = row.get("data_type")?;
    let data: String = row.get("data")?;
    let metadata: String = row.get("metadata")?;

    Ok(SensorEvent {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        sensor_id: row.get("sensor_id")?,
        event_type: EventKind::parse(&event_type).map_err(invalid_data)?,
        data_type: DataType::parse(&data_type).map_err(invalid_data)?,
        timestamp: row.timestamp("timestamp")?,
        // A payload that is not even a JSON object reads as empty.
        data: serde_json::from_str::<SensorPayload>(&data).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.timestamp("created_at")?,
    })
}

impl Database {
    /// Writes events in one transaction and returns how many were written.
    ///
    /// An event for a reading already stored (same user, sensor, data type and
    /// timestamp) replaces that row's payload instead of adding a second row.
    pub async fn insert_sensor_events(&self, events: Vec<SensorEvent>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        self.execute(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO sensor_events (id, user_id, sensor_id, event_type, data_type, timestamp, data, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(user_id, sensor_id, data_type, timestamp) DO UPDATE SET
                         event_type = excluded.event_type,
                         data = excluded.data,
                         metadata = excluded.metadata",
                )?;

                for event in &events {
                    let data = serde_json::to_string(&event.data)
                        .context("failed to serialize event payload")?;
                    let metadata = serde_json::to_string(&event.metadata)
                        .context("failed to serialize event metadata")?;
                    stmt.execute(params![
                        event.id,
                        event.user_id,
                        event.sensor_id,
                        event.event_type.as_str(),
                        event.data_type.as_str(),
                        timestamp_text(&event.timestamp),
                        data,
                        metadata,
                        event.created_at.to_rfc3339(),
                    ])?;
                }
            }
            tx.commit().context("failed to commit sensor events")?;
            Ok(events.len())
        })
        .await
    }

    #[cfg(test)]
    pub async fn insert_sensor_event(&self, event: &SensorEvent) -> Result<()> {
        self.insert_sensor_events(vec![event.clone()]).await.map(|_| ())
    }

    /// Every event of a user, oldest first.
    pub async fn list_sensor_events(&self, user_id: &str) -> Result<Vec<SensorEvent>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS}
                 FROM sensor_events
                 WHERE user_id = ?1
                 ORDER BY timestamp ASC, rowid ASC"
            ))?;

            let events = stmt
                .query_map(params![user_id], row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
        .await
    }

    pub async fn count_sensor_events(&self, user_id: &str) -> Result<u64> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) AS total FROM sensor_events WHERE user_id = ?1",
                params![user_id],
                |row| row.count("total"),
            )?;
            Ok(count)
        })
        .await
    }

    pub async fn delete_sensor_events_for_user(&self, user_id: &str) -> Result<usize> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM sensor_events WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(deleted)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn weight_event(user: &str, ts: DateTime<Utc>, kg: f64) -> SensorEvent {
        SensorEvent::new(
            user,
            "sensor-1",
            EventKind::Measurement,
            DataType::Weight,
            ts,
            SensorPayload {
                weight: Some(kg),
                ..Default::default()
            },
            json!({"grpid": 1}),
        )
    }

    #[tokio::test]
    async fn events_come_back_in_timestamp_order() {
        let (_dir, db) = temp_database();
        let base = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();

        db.insert_sensor_events(vec![
            weight_event("u1", base + Duration::days(2), 71.0),
            weight_event("u1", base, 70.0),
            weight_event("u2", base, 90.0),
            weight_event("u1", base + Duration::days(1), 70.5),
        ])
        .await
        .expect("insert");

        let events = db.list_sensor_events("u1").await.expect("list");
        let weights: Vec<f64> = events.iter().filter_map(|e| e.data.weight).collect();
        assert_eq!(weights, vec![70.0, 70.5, 71.0]);
        assert_eq!(events[0].metadata, json!({"grpid": 1}));
        assert_eq!(db.count_sensor_events("u1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn refetched_reading_replaces_the_stored_row() {
        let (_dir, db) = temp_database();
        let day = Utc.with_ymd_and_hms(2025, 10, 21, 0, 0, 0).unwrap();
        let activity = |steps: f64| {
            SensorEvent::new(
                "u1",
                "sensor-1",
                EventKind::Activity,
                DataType::Activity,
                day,
                SensorPayload {
                    steps: Some(steps),
                    ..Default::default()
                },
                json!({}),
            )
        };

        let first = activity(4000.0);
        db.insert_sensor_event(&first).await.expect("first insert");
        let written = db
            .insert_sensor_events(vec![activity(5000.0), weight_event("u1", day, 70.0)])
            .await
            .expect("second insert");
        assert_eq!(written, 2);

        let events = db.list_sensor_events("u1").await.expect("list");
        assert_eq!(events.len(), 2);
        let stored = events
            .iter()
            .find(|e| e.data_type == DataType::Activity)
            .expect("activity row");
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.data.steps, Some(5000.0));
    }

    #[tokio::test]
    async fn malformed_payload_fields_read_as_absent() {
        let (_dir, db) = temp_database();
        let event = weight_event("u1", Utc::now(), 70.0);
        let id = event.id.clone();
        db.insert_sensor_event(&event).await.expect("insert");

        db.execute(move |conn| {
            conn.execute(
                "UPDATE sensor_events SET data = '{\"weight\": \"n/a\", \"steps\": 12}' WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
        .expect("corrupt payload");

        let events = db.list_sensor_events("u1").await.expect("list");
        assert_eq!(events[0].data.weight, None);
        assert_eq!(events[0].data.steps, Some(12.0));
    }

    #[tokio::test]
    async fn delete_only_touches_the_given_user() {
        let (_dir, db) = temp_database();
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut events: Vec<SensorEvent> = (0..5)
            .map(|day| weight_event("u1", base + Duration::days(day), 70.0 + day as f64))
            .collect();
        events.push(weight_event("u2", base, 80.0));
        db.insert_sensor_events(events).await.expect("insert");

        assert_eq!(db.delete_sensor_events_for_user("u1").await.unwrap(), 5);
        assert_eq!(db.count_sensor_events("u2").await.unwrap(), 1);
        assert_eq!(db.count_sensor_events("u1").await.unwrap(), 0);
    }
}
