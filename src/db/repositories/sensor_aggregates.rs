use std::collections::HashSet;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{invalid_data, to_i64, RowExt},
    models::SensorAggregate,
};
use crate::metrics::SensorMetrics;
use crate::periods::PeriodKind;

use super::sensor_events::timestamp_text;

const AGGREGATE_COLUMNS: &str = "user_id, period, period_key, year, start_date, end_date, metrics, event_count, created_at, updated_at";

fn row_to_aggregate(row: &Row) -> Result<SensorAggregate, rusqlite::Error> {
    let period: String = row.get("period")?;
    let metrics: String = row.get("metrics")?;

    Ok(SensorAggregate {
        user_id: row.get("user_id")?,
        period: period
            .parse::<PeriodKind>()
            .with_context(|| format!("unknown period kind {period}"))
            .map_err(invalid_data)?,
        period_key: row.get("period_key")?,
        year: row.get("year")?,
        start_date: row.timestamp("start_date")?,
        end_date: row.timestamp("end_date")?,
        metrics: serde_json::from_str::<SensorMetrics>(&metrics)
            .context("failed to parse aggregate metrics")
            .map_err(invalid_data)?,
        event_count: row.count("event_count")?,
        created_at: row.timestamp("created_at")?,
        updated_at: row.timestamp("updated_at")?,
    })
}

impl Database {
    /// Inserts the aggregate, or overwrites `metrics`, `event_count` and
    /// `updated_at` of the existing (user, period, key) row. `created_at` of an
    /// existing row is kept.
    pub async fn upsert_sensor_aggregate(&self, aggregate: &SensorAggregate) -> Result<()> {
        let record = aggregate.clone();
        self.execute(move |conn| {
            let metrics = serde_json::to_string(&record.metrics)
                .context("failed to serialize aggregate metrics")?;
            conn.execute(
                "INSERT INTO sensor_aggregates (id, user_id, period, period_key, year, start_date, end_date, metrics, event_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (user_id, period, period_key) DO UPDATE SET
                     metrics = excluded.metrics,
                     event_count = excluded.event_count,
                     updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    record.user_id,
                    record.period.as_str(),
                    record.period_key,
                    record.year,
                    timestamp_text(&record.start_date),
                    timestamp_text(&record.end_date),
                    metrics,
                    to_i64(record.event_count)?,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to upsert {} aggregate {}",
                    record.period, record.period_key
                )
            })?;
            Ok(())
        })
        .await
    }

    pub async fn get_sensor_aggregate(
        &self,
        user_id: &str,
        period: PeriodKind,
        period_key: &str,
    ) -> Result<Option<SensorAggregate>> {
        let user_id = user_id.to_string();
        let period_key = period_key.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AGGREGATE_COLUMNS}
                 FROM sensor_aggregates
                 WHERE user_id = ?1 AND period = ?2 AND period_key = ?3"
            ))?;

            let aggregate = stmt
                .query_row(params![user_id, period.as_str(), period_key], row_to_aggregate)
                .optional()?;
            Ok(aggregate)
        })
        .await
    }

    /// Aggregates of one kind, most recent period first.
    pub async fn list_sensor_aggregates(
        &self,
        user_id: &str,
        period: PeriodKind,
        limit: usize,
    ) -> Result<Vec<SensorAggregate>> {
        let user_id = user_id.to_string();
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AGGREGATE_COLUMNS}
                 FROM sensor_aggregates
                 WHERE user_id = ?1 AND period = ?2
                 ORDER BY start_date DESC
                 LIMIT ?3"
            ))?;

            let aggregates = stmt
                .query_map(params![user_id, period.as_str(), limit], row_to_aggregate)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(aggregates)
        })
        .await
    }

    pub async fn delete_sensor_aggregates_for_user(&self, user_id: &str) -> Result<usize> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM sensor_aggregates WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(deleted)
        })
        .await
    }

    /// Deletes aggregates of `period` whose key is not in `keep`.
    pub async fn delete_stale_sensor_aggregates(
        &self,
        user_id: &str,
        period: PeriodKind,
        keep: HashSet<String>,
    ) -> Result<usize> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let stored: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT period_key FROM sensor_aggregates WHERE user_id = ?1 AND period = ?2",
                )?;
                let keys = stmt
                    .query_map(params![user_id, period.as_str()], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                keys
            };

            let mut deleted = 0;
            for key in stored.iter().filter(|key| !keep.contains(*key)) {
                deleted += tx.execute(
                    "DELETE FROM sensor_aggregates WHERE user_id = ?1 AND period = ?2 AND period_key = ?3",
                    params![user_id, period.as_str(), key],
                )?;
            }

            tx.commit().context("failed to commit stale aggregate cleanup")?;
            Ok(deleted)
        })
        .await
    }
}
