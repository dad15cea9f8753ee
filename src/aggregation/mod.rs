//! Rolls raw sensor events up into week, month and year aggregates.
//!
//! A pass reads every event of the user once, walks the generated buckets and
//! upserts one row per non-empty bucket. Buckets are independent: a failure
//! midway leaves the rows written so far, and re-running is idempotent.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;

use crate::db::{Database, SensorAggregate, SensorEvent};
use crate::metrics::compute_metrics;
use crate::periods::{self, PeriodBucket, PeriodKind};
use crate::{log_info, log_warn};

const ENABLE_LOGS: bool = true;

/// Outcome of one `aggregate_all_periods` run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSummary {
    pub weeks: usize,
    pub months: usize,
    pub years: usize,
    pub events: u64,
    pub pruned: usize,
}

impl AggregationSummary {
    fn record(&mut self, kind: PeriodKind, pass: &PassOutcome) {
        match kind {
            PeriodKind::Week => self.weeks = pass.written,
            PeriodKind::Month => self.months = pass.written,
            PeriodKind::Year => self.years = pass.written,
        }
        self.pruned += pass.pruned;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PassOutcome {
    written: usize,
    pruned: usize,
}

#[derive(Clone)]
pub struct Aggregator {
    db: Database,
    start_year: i32,
    prune_stale: bool,
}

impl Aggregator {
    pub fn new(db: Database, start_year: i32, prune_stale: bool) -> Self {
        Self {
            db,
            start_year,
            prune_stale,
        }
    }

    /// Aggregates one period kind for `user_id`. Returns the number of rows written.
    pub async fn aggregate_period(&self, user_id: &str, kind: PeriodKind) -> Result<usize> {
        self.aggregate_period_at(user_id, kind, &Local::now()).await
    }

    pub async fn aggregate_period_at<Tz: TimeZone>(
        &self,
        user_id: &str,
        kind: PeriodKind,
        now: &DateTime<Tz>,
    ) -> Result<usize> {
        let events = self.fetch_events(user_id).await?;
        let outcome = self.run_pass(user_id, kind, &events, now).await?;
        Ok(outcome.written)
    }

    /// Aggregates week, month and year buckets for `user_id` from a single
    /// read of the event store.
    pub async fn aggregate_all_periods(&self, user_id: &str) -> Result<AggregationSummary> {
        self.aggregate_all_periods_at(user_id, &Local::now()).await
    }

    pub async fn aggregate_all_periods_at<Tz: TimeZone>(
        &self,
        user_id: &str,
        now: &DateTime<Tz>,
    ) -> Result<AggregationSummary> {
        let started = Instant::now();
        let events = self.fetch_events(user_id).await?;

        let mut summary = AggregationSummary {
            events: events.len() as u64,
            ..Default::default()
        };

        for kind in PeriodKind::ALL {
            let outcome = self.run_pass(user_id, kind, &events, now).await?;
            summary.record(kind, &outcome);
        }

        log_info!(
            "All aggregations for {} completed in {:.2}s",
            user_id,
            started.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    pub async fn latest_aggregate(
        &self,
        user_id: &str,
        kind: PeriodKind,
    ) -> Result<Option<SensorAggregate>> {
        let mut rows = self.db.list_sensor_aggregates(user_id, kind, 1).await?;
        Ok(rows.pop())
    }

    pub async fn get_aggregate(
        &self,
        user_id: &str,
        kind: PeriodKind,
        period_key: &str,
    ) -> Result<Option<SensorAggregate>> {
        self.db.get_sensor_aggregate(user_id, kind, period_key).await
    }

    /// Most recent `limit` aggregates of `kind`.
    pub async fn list_aggregates(
        &self,
        user_id: &str,
        kind: PeriodKind,
        limit: usize,
    ) -> Result<Vec<SensorAggregate>> {
        self.db.list_sensor_aggregates(user_id, kind, limit).await
    }

    async fn fetch_events(&self, user_id: &str) -> Result<Vec<SensorEvent>> {
        self.db
            .list_sensor_events(user_id)
            .await
            .with_context(|| format!("failed to load sensor events for {user_id}"))
    }

    async fn run_pass<Tz: TimeZone>(
        &self,
        user_id: &str,
        kind: PeriodKind,
        events: &[SensorEvent],
        now: &DateTime<Tz>,
    ) -> Result<PassOutcome> {
        let started = Instant::now();
        let buckets = periods::generate(kind, self.start_year, now);

        let mut ordered: Vec<&SensorEvent> = events.iter().collect();
        ordered.sort_by_key(|event| event.timestamp);

        let mut written = 0usize;
        let mut kept_keys = HashSet::new();

        for bucket in &buckets {
            let in_bucket = events_in(&ordered, bucket);
            if in_bucket.is_empty() {
                continue;
            }

            let now_utc = Utc::now();
            let aggregate = SensorAggregate {
                user_id: user_id.to_string(),
                period: kind,
                period_key: bucket.key.clone(),
                year: bucket.year,
                start_date: bucket.start,
                end_date: bucket.end,
                metrics: compute_metrics(in_bucket),
                event_count: in_bucket.len() as u64,
                created_at: now_utc,
                updated_at: now_utc,
            };

            self.db
                .upsert_sensor_aggregate(&aggregate)
                .await
                .with_context(|| format!("failed to store {kind} aggregate {}", bucket.key))?;
            kept_keys.insert(bucket.key.clone());
            written += 1;
        }

        let pruned = if self.prune_stale {
            let pruned = self
                .db
                .delete_stale_sensor_aggregates(user_id, kind, kept_keys)
                .await?;
            if pruned > 0 {
                log_warn!("Pruned {} stale {} aggregates for {}", pruned, kind, user_id);
            }
            pruned
        } else {
            0
        };

        log_info!(
            "{} aggregation: {} buckets, {} events, {} written in {:.2}s",
            kind,
            buckets.len(),
            events.len(),
            written,
            started.elapsed().as_secs_f64()
        );

        Ok(PassOutcome { written, pruned })
    }
}

/// The slice of time-ordered `events` falling inside `bucket`.
fn events_in<'a>(events: &'a [&'a SensorEvent], bucket: &PeriodBucket) -> &'a [&'a SensorEvent] {
    let lo = events.partition_point(|event| event.timestamp < bucket.start);
    let hi = events.partition_point(|event| event.timestamp <= bucket.end);
    &events[lo..hi.max(lo)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::db::{DataType, EventKind, SensorPayload};
    use chrono::Duration;
    use serde_json::json;

    const USER: &str = "user-1";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn weight_event(at: DateTime<Utc>, kg: f64) -> SensorEvent {
        SensorEvent::new(
            USER,
            "sensor-1",
            EventKind::Measurement,
            DataType::Weight,
            at,
            SensorPayload {
                weight: Some(kg),
                ..Default::default()
            },
            json!({"source": "test"}),
        )
    }

    fn steps_event(at: DateTime<Utc>, steps: f64) -> SensorEvent {
        SensorEvent::new(
            USER,
            "sensor-1",
            EventKind::Activity,
            DataType::Activity,
            at,
            SensorPayload {
                steps: Some(steps),
                ..Default::default()
            },
            json!({}),
        )
    }

    fn aggregator(db: &Database, prune_stale: bool) -> Aggregator {
        Aggregator::new(db.clone(), 2024, prune_stale)
    }

    #[tokio::test]
    async fn user_without_events_gets_no_rows() {
        let (_dir, db) = temp_database();
        let summary = aggregator(&db, false)
            .aggregate_all_periods_at(USER, &now())
            .await
            .unwrap();

        assert_eq!(summary, AggregationSummary::default());
        for kind in PeriodKind::ALL {
            assert!(db.list_sensor_aggregates(USER, kind, 100).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn every_event_lands_in_exactly_one_bucket() {
        let (_dir, db) = temp_database();
        let mut events = Vec::new();
        // Every 17 hours from the first instant of 2024 through late February 2026,
        // plus the exact edges of one week.
        let mut at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        while at < Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap() {
            events.push(weight_event(at, 70.0));
            at += Duration::hours(17);
        }
        events.push(weight_event(Utc.with_ymd_and_hms(2025, 10, 20, 0, 0, 0).unwrap(), 71.0));
        events.push(weight_event(Utc.with_ymd_and_hms(2025, 10, 26, 23, 59, 59).unwrap(), 72.0));
        let total = events.len() as u64;
        db.insert_sensor_events(events).await.unwrap();

        let summary = aggregator(&db, false)
            .aggregate_all_periods_at(USER, &now())
            .await
            .unwrap();
        assert_eq!(summary.events, total);
        assert_eq!(summary.years, 3);
        assert_eq!(summary.months, 26);

        for kind in PeriodKind::ALL {
            let rows = db.list_sensor_aggregates(USER, kind, 1_000).await.unwrap();
            let counted: u64 = rows.iter().map(|row| row.event_count).sum();
            assert_eq!(counted, total, "{kind} buckets must partition the events");
        }
    }

    #[tokio::test]
    async fn new_years_day_before_week_one_is_counted() {
        let (_dir, db) = temp_database();
        db.insert_sensor_event(&weight_event(
            Utc.with_ymd_and_hms(2017, 1, 1, 9, 0, 0).unwrap(),
            70.0,
        ))
        .await
        .unwrap();

        let now = Utc.with_ymd_and_hms(2017, 3, 1, 0, 0, 0).unwrap();
        let agg = Aggregator::new(db.clone(), 2017, false);
        let summary = agg.aggregate_all_periods_at(USER, &now).await.unwrap();
        assert_eq!((summary.weeks, summary.months, summary.years), (1, 1, 1));

        let week = agg
            .get_aggregate(USER, PeriodKind::Week, "2016W52")
            .await
            .unwrap()
            .expect("week row");
        assert_eq!(week.event_count, 1);
    }

    #[tokio::test]
    async fn storage_failure_stops_the_sweep_and_a_rerun_repairs_it() {
        let (_dir, db) = temp_database();
        db.insert_sensor_events(vec![
            weight_event(Utc.with_ymd_and_hms(2025, 10, 21, 7, 0, 0).unwrap(), 70.0),
            weight_event(Utc.with_ymd_and_hms(2025, 10, 28, 7, 0, 0).unwrap(), 69.0),
            weight_event(Utc.with_ymd_and_hms(2025, 11, 4, 7, 0, 0).unwrap(), 68.0),
        ])
        .await
        .unwrap();
        db.execute(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_one_week BEFORE INSERT ON sensor_aggregates
                 WHEN NEW.period_key = '2025W44'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let agg = aggregator(&db, false);
        let err = agg
            .aggregate_period_at(USER, PeriodKind::Week, &now())
            .await
            .expect_err("upsert of 2025W44 fails");
        assert!(format!("{err:#}").contains("week aggregate 2025W44"));

        // Buckets are walked newest first.
        let keys: Vec<String> = agg
            .list_aggregates(USER, PeriodKind::Week, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.period_key)
            .collect();
        assert_eq!(keys, vec!["2025W45"]);

        db.execute(|conn| {
            conn.execute_batch("DROP TRIGGER reject_one_week;")?;
            Ok(())
        })
        .await
        .unwrap();
        let written = agg
            .aggregate_period_at(USER, PeriodKind::Week, &now())
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(agg.list_aggregates(USER, PeriodKind::Week, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn second_run_reproduces_the_same_rows() {
        let (_dir, db) = temp_database();
        db.insert_sensor_events(vec![
            weight_event(Utc.with_ymd_and_hms(2025, 10, 20, 7, 0, 0).unwrap(), 70.0),
            weight_event(Utc.with_ymd_and_hms(2025, 10, 21, 7, 0, 0).unwrap(), 68.5),
            steps_event(Utc.with_ymd_and_hms(2025, 11, 3, 20, 0, 0).unwrap(), 9000.0),
        ])
        .await
        .unwrap();

        let agg = aggregator(&db, false);
        agg.aggregate_all_periods_at(USER, &now()).await.unwrap();
        let first = db.list_sensor_aggregates(USER, PeriodKind::Week, 100).await.unwrap();
        agg.aggregate_all_periods_at(USER, &now()).await.unwrap();
        let second = db.list_sensor_aggregates(USER, PeriodKind::Week, 100).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.period_key, b.period_key);
            assert_eq!(
                serde_json::to_string(&a.metrics).unwrap(),
                serde_json::to_string(&b.metrics).unwrap()
            );
            assert_eq!(a.event_count, b.event_count);
            assert_eq!(a.created_at, b.created_at);
        }
    }

    #[tokio::test]
    async fn new_event_updates_the_existing_row() {
        let (_dir, db) = temp_database();
        db.insert_sensor_events(vec![
            weight_event(Utc.with_ymd_and_hms(2025, 10, 20, 7, 0, 0).unwrap(), 70.0),
            weight_event(Utc.with_ymd_and_hms(2025, 10, 22, 7, 0, 0).unwrap(), 68.5),
        ])
        .await
        .unwrap();

        let agg = aggregator(&db, false);
        agg.aggregate_period_at(USER, PeriodKind::Week, &now()).await.unwrap();
        let before = agg
            .get_aggregate(USER, PeriodKind::Week, "2025W43")
            .await
            .unwrap()
            .expect("week row");

        db.insert_sensor_event(&weight_event(
            Utc.with_ymd_and_hms(2025, 10, 24, 7, 0, 0).unwrap(),
            69.2,
        ))
        .await
        .unwrap();
        agg.aggregate_period_at(USER, PeriodKind::Week, &now()).await.unwrap();
        let after = agg
            .get_aggregate(USER, PeriodKind::Week, "2025W43")
            .await
            .unwrap()
            .expect("week row");

        assert_eq!(after.event_count, before.event_count + 1);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.start_date, Utc.with_ymd_and_hms(2025, 10, 20, 0, 0, 0).unwrap());
        let weight = after.metrics.weight.expect("weight");
        assert_eq!(weight.latest, 69.2);
        assert!((weight.change - -0.8).abs() < 1e-9);
        assert_eq!(db.list_sensor_aggregates(USER, PeriodKind::Week, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn weight_only_bucket_stores_only_weight() {
        let (_dir, db) = temp_database();
        db.insert_sensor_event(&weight_event(
            Utc.with_ymd_and_hms(2026, 2, 10, 7, 0, 0).unwrap(),
            80.0,
        ))
        .await
        .unwrap();

        let agg = aggregator(&db, false);
        agg.aggregate_all_periods_at(USER, &now()).await.unwrap();
        let month = agg
            .latest_aggregate(USER, PeriodKind::Month)
            .await
            .unwrap()
            .expect("month row");

        assert_eq!(month.period_key, "2026M02");
        let metrics = serde_json::to_value(&month.metrics).unwrap();
        assert_eq!(metrics.as_object().unwrap().len(), 1);
        assert!(metrics.get("weight").is_some());
    }

    #[tokio::test]
    async fn stale_rows_survive_unless_pruning_is_enabled() {
        let (_dir, db) = temp_database();
        db.insert_sensor_event(&weight_event(
            Utc.with_ymd_and_hms(2025, 6, 4, 7, 0, 0).unwrap(),
            75.0,
        ))
        .await
        .unwrap();

        aggregator(&db, false)
            .aggregate_all_periods_at(USER, &now())
            .await
            .unwrap();
        db.delete_sensor_events_for_user(USER).await.unwrap();

        aggregator(&db, false)
            .aggregate_all_periods_at(USER, &now())
            .await
            .unwrap();
        assert_eq!(db.list_sensor_aggregates(USER, PeriodKind::Year, 10).await.unwrap().len(), 1);

        let summary = aggregator(&db, true)
            .aggregate_all_periods_at(USER, &now())
            .await
            .unwrap();
        assert_eq!(summary.pruned, 3);
        for kind in PeriodKind::ALL {
            assert!(db.list_sensor_aggregates(USER, kind, 10).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn list_returns_most_recent_first() {
        let (_dir, db) = temp_database();
        db.insert_sensor_events(vec![
            steps_event(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(), 100.0),
            steps_event(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap(), 200.0),
            steps_event(Utc.with_ymd_and_hms(2025, 8, 1, 9, 0, 0).unwrap(), 300.0),
        ])
        .await
        .unwrap();

        let agg = aggregator(&db, false);
        let written = agg
            .aggregate_period_at(USER, PeriodKind::Year, &now())
            .await
            .unwrap();
        assert_eq!(written, 3);

        let keys: Vec<String> = agg
            .list_aggregates(USER, PeriodKind::Year, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.period_key)
            .collect();
        assert_eq!(keys, vec!["2026", "2025"]);
    }
}
