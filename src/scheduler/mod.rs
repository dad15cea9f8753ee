//! Background jobs: periodic Withings sync and the nightly aggregation.

mod loops;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveTime, TimeZone};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregation::Aggregator;
use crate::withings::SyncRunner;

use loops::{nightly_aggregation_loop, sync_loop};

/// First instant strictly after `now` whose local wall-clock time is
/// `time_of_day`. A time skipped by a DST jump falls back to the same time
/// one hour later.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, time_of_day: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    for offset in 0..=2 {
        let naive = (today + Duration::days(offset)).and_time(time_of_day);
        let candidate = tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest());
        if let Some(candidate) = candidate {
            if candidate > *now {
                return candidate;
            }
        }
    }
    now.clone() + Duration::days(1)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub user_id: String,
    pub sync_interval: std::time::Duration,
    pub aggregation_time: NaiveTime,
}

pub struct Scheduler {
    config: SchedulerConfig,
    aggregator: Aggregator,
    sync: SyncRunner,
    handles: Vec<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, aggregator: Aggregator, sync: SyncRunner) -> Self {
        Self {
            config,
            aggregator,
            sync,
            handles: Vec::new(),
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel_token.is_some()
    }

    pub fn start(&mut self) {
        if self.is_running() {
            info!("Scheduler already running");
            return;
        }

        let cancel_token = CancellationToken::new();
        self.handles.push(tokio::spawn(sync_loop(
            self.sync.clone(),
            self.config.user_id.clone(),
            self.config.sync_interval,
            cancel_token.clone(),
        )));
        self.handles.push(tokio::spawn(nightly_aggregation_loop(
            self.aggregator.clone(),
            self.config.user_id.clone(),
            self.config.aggregation_time,
            cancel_token.clone(),
        )));
        self.cancel_token = Some(cancel_token);

        info!(
            "Scheduler started: sync every {}s, aggregation at {}",
            self.config.sync_interval.as_secs(),
            self.config.aggregation_time.format("%H:%M")
        );
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        for handle in self.handles.drain(..) {
            handle
                .await
                .context("scheduler task failed to join")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::settings::WithingsSettings;
    use crate::withings::WithingsClient;
    use chrono::{FixedOffset, Utc};

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn next_run_is_later_today_when_time_has_not_passed() {
        let now = Utc.with_ymd_and_hms(2025, 10, 20, 1, 30, 0).unwrap();
        assert_eq!(
            next_run_after(&now, at(3, 0)),
            Utc.with_ymd_and_hms(2025, 10, 20, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_run_rolls_to_tomorrow_once_passed_or_equal() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 3, 0, 0).unwrap();
        assert_eq!(
            next_run_after(&now, at(3, 0)),
            Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_run_uses_the_local_wall_clock() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2025, 10, 20, 23, 0, 0).unwrap();
        let next = next_run_after(&now, at(3, 0));
        assert_eq!(next, tz.with_ymd_and_hms(2025, 10, 21, 3, 0, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc), Utc.with_ymd_and_hms(2025, 10, 21, 1, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let (_dir, db) = temp_database();
        let aggregator = Aggregator::new(db.clone(), 2024, false);
        let client = WithingsClient::new(&WithingsSettings {
            api_base: "http://127.0.0.1:9".into(),
            ..Default::default()
        })
        .unwrap();
        let sync = SyncRunner::new(db.clone(), client, aggregator.clone());
        let mut scheduler = Scheduler::new(
            SchedulerConfig {
                user_id: "u1".into(),
                sync_interval: std::time::Duration::from_secs(3600),
                aggregation_time: at(3, 0),
            },
            aggregator,
            sync,
        );

        assert!(!scheduler.is_running());
        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.handles.len(), 2);

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert!(scheduler.handles.is_empty());
    }
}
