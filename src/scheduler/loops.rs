use chrono::{Local, NaiveTime};
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::aggregation::Aggregator;
use crate::withings::{SyncOutcome, SyncRunner};

use super::next_run_after;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub async fn sync_loop(
    runner: SyncRunner,
    user_id: String,
    period: Duration,
    cancel_token: CancellationToken,
) {
    // The first tick waits a full period; startup does not trigger a sync.
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match runner.sync(&user_id).await {
                    Ok(SyncOutcome::Completed(counts)) => log_info!(
                        "Scheduled sync stored {} weight, {} activity, {} sleep",
                        counts.weight,
                        counts.activity,
                        counts.sleep
                    ),
                    Ok(SyncOutcome::Skipped) => log_warn!("Scheduled sync skipped: previous run still active"),
                    Ok(SyncOutcome::NotConnected) => {}
                    Err(err) => log_error!("Scheduled sync failed for {}: {err:?}", user_id),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("sync loop shutting down");
                break;
            }
        }
    }
}

pub async fn nightly_aggregation_loop(
    aggregator: Aggregator,
    user_id: String,
    time_of_day: NaiveTime,
    cancel_token: CancellationToken,
) {
    loop {
        let now = Local::now();
        let next = next_run_after(&now, time_of_day);
        let wait = (next.clone() - now).to_std().unwrap_or(Duration::ZERO);
        log_info!("Next aggregation at {}", next.format("%Y-%m-%d %H:%M"));

        tokio::select! {
            _ = time::sleep(wait) => {
                match aggregator.aggregate_all_periods(&user_id).await {
                    Ok(summary) => log_info!(
                        "Nightly aggregation wrote {} weeks, {} months, {} years from {} events",
                        summary.weeks,
                        summary.months,
                        summary.years,
                        summary.events
                    ),
                    Err(err) => log_error!("Nightly aggregation failed for {}: {err:?}", user_id),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("aggregation loop shutting down");
                break;
            }
        }
    }
}
