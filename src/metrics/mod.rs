mod types;

pub use types::{SensorMetrics, SleepMetrics, StepsMetrics, TotalMetrics, WeightMetrics};

use crate::db::{EventKind, SensorEvent};

const SECONDS_PER_HOUR: f64 = 3600.0;

fn present(values: &[Option<f64>]) -> impl Iterator<Item = f64> + '_ {
    values.iter().flatten().copied()
}

pub fn avg(values: &[Option<f64>]) -> Option<f64> {
    let (total, count) = present(values).fold((0.0, 0usize), |(t, c), v| (t + v, c + 1));
    (count > 0).then(|| total / count as f64)
}

pub fn sum(values: &[Option<f64>]) -> Option<f64> {
    present(values).fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

pub fn min(values: &[Option<f64>]) -> Option<f64> {
    present(values).fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.min(v))))
}

pub fn max(values: &[Option<f64>]) -> Option<f64> {
    present(values).fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
}

/// Last present value in the given order.
pub fn latest(values: &[Option<f64>]) -> Option<f64> {
    values.iter().rev().flatten().next().copied()
}

/// `latest - first` over present values; 0 with a single value.
pub fn change(values: &[Option<f64>]) -> Option<f64> {
    let mut iter = present(values);
    let first = iter.next()?;
    Some(iter.last().map_or(0.0, |last| last - first))
}

fn collect<F>(events: &[&SensorEvent], field: F) -> Vec<Option<f64>>
where
    F: Fn(&SensorEvent) -> Option<f64>,
{
    events.iter().map(|event| field(event)).collect()
}

fn totals(values: &[Option<f64>]) -> Option<TotalMetrics> {
    Some(TotalMetrics {
        sum: sum(values)?,
        avg: avg(values)?,
    })
}

/// Reduces the events of one bucket. `events` must be ordered by timestamp so
/// that `latest` is the most recent reading.
pub fn compute_metrics(events: &[&SensorEvent]) -> SensorMetrics {
    let weights = collect(events, |e| e.data.weight);
    let steps = collect(events, |e| e.data.steps);
    let sleep_hours = collect(events, |e| e.data.sleep_duration.map(|s| s / SECONDS_PER_HOUR));
    let calories = collect(events, |e| e.data.calories);
    let distances = collect(events, |e| e.data.distance);

    let intense_minutes: Vec<Option<f64>> = events
        .iter()
        .filter(|e| e.event_type == EventKind::Activity)
        .map(|e| e.data.intense.unwrap_or(0.0) + e.data.moderate.unwrap_or(0.0))
        .map(|minutes| (minutes > 0.0).then_some(minutes))
        .collect();

    let weight = match (avg(&weights), min(&weights), max(&weights), latest(&weights), change(&weights)) {
        (Some(avg), Some(min), Some(max), Some(latest), Some(change)) => Some(WeightMetrics {
            avg,
            min,
            max,
            latest,
            change,
        }),
        _ => None,
    };

    let steps = match (sum(&steps), avg(&steps), max(&steps)) {
        (Some(sum), Some(avg), Some(max)) => Some(StepsMetrics { sum, avg, max }),
        _ => None,
    };

    let sleep = match (avg(&sleep_hours), min(&sleep_hours), max(&sleep_hours)) {
        (Some(avg), Some(min), Some(max)) => Some(SleepMetrics { avg, min, max }),
        _ => None,
    };

    SensorMetrics {
        weight,
        steps,
        sleep,
        calories: totals(&calories),
        distance: totals(&distances),
        intense_minutes: totals(&intense_minutes),
    }
}
