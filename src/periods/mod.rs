//! Calendar buckets used as aggregation keys.
//!
//! Buckets are generated from a start year through "now" in the caller's time
//! zone, newest first. A bucket covers `[start, end]` where `end` is one second
//! before the next bucket's start, so adjacent buckets never overlap.

use std::{fmt, str::FromStr};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Week,
    Month,
    Year,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 3] = [PeriodKind::Week, PeriodKind::Month, PeriodKind::Year];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Week => "week",
            PeriodKind::Month => "month",
            PeriodKind::Year => "year",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "week" => Ok(PeriodKind::Week),
            "month" => Ok(PeriodKind::Month),
            "year" => Ok(PeriodKind::Year),
            other => Err(anyhow!("unknown period kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodBucket {
    pub kind: PeriodKind,
    /// `2025W43`, `2025M10` or `2025`.
    pub key: String,
    pub year: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodBucket {
    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        self.start <= *timestamp && *timestamp <= self.end
    }
}

fn tick() -> Duration {
    Duration::seconds(1)
}

/// Midnight of `date` in `tz`. When midnight does not exist (DST gap) the first
/// valid instant of the following hour is used.
fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Number of ISO-8601 weeks in `year` (52 or 53).
pub fn iso_weeks_in_year(year: i32) -> u32 {
    NaiveDate::from_ymd_opt(year, 12, 28)
        .map(|date| date.iso_week().week())
        .unwrap_or(52)
}

/// Monday of ISO week `week` in `year`.
///
/// Anchors on Jan 1 + (week - 1) * 7 days, then pulls back to that week's Monday
/// when the anchor falls on Sunday..Thursday and pushes forward to the next
/// Monday otherwise.
pub fn iso_week_start(year: i32, week: u32) -> Option<NaiveDate> {
    if week == 0 || week > iso_weeks_in_year(year) {
        return None;
    }

    let jan_first = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let anchor = jan_first + Duration::days(i64::from(week - 1) * 7);
    let weekday = i64::from(anchor.weekday().num_days_from_sunday());

    let monday = if weekday <= 4 {
        anchor - Duration::days(weekday - 1)
    } else {
        anchor + Duration::days(8 - weekday)
    };
    Some(monday)
}

pub fn generate_weeks<Tz: TimeZone>(start_year: i32, now: &DateTime<Tz>) -> Vec<PeriodBucket> {
    let tz = now.timezone();
    let now_utc = now.with_timezone(&Utc);
    let range_start =
        NaiveDate::from_ymd_opt(start_year, 1, 1).map(|jan_first| local_midnight(&tz, jan_first));
    let mut weeks = Vec::new();

    // The last week of the previous ISO year can still hold early January, and
    // week 1 of next year can begin in late December.
    for year in start_year - 1..=now.year() + 1 {
        for week in 1..=iso_weeks_in_year(year) {
            let Some(monday) = iso_week_start(year, week) else {
                break;
            };
            let start = local_midnight(&tz, monday);
            if start > now_utc {
                break;
            }
            let end = local_midnight(&tz, monday + Duration::days(7)) - tick();
            if range_start.is_some_and(|range_start| end < range_start) {
                continue;
            }

            weeks.push(PeriodBucket {
                kind: PeriodKind::Week,
                key: format!("{year}W{week:02}"),
                year,
                start,
                end,
            });
        }
    }

    weeks.reverse();
    weeks
}

pub fn generate_months<Tz: TimeZone>(start_year: i32, now: &DateTime<Tz>) -> Vec<PeriodBucket> {
    let tz = now.timezone();
    let current_year = now.year();
    let current_month = now.month();
    let mut months = Vec::new();

    for year in start_year..=current_year {
        let max_month = if year == current_year { current_month } else { 12 };

        for month in 1..=max_month {
            let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
                continue;
            };
            let next_first = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)
            };
            let Some(next_first) = next_first else {
                continue;
            };

            months.push(PeriodBucket {
                kind: PeriodKind::Month,
                key: format!("{year}M{month:02}"),
                year,
                start: local_midnight(&tz, first),
                end: local_midnight(&tz, next_first) - tick(),
            });
        }
    }

    months.reverse();
    months
}

pub fn generate_years<Tz: TimeZone>(start_year: i32, now: &DateTime<Tz>) -> Vec<PeriodBucket> {
    let tz = now.timezone();
    let mut years = Vec::new();

    for year in start_year..=now.year() {
        let (Some(first), Some(next_first)) = (
            NaiveDate::from_ymd_opt(year, 1, 1),
            NaiveDate::from_ymd_opt(year + 1, 1, 1),
        ) else {
            continue;
        };

        years.push(PeriodBucket {
            kind: PeriodKind::Year,
            key: year.to_string(),
            year,
            start: local_midnight(&tz, first),
            end: local_midnight(&tz, next_first) - tick(),
        });
    }

    years.reverse();
    years
}

pub fn generate<Tz: TimeZone>(
    kind: PeriodKind,
    start_year: i32,
    now: &DateTime<Tz>,
) -> Vec<PeriodBucket> {
    match kind {
        PeriodKind::Week => generate_weeks(start_year, now),
        PeriodKind::Month => generate_months(start_year, now),
        PeriodKind::Year => generate_years(start_year, now),
    }
}

/// The bucket of `kind` that contains `now`.
pub fn current_bucket<Tz: TimeZone>(kind: PeriodKind, now: &DateTime<Tz>) -> Option<PeriodBucket> {
    let now_utc = now.with_timezone(&Utc);
    generate(kind, now.year() - 1, now)
        .into_iter()
        .find(|bucket| bucket.contains(&now_utc))
}

/// Validates a period key and returns its year and week/month number
/// (`None` for year keys).
pub fn parse_period_key(kind: PeriodKind, key: &str) -> Result<(i32, Option<u32>)> {
    let bytes = key.as_bytes();
    let digits = |range: std::ops::Range<usize>| -> Result<u32> {
        let part = key
            .get(range)
            .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| anyhow!("malformed {kind} key '{key}'"))?;
        Ok(part.parse()?)
    };

    match kind {
        PeriodKind::Year => {
            if bytes.len() != 4 {
                bail!("malformed year key '{key}'");
            }
            Ok((digits(0..4)? as i32, None))
        }
        PeriodKind::Week | PeriodKind::Month => {
            let (marker, max) = match kind {
                PeriodKind::Week => (b'W', 53),
                _ => (b'M', 12),
            };
            if bytes.len() != 7 || bytes[4] != marker {
                bail!("malformed {kind} key '{key}'");
            }
            let year = digits(0..4)? as i32;
            let number = digits(5..7)?;
            if number == 0 || number > max {
                bail!("{kind} number out of range in '{key}'");
            }
            if kind == PeriodKind::Week && number > iso_weeks_in_year(year) {
                bail!("{year} has no ISO week {number}");
            }
            Ok((year, Some(number)))
        }
    }
}
