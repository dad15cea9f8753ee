//! Column conversions shared by the repositories.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Row;

/// Wraps a conversion failure so it can be returned from a rusqlite row closure.
pub fn invalid_data(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        err.to_string(),
    )))
}

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("count {value} does not fit an SQLite INTEGER"))
}

fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("column {column} holds invalid timestamp '{raw}'"))
}

/// Typed reads for the text and integer encodings used by the schema.
pub trait RowExt {
    fn timestamp(&self, column: &str) -> rusqlite::Result<DateTime<Utc>>;
    fn optional_timestamp(&self, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>>;
    fn count(&self, column: &str) -> rusqlite::Result<u64>;
}

impl RowExt for Row<'_> {
    fn timestamp(&self, column: &str) -> rusqlite::Result<DateTime<Utc>> {
        let raw: String = self.get(column)?;
        parse_timestamp(&raw, column).map_err(invalid_data)
    }

    fn optional_timestamp(&self, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.get(column)?;
        raw.map(|raw| parse_timestamp(&raw, column))
            .transpose()
            .map_err(invalid_data)
    }

    fn count(&self, column: &str) -> rusqlite::Result<u64> {
        let value: i64 = self.get(column)?;
        u64::try_from(value)
            .map_err(|_| invalid_data(anyhow!("column {column} holds negative value {value}")))
    }
}
