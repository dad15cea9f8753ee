mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::{
    DataType, EventKind, Sensor, SensorAggregate, SensorCredentials, SensorEvent, SensorPayload,
    SensorSummary,
};

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;

    use super::Database;

    /// A fresh database in its own temp dir; keep the dir alive for the test.
    pub fn temp_database() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("resonans.sqlite3")).expect("open database");
        (dir, db)
    }
}
