use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_FILE: &str = "resonans.json";

/// One week.
const MAX_SYNC_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct WithingsSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub api_base: String,
    pub account_base: String,
}

impl Default for WithingsSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "http://127.0.0.1:5173/api/sensors/withings/callback".into(),
            api_base: "https://wbsapi.withings.net".into(),
            account_base: "https://account.withings.com".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub database_path: PathBuf,
    pub bind_address: String,
    pub default_user_id: String,
    /// First year buckets are generated for.
    pub start_year: i32,
    pub sync_interval_minutes: u64,
    /// Local wall-clock time of the nightly aggregation, `HH:MM`.
    pub aggregation_time: String,
    /// Delete aggregates whose bucket no longer has events.
    pub prune_stale: bool,
    pub withings: WithingsSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("resonans.sqlite3"),
            bind_address: "127.0.0.1:5173".into(),
            default_user_id: "default-user".into(),
            start_year: 2017,
            sync_interval_minutes: 5,
            aggregation_time: "03:00".into(),
            prune_stale: false,
            withings: WithingsSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn aggregation_time_of_day(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.aggregation_time.trim(), "%H:%M").with_context(|| {
            format!(
                "aggregation time '{}' is not HH:MM",
                self.aggregation_time
            )
        })
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(
            self.sync_interval_minutes
                .min(MAX_SYNC_INTERVAL_MINUTES)
                .saturating_mul(60),
        )
    }

    fn validate(&self) -> Result<()> {
        if !(1..=MAX_SYNC_INTERVAL_MINUTES).contains(&self.sync_interval_minutes) {
            bail!(
                "sync interval must be between 1 and {MAX_SYNC_INTERVAL_MINUTES} minutes, got {}",
                self.sync_interval_minutes
            );
        }
        if self.default_user_id.trim().is_empty() {
            bail!("default user id must not be empty");
        }
        self.aggregation_time_of_day()?;
        Ok(())
    }

    /// Applies `RESONANS_*` / `WITHINGS_*` overrides read through `lookup`.
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("RESONANS_DB_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = get("RESONANS_BIND") {
            self.bind_address = value;
        }
        if let Some(value) = get("RESONANS_USER_ID") {
            self.default_user_id = value;
        }
        if let Some(value) = get("RESONANS_START_YEAR") {
            self.start_year = value
                .trim()
                .parse()
                .with_context(|| format!("RESONANS_START_YEAR '{value}' is not a year"))?;
        }
        if let Some(value) = get("RESONANS_SYNC_INTERVAL_MINUTES") {
            self.sync_interval_minutes = value.trim().parse().with_context(|| {
                format!("RESONANS_SYNC_INTERVAL_MINUTES '{value}' is not a number")
            })?;
        }
        if let Some(value) = get("RESONANS_AGGREGATION_TIME") {
            self.aggregation_time = value;
        }
        if let Some(value) = get("RESONANS_PRUNE_STALE") {
            self.prune_stale = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => bail!("RESONANS_PRUNE_STALE '{other}' is not a boolean"),
            };
        }
        if let Some(value) = get("WITHINGS_CLIENT_ID") {
            self.withings.client_id = value;
        }
        if let Some(value) = get("WITHINGS_CLIENT_SECRET") {
            self.withings.client_secret = value;
        }
        if let Some(value) = get("WITHINGS_REDIRECT_URI") {
            self.withings.redirect_uri = value;
        }
        if let Some(value) = get("WITHINGS_API_BASE") {
            self.withings.api_base = value;
        }
        if let Some(value) = get("WITHINGS_ACCOUNT_BASE") {
            self.withings.account_base = value;
        }
        Ok(())
    }
}

/// Settings resolved from the JSON config file and the process environment.
pub struct SettingsStore {
    path: PathBuf,
    data: AppSettings,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_lookup(path, |key| std::env::var(key).ok())
    }

    pub fn with_lookup<F>(path: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid settings in {}", path.display()))?
        } else {
            AppSettings::default()
        };

        data.apply_overrides(lookup)?;
        data.validate()?;

        Ok(Self { path, data })
    }

    pub fn settings(&self) -> &AppSettings {
        &self.data
    }

    pub fn into_settings(self) -> AppSettings {
        self.data
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::with_lookup(dir.path().join("absent.json"), no_env).unwrap();

        assert_eq!(store.settings(), &AppSettings::default());
        assert_eq!(
            store.settings().aggregation_time_of_day().unwrap(),
            NaiveTime::from_hms_opt(3, 0, 0).unwrap()
        );
    }

    #[test]
    fn file_values_fill_in_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resonans.json");
        fs::write(
            &path,
            r#"{"startYear": 2020, "withings": {"clientId": "from-file"}}"#,
        )
        .unwrap();

        let settings = SettingsStore::with_lookup(path, no_env).unwrap().into_settings();
        assert_eq!(settings.start_year, 2020);
        assert_eq!(settings.withings.client_id, "from-file");
        assert_eq!(settings.withings.api_base, "https://wbsapi.withings.net");
        assert_eq!(settings.sync_interval_minutes, 5);
        assert_eq!(settings.sync_interval(), Duration::from_secs(300));
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resonans.json");
        fs::write(&path, r#"{"defaultUserId": "file-user", "startYear": 2020}"#).unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("RESONANS_USER_ID", "env-user"),
            ("RESONANS_PRUNE_STALE", "yes"),
            ("RESONANS_AGGREGATION_TIME", "04:30"),
            ("WITHINGS_API_BASE", "http://localhost:9999"),
            ("RESONANS_START_YEAR", " "),
        ]);
        let settings = SettingsStore::with_lookup(path, |key| env.get(key).map(|v| v.to_string()))
            .unwrap()
            .into_settings();

        assert_eq!(settings.default_user_id, "env-user");
        assert!(settings.prune_stale);
        assert_eq!(settings.start_year, 2020);
        assert_eq!(settings.withings.api_base, "http://localhost:9999");
        assert_eq!(
            settings.aggregation_time_of_day().unwrap(),
            NaiveTime::from_hms_opt(4, 30, 0).unwrap()
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resonans.json");

        fs::write(&path, "{ not json").unwrap();
        assert!(SettingsStore::with_lookup(path.clone(), no_env).is_err());

        fs::write(&path, r#"{"aggregationTime": "25:99"}"#).unwrap();
        assert!(SettingsStore::with_lookup(path.clone(), no_env).is_err());

        fs::write(&path, "{}").unwrap();
        let bad_interval = |key: &str| {
            (key == "RESONANS_SYNC_INTERVAL_MINUTES").then(|| "0".to_string())
        };
        assert!(SettingsStore::with_lookup(path.clone(), bad_interval).is_err());
        let huge_interval = |key: &str| {
            (key == "RESONANS_SYNC_INTERVAL_MINUTES").then(|| u64::MAX.to_string())
        };
        assert!(SettingsStore::with_lookup(path.clone(), huge_interval).is_err());
        let bad_flag = |key: &str| (key == "RESONANS_PRUNE_STALE").then(|| "maybe".to_string());
        assert!(SettingsStore::with_lookup(path, bad_flag).is_err());
    }
}
