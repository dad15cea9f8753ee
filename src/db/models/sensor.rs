//! Connected health-data providers.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OAuth tokens for a provider. Stored base64-encoded JSON in `sensors.credentials`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SensorCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl SensorCredentials {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).context("failed to serialize credentials")?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("credentials are not valid base64")?;
        serde_json::from_slice(&bytes).context("credentials are not valid JSON")
    }

    /// True once we are within `buffer_secs` of expiry.
    pub fn expires_within(&self, now_secs: i64, buffer_secs: i64) -> bool {
        now_secs >= self.expires_at - buffer_secs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub name: String,
    pub sensor_type: String,
    /// Base64 JSON of [`SensorCredentials`]; never serialized out of the API.
    #[serde(skip_serializing)]
    pub credentials: String,
    pub config: Value,
    pub is_active: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sensor {
    pub fn credentials(&self) -> Result<SensorCredentials> {
        SensorCredentials::decode(&self.credentials)
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.config.get("expiresAt").and_then(Value::as_i64)
    }
}

/// What the status endpoint reports about a connected sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSummary {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
}

impl SensorSummary {
    pub fn from_sensor(sensor: &Sensor, now: DateTime<Utc>) -> Self {
        let is_expired = sensor
            .expires_at()
            .map(|expires_at| now.timestamp() > expires_at)
            .unwrap_or(false);

        Self {
            id: sensor.id.clone(),
            name: sensor.name.clone(),
            provider: sensor.provider.clone(),
            sensor_type: sensor.sensor_type.clone(),
            last_sync: sensor.last_sync,
            is_expired,
            created_at: sensor.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_survive_encoding() {
        let creds = SensorCredentials {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: 1_700_000_000,
        };
        let encoded = creds.encode().expect("encode");
        assert_eq!(SensorCredentials::decode(&encoded).expect("decode"), creds);
        assert!(SensorCredentials::decode("not base64!").is_err());
    }

    #[test]
    fn expiry_honours_buffer() {
        let creds = SensorCredentials {
            access_token: String::new(),
            refresh_token: String::new(),
            expires_at: 1_000,
        };
        assert!(!creds.expires_within(600, 300));
        assert!(creds.expires_within(700, 300));
        assert!(creds.expires_within(1_200, 300));
    }
}
