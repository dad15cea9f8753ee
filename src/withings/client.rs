use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::db::SensorCredentials;
use crate::settings::WithingsSettings;
use crate::log_warn;

const ENABLE_LOGS: bool = true;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const OAUTH_SCOPE: &str = "user.metrics,user.activity";
pub const MAX_PAGES: usize = 100;

#[derive(Debug, Error)]
pub enum WithingsError {
    #[error("withings request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("withings api error (status {status}): {message}")]
    Api { status: i64, message: String },
    #[error("failed to refresh withings token: {0}")]
    TokenRefresh(String),
    #[error("unexpected withings response: {0}")]
    Decode(String),
}

/// Paged data sets the sync job pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Measurements,
    Activity,
    Sleep,
}

impl Resource {
    fn path(&self) -> &'static str {
        match self {
            Resource::Measurements => "/measure",
            Resource::Activity => "/v2/measure",
            Resource::Sleep => "/v2/sleep",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Resource::Measurements => "getmeas",
            Resource::Activity => "getactivity",
            Resource::Sleep => "getsummary",
        }
    }

    fn data_key(&self) -> &'static str {
        match self {
            Resource::Measurements => "measuregrps",
            Resource::Activity => "activities",
            Resource::Sleep => "series",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    error: Option<String>,
}

impl Envelope {
    fn into_body(self) -> Result<Value, WithingsError> {
        if self.status != 0 {
            return Err(WithingsError::Api {
                status: self.status,
                message: self.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(self.body)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TokenBody {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    #[serde(default)]
    userid: Value,
    #[serde(default)]
    scope: Option<String>,
}

/// Tokens issued by the OAuth endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub withings_user_id: Option<String>,
    pub scope: Option<String>,
}

impl TokenGrant {
    pub fn credentials(&self, now_secs: i64) -> SensorCredentials {
        SensorCredentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: now_secs + self.expires_in,
        }
    }
}

impl From<TokenBody> for TokenGrant {
    fn from(body: TokenBody) -> Self {
        let withings_user_id = match body.userid {
            Value::String(id) => Some(id),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        };
        Self {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_in: body.expires_in,
            withings_user_id,
            scope: body.scope,
        }
    }
}

#[derive(Clone)]
pub struct WithingsClient {
    http: reqwest::Client,
    api_base: String,
    account_base: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl WithingsClient {
    pub fn new(settings: &WithingsSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create withings http client")?;

        Ok(Self {
            http,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            account_base: settings.account_base.trim_end_matches('/').to_string(),
            client_id: settings.client_id.trim().to_string(),
            client_secret: settings.client_secret.trim().to_string(),
            redirect_uri: settings.redirect_uri.trim().to_string(),
        })
    }

    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let url = Url::parse_with_params(
            &format!("{}/oauth2_user/authorize2", self.account_base),
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("scope", OAUTH_SCOPE),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("state", state),
            ],
        )
        .context("invalid withings account base url")?;
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, WithingsError> {
        let form = [
            ("action", "requesttoken"),
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        self.request_token(&form).await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, WithingsError> {
        let form = [
            ("action", "requesttoken"),
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        self.request_token(&form).await.map_err(|err| match err {
            WithingsError::Api { status, message } => {
                WithingsError::TokenRefresh(format!("status {status}: {message}"))
            }
            other => other,
        })
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenGrant, WithingsError> {
        let envelope: Envelope = self
            .http
            .post(format!("{}/v2/oauth2", self.api_base))
            .form(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let body: TokenBody = serde_json::from_value(envelope.into_body()?)
            .map_err(|err| WithingsError::Decode(format!("token body: {err}")))?;
        Ok(body.into())
    }

    /// Fetches every page of `resource`, following `more`/`offset` for at most
    /// [`MAX_PAGES`] pages.
    pub async fn fetch_all(
        &self,
        access_token: &str,
        resource: Resource,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, WithingsError> {
        let mut items = Vec::new();
        let mut offset: i64 = 0;

        for page in 1..=MAX_PAGES {
            let mut form: Vec<(&str, String)> = vec![("action", resource.action().to_string())];
            form.extend(params.iter().cloned());
            form.push(("offset", offset.to_string()));

            let envelope: Envelope = self
                .http
                .post(format!("{}{}", self.api_base, resource.path()))
                .bearer_auth(access_token)
                .form(&form)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let body = envelope.into_body()?;

            if let Some(batch) = body.get(resource.data_key()).and_then(Value::as_array) {
                items.extend(batch.iter().cloned());
            }

            let more = body
                .get("more")
                .and_then(|more| more.as_bool().or_else(|| more.as_i64().map(|n| n != 0)))
                .unwrap_or(false);
            if !more {
                break;
            }
            offset = body.get("offset").and_then(Value::as_i64).unwrap_or(0);

            if page == MAX_PAGES {
                log_warn!(
                    "Withings {} sync stopped at {} pages",
                    resource.action(),
                    MAX_PAGES
                );
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> WithingsClient {
        WithingsClient::new(&WithingsSettings {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "http://localhost/callback".into(),
            api_base: server.base_url(),
            account_base: "https://account.example.com/".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn authorize_url_carries_client_and_scope() {
        let server = MockServer::start_async().await;
        let url = client(&server).authorize_url("state-1").unwrap();

        assert!(url.starts_with("https://account.example.com/oauth2_user/authorize2?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("scope=user.metrics%2Cuser.activity"));
        assert!(url.contains("state=state-1"));
    }

    #[tokio::test]
    async fn follows_pagination_until_more_is_false() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/measure")
                    .header("authorization", "Bearer token-1")
                    .form_urlencoded_tuple("action", "getactivity")
                    .form_urlencoded_tuple("offset", "0");
                then.status(200).json_body(json!({
                    "status": 0,
                    "body": {"activities": [{"date": "2025-10-20"}], "more": true, "offset": 7}
                }));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/measure")
                    .form_urlencoded_tuple("offset", "7");
                then.status(200).json_body(json!({
                    "status": 0,
                    "body": {"activities": [{"date": "2025-10-21"}, {"date": "2025-10-22"}], "more": 0}
                }));
            })
            .await;

        let items = client(&server)
            .fetch_all("token-1", Resource::Activity, &[("startdateymd", "2025-10-01".into())])
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        first.assert_calls_async(1).await;
        second.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn non_zero_status_is_an_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/measure");
                then.status(200)
                    .json_body(json!({"status": 401, "body": {}, "error": "invalid_token"}));
            })
            .await;

        let err = client(&server)
            .fetch_all("stale", Resource::Measurements, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, WithingsError::Api { status: 401, ref message } if message == "invalid_token"));
    }

    #[tokio::test]
    async fn refresh_maps_rejection_to_token_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/oauth2")
                    .form_urlencoded_tuple("grant_type", "refresh_token")
                    .form_urlencoded_tuple("refresh_token", "r-old");
                then.status(200).json_body(json!({"status": 503, "body": {}}));
            })
            .await;

        let err = client(&server).refresh_token("r-old").await.unwrap_err();
        assert!(matches!(err, WithingsError::TokenRefresh(_)));
    }

    #[tokio::test]
    async fn code_exchange_returns_grant() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/oauth2")
                    .form_urlencoded_tuple("grant_type", "authorization_code")
                    .form_urlencoded_tuple("code", "abc");
                then.status(200).json_body(json!({
                    "status": 0,
                    "body": {
                        "access_token": "a",
                        "refresh_token": "r",
                        "expires_in": 10800,
                        "userid": 42,
                        "scope": "user.metrics"
                    }
                }));
            })
            .await;

        let grant = client(&server).exchange_code("abc").await.unwrap();
        assert_eq!(grant.withings_user_id.as_deref(), Some("42"));
        assert_eq!(grant.credentials(1_000).expires_at, 11_800);
    }
}
