//! OAuth token management for the Graph driver.
//!
//! The manager caches one access token per driver instance, refreshes it
//! five minutes before expiry, and serializes refreshes behind a mutex so
//! concurrent callers await a single in-flight renewal.

use chrono::{DateTime, Duration, Utc};
use models::Error;

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenManager {
    http: reqwest::Client,
    client_id: String,
    client_secret: Option<String>,
    tenant: String,
    refresh_token: String,
    /// Pluggable renewal endpoint that takes `refresh_ui` as a GET
    /// parameter; when absent the native OAuth endpoint is used.
    online_api_url: Option<String>,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        client_id: String,
        client_secret: Option<String>,
        tenant: String,
        refresh_token: String,
        online_api_url: Option<String>,
    ) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            tenant,
            refresh_token,
            online_api_url,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// A valid access token, refreshed when within the expiry margin.
    /// At most one refresh is in flight; failures invalidate the cache.
    pub async fn access_token(&self) -> Result<String, Error> {
        let mut guard = self.cached.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - Utc::now() > Duration::seconds(REFRESH_MARGIN_SECS) {
                return Ok(cached.access_token.clone());
            }
        }
        *guard = None;

        let fresh = self.refresh().await?;
        let token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    async fn refresh(&self) -> Result<CachedToken, Error> {
        let resp = if let Some(api) = &self.online_api_url {
            self.http
                .get(api)
                .query(&[("refresh_ui", self.refresh_token.as_str())])
                .send()
                .await
        } else {
            let mut form = vec![
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
                ("scope", "https://graph.microsoft.com/.default offline_access"),
            ];
            if let Some(secret) = &self.client_secret {
                form.push(("client_secret", secret.as_str()));
            }
            self.http
                .post(format!(
                    "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                    self.tenant
                ))
                .form(&form)
                .send()
                .await
        };

        let resp =
            resp.map_err(|err| Error::upstream(0, None, format!("token renewal: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, "graph token renewal failed");
            return Err(Error::upstream(
                status.as_u16(),
                None,
                format!("token renewal rejected: {}", body.chars().take(200).collect::<String>()),
            ));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|err| Error::upstream(0, None, format!("token renewal body: {err}")))?;
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("tenant", &self.tenant)
            .field("online_api", &self.online_api_url.is_some())
            .finish()
    }
}
