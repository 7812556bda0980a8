use crate::error::ApiError;
use crate::AppState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use models::{Error, Principal};
use std::collections::BTreeSet;

/// Static principal table loaded at startup. Identity providers are out of
/// scope; the gateway authenticates bearer/admin tokens and API keys.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub admin_token: Option<String>,
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyEntry {
    pub key: String,
    pub id: String,
    #[serde(default = "default_basic_path")]
    pub basic_path: String,
    #[serde(default)]
    pub storage_config_ids: BTreeSet<String>,
}

fn default_basic_path() -> String {
    "/".to_string()
}

impl AuthConfig {
    pub fn principal_for(&self, admin_token: Option<&str>, api_key: Option<&str>) -> Option<Principal> {
        if let (Some(expected), Some(given)) = (self.admin_token.as_deref(), admin_token) {
            if expected == given {
                return Some(Principal::Admin { id: "admin".to_string() });
            }
        }
        if let Some(given) = api_key {
            if let Some(entry) = self.api_keys.iter().find(|k| k.key == given) {
                return Some(Principal::ApiKey {
                    id: entry.id.clone(),
                    basic_path: entry.basic_path.clone(),
                    storage_config_ids: entry.storage_config_ids.clone(),
                });
            }
        }
        None
    }
}

/// Extracts the authenticated principal from `Authorization: Bearer` (admin
/// token) or `x-api-key`.
pub struct Auth(pub Principal);

#[axum::async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let api_key = parts.headers.get("x-api-key").and_then(|v| v.to_str().ok());

        state
            .auth
            .principal_for(bearer, api_key)
            .map(Auth)
            .ok_or_else(|| ApiError(Error::Forbidden("missing or invalid credentials".into())))
    }
}

/// Admin-only extractor for the scheduled-task API.
pub struct AdminAuth(pub Principal);

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Auth(principal) = Auth::from_request_parts(parts, state).await?;
        if !principal.is_admin() {
            return Err(ApiError(Error::Forbidden("administrator required".into())));
        }
        Ok(AdminAuth(principal))
    }
}
