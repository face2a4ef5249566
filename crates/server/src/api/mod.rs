//! Connection management endpoints of the local monitor backend.

use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::http::HeaderMap;
use serde_json::{Map, Value};
use shared::{
    connection::{account_name, mask_storage_conn_string},
    error::{ApiError, ErrorCode},
    protocol::{
        AboutResponse, ConnectionInfo, UpdateConnectionRequest, HUB_NAME_ENV_VAR,
        NONCE_HEADER_NAME, STORAGE_CONNECTION_ENV_VAR,
    },
};
use tokio::fs;

use crate::config::Settings;

pub const LOCAL_SETTINGS_FILE: &str = "local.settings.json";

#[derive(Debug, Clone)]
pub struct ApiContext {
    pub storage_conn_string: String,
    pub hub_name: String,
    pub nonce: Option<String>,
    pub site_name: Option<String>,
    pub function_app_dir: PathBuf,
}

impl From<&Settings> for ApiContext {
    fn from(settings: &Settings) -> Self {
        Self {
            storage_conn_string: settings.storage_conn_string.clone(),
            hub_name: settings.hub_name.clone(),
            nonce: settings.nonce.clone(),
            site_name: settings.site_name.clone(),
            function_app_dir: settings.function_app_dir.clone(),
        }
    }
}

impl ApiContext {
    pub fn local_settings_path(&self) -> PathBuf {
        self.function_app_dir.join(LOCAL_SETTINGS_FILE)
    }
}

/// Every call must carry the nonce the backend was started with.
pub fn validate_nonce(ctx: &ApiContext, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = ctx.nonce.as_deref() else {
        return Err(ApiError::new(
            ErrorCode::Unauthorized,
            "No nonce configured for this backend. Call is rejected.",
        ));
    };

    let presented = headers
        .get(NONCE_HEADER_NAME)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(nonce) if nonce == expected => Ok(()),
        Some(_) => Err(ApiError::new(
            ErrorCode::Unauthorized,
            "Invalid nonce. Call is rejected.",
        )),
        None => Err(ApiError::new(
            ErrorCode::Unauthorized,
            "Nonce header is missing. Call is rejected.",
        )),
    }
}

pub fn about(ctx: &ApiContext) -> AboutResponse {
    AboutResponse {
        account_name: account_name(&ctx.storage_conn_string).unwrap_or_default(),
        hub_name: ctx.hub_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub async fn connection_info(ctx: &ApiContext) -> ConnectionInfo {
    let has_local_settings = fs::try_exists(ctx.local_settings_path())
        .await
        .unwrap_or(false);
    ConnectionInfo {
        // The account key never leaves the backend.
        connection_string: mask_storage_conn_string(&ctx.storage_conn_string),
        hub_name: ctx.hub_name.clone(),
        is_read_only: ctx.site_name.is_some() || !has_local_settings,
    }
}

/// Writes the new connection into `local.settings.json`; the running backend
/// keeps its current connection until restarted.
pub async fn update_connection(
    ctx: &ApiContext,
    request: UpdateConnectionRequest,
) -> Result<(), ApiError> {
    if connection_info(ctx).await.is_read_only {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "Connection settings are read-only for this backend.",
        ));
    }
    if request.hub_name.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "hubName is required"));
    }

    merge_local_settings(&ctx.local_settings_path(), &request)
        .await
        .map_err(internal)
}

async fn merge_local_settings(
    path: &Path,
    request: &UpdateConnectionRequest,
) -> anyhow::Result<()> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let mut document: Value = serde_json::from_str(&raw)
        .with_context(|| format!("'{}' is not valid JSON", path.display()))?;

    let root = document
        .as_object_mut()
        .with_context(|| format!("'{}' must contain a JSON object", path.display()))?;
    let values = root
        .entry("Values")
        .or_insert_with(|| Value::Object(Map::new()));
    if !values.is_object() {
        *values = Value::Object(Map::new());
    }
    let Some(values) = values.as_object_mut() else {
        anyhow::bail!("'Values' in '{}' must be an object", path.display());
    };

    values.insert(
        HUB_NAME_ENV_VAR.to_string(),
        Value::String(request.hub_name.clone()),
    );
    if let Some(conn_string) = request
        .connection_string
        .as_deref()
        .filter(|value| !value.is_empty())
    {
        values.insert(
            STORAGE_CONNECTION_ENV_VAR.to_string(),
            Value::String(conn_string.to_string()),
        );
    }

    let serialized = serde_json::to_string_pretty(&document)?;
    fs::write(path, serialized)
        .await
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    Ok(())
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
