//! Wire payloads and well-known names shared by the monitor client and its backend.

use serde::{Deserialize, Serialize};

/// Header carrying the per-process secret the client and backend agree on.
pub const NONCE_HEADER_NAME: &str = "x-dfm-nonce";

pub const NONCE_ENV_VAR: &str = "DFM_NONCE";
pub const HUB_NAME_ENV_VAR: &str = "DFM_HUB_NAME";
pub const STORAGE_CONNECTION_ENV_VAR: &str = "AzureWebJobsStorage";
pub const SITE_NAME_ENV_VAR: &str = "WEBSITE_SITE_NAME";

/// Route prefix that separates api methods from static content.
pub const API_ROUTE_PREFIX: &str = "/a/p/i";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutResponse {
    pub account_name: String,
    pub hub_name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_string: String,
    pub hub_name: String,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConnectionRequest {
    #[serde(default)]
    pub connection_string: Option<String>,
    pub hub_name: String,
}
