//! Helpers for Azure Storage connection strings (`Key=Value;Key=Value`).

use serde::{Deserialize, Serialize};

const MASKED_ACCOUNT_KEY: &str = "AccountKey=*****";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Task hub credentials the backend is started with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConnectionSettings {
    pub storage_conn_string: String,
    pub hub_name: String,
}

impl StorageConnectionSettings {
    pub fn new(storage_conn_string: impl Into<String>, hub_name: impl Into<String>) -> Self {
        Self {
            storage_conn_string: storage_conn_string.into(),
            hub_name: hub_name.into(),
        }
    }

    pub fn masked_conn_string(&self) -> String {
        mask_storage_conn_string(&self.storage_conn_string)
    }
}

/// Replaces every `AccountKey` value so the secret never leaves the process.
pub fn mask_storage_conn_string(conn_string: &str) -> String {
    conn_string
        .split(';')
        .map(|segment| match split_pair(segment) {
            Some((key, _)) if key.eq_ignore_ascii_case("AccountKey") => MASKED_ACCOUNT_KEY,
            _ => segment,
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub fn account_name(conn_string: &str) -> Option<String> {
    let value = connection_value(conn_string, "AccountName")?;
    let name: String = value
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

pub fn account_key(conn_string: &str) -> Option<String> {
    connection_value(conn_string, "AccountKey").map(str::to_string)
}

/// Table service endpoint, always with a trailing slash.
pub fn table_endpoint(conn_string: &str) -> Option<String> {
    let endpoint = match connection_value(conn_string, "TableEndpoint") {
        Some(endpoint) => endpoint.to_string(),
        None => {
            let account = account_name(conn_string)?;
            let protocol = connection_value(conn_string, "DefaultEndpointsProtocol")
                .unwrap_or("https");
            let suffix = connection_value(conn_string, "EndpointSuffix")
                .unwrap_or(DEFAULT_ENDPOINT_SUFFIX);
            format!("{protocol}://{account}.table.{suffix}")
        }
    };

    if endpoint.ends_with('/') {
        Some(endpoint)
    } else {
        Some(format!("{endpoint}/"))
    }
}

fn connection_value<'a>(conn_string: &'a str, wanted: &str) -> Option<&'a str> {
    conn_string
        .split(';')
        .filter_map(split_pair)
        .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

fn split_pair(segment: &str) -> Option<(&str, &str)> {
    let (key, value) = segment.split_once('=')?;
    Some((key.trim(), value.trim()))
}
