use std::{collections::HashMap, fs, net::SocketAddr, path::PathBuf};

use anyhow::Context;
use shared::protocol::{
    HUB_NAME_ENV_VAR, NONCE_ENV_VAR, SITE_NAME_ENV_VAR, STORAGE_CONNECTION_ENV_VAR,
};

pub const SETTINGS_FILE: &str = "monitor-backend.toml";
pub const DEFAULT_HUB_NAME: &str = "DurableFunctionsHub";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub function_app_dir: PathBuf,
    pub storage_conn_string: String,
    pub hub_name: String,
    pub nonce: Option<String>,
    /// Set when hosted in Azure, which makes the connection read-only.
    pub site_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7072".into(),
            function_app_dir: PathBuf::from("."),
            storage_conn_string: String::new(),
            hub_name: DEFAULT_HUB_NAME.into(),
            nonce: None,
            site_name: None,
        }
    }
}

impl Settings {
    pub fn socket_addr(&self, port_override: Option<u16>) -> anyhow::Result<SocketAddr> {
        let mut addr: SocketAddr = self
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.bind_addr))?;
        if let Some(port) = port_override {
            addr.set_port(port);
        }
        Ok(addr)
    }
}

pub fn load_settings() -> Settings {
    let raw = fs::read_to_string(SETTINGS_FILE).ok();
    load_settings_from(raw.as_deref(), |name| std::env::var(name).ok())
}

pub fn load_settings_from(raw: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = raw {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.bind_addr = v.clone();
            }
            if let Some(v) = file_cfg.get("function_app_dir") {
                settings.function_app_dir = PathBuf::from(v);
            }
        }
    }

    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("APP__FUNCTION_APP_DIR") {
        settings.function_app_dir = PathBuf::from(v);
    }

    if let Some(v) = env(STORAGE_CONNECTION_ENV_VAR) {
        settings.storage_conn_string = v;
    }
    if let Some(v) = env(HUB_NAME_ENV_VAR).filter(|v| !v.is_empty()) {
        settings.hub_name = v;
    }

    settings.nonce = env(NONCE_ENV_VAR).filter(|v| !v.is_empty());
    settings.site_name = env(SITE_NAME_ENV_VAR).filter(|v| !v.is_empty());

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
