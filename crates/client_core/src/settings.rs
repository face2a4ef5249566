use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "monitor.toml";

/// Placeholder replaced with the chosen port in `backend_base_url`.
pub const PORT_PLACEHOLDER: &str = "{portNr}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub backend_base_url: String,
    pub backend_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub backend_program: String,
    pub backend_args: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            backend_base_url: "http://localhost:{portNr}/a/p/i".into(),
            backend_timeout_seconds: 60,
            request_timeout_seconds: 30,
            backend_program: "func".into(),
            backend_args: ["start", "--port", PORT_PLACEHOLDER, "--csharp"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl MonitorSettings {
    pub fn backend_url_for_port(&self, port: u16) -> String {
        self.backend_base_url
            .replace(PORT_PLACEHOLDER, &port.to_string())
    }

    pub fn backend_args_for_port(&self, port: u16) -> Vec<String> {
        self.backend_args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect()
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    backend_base_url: Option<String>,
    backend_timeout_seconds: Option<u64>,
    request_timeout_seconds: Option<u64>,
    backend_program: Option<String>,
    backend_args: Option<Vec<String>>,
}

/// Defaults, then `monitor.toml` in the working directory, then environment.
pub fn load_settings() -> anyhow::Result<MonitorSettings> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |name| std::env::var(name).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<MonitorSettings> {
    let mut settings = MonitorSettings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;

        if let Some(v) = file_cfg.backend_base_url {
            settings.backend_base_url = v;
        }
        if let Some(v) = file_cfg.backend_timeout_seconds {
            settings.backend_timeout_seconds = v;
        }
        if let Some(v) = file_cfg.request_timeout_seconds {
            settings.request_timeout_seconds = v;
        }
        if let Some(v) = file_cfg.backend_program {
            settings.backend_program = v;
        }
        if let Some(v) = file_cfg.backend_args {
            settings.backend_args = v;
        }
    }

    if let Some(v) = env("DFM_BACKEND_BASE_URL") {
        settings.backend_base_url = v;
    }
    if let Some(v) = env("DFM_BACKEND_TIMEOUT_SECONDS") {
        settings.backend_timeout_seconds = v
            .parse()
            .with_context(|| format!("DFM_BACKEND_TIMEOUT_SECONDS is not a number: '{v}'"))?;
    }
    if let Some(v) = env("DFM_REQUEST_TIMEOUT_SECONDS") {
        settings.request_timeout_seconds = v
            .parse()
            .with_context(|| format!("DFM_REQUEST_TIMEOUT_SECONDS is not a number: '{v}'"))?;
    }

    Ok(settings)
}
