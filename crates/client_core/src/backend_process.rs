//! Runs a local monitor backend as a child process and waits until it answers.

use std::{ops::Range, path::PathBuf, process::Stdio, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::{Method, Url};
use shared::{
    connection::{self, StorageConnectionSettings},
    domain::BackendProperties,
    protocol::{AboutResponse, HUB_NAME_ENV_VAR, NONCE_ENV_VAR, STORAGE_CONNECTION_ENV_VAR},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    process::{Child, Command},
    sync::{oneshot, Mutex},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    cancel::CancelToken,
    error::BackendError,
    settings::MonitorSettings,
    storage_auth,
    transport::{BackendClient, HttpBackendClient},
};

pub const BACKEND_PORT_RANGE: Range<u16> = 37072..38000;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BackendProcessError {
    #[error("The provided Storage Connection String doesn't contain a valid accountName.")]
    MissingAccountName,
    #[error("The provided Storage Connection String doesn't contain a valid accountKey.")]
    MissingAccountKey,
    #[error("The provided Storage Connection String and/or Hub Name seem to be invalid. {0}")]
    InvalidCredentials(String),
    #[error("Failed to choose port for backend: no free port in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Func: {0}")]
    Stderr(String),
    #[error("Backend process exited before responding ({0})")]
    Exited(String),
    #[error("Cancelled by the user")]
    Cancelled,
    #[error("No response within {0} seconds. Ensure you have the latest Azure Functions Core Tools installed globally.")]
    Timeout(u64),
    #[error(transparent)]
    Client(#[from] BackendError),
}

#[derive(Default)]
struct ProcessState {
    child: Option<Child>,
    properties: Option<BackendProperties>,
}

/// One backend per instance. Callers racing on [`BackendProcess::get_backend`]
/// all wait for the same start.
pub struct BackendProcess {
    binaries_folder: PathBuf,
    connection: StorageConnectionSettings,
    settings: MonitorSettings,
    nonce: String,
    state: Mutex<ProcessState>,
}

impl BackendProcess {
    pub fn new(
        binaries_folder: impl Into<PathBuf>,
        connection: StorageConnectionSettings,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            binaries_folder: binaries_folder.into(),
            connection,
            settings,
            nonce: generate_nonce(),
            state: Mutex::new(ProcessState::default()),
        }
    }

    pub fn storage_connection_settings(&self) -> &StorageConnectionSettings {
        &self.connection
    }

    /// Secret the backend expects in the nonce header.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub async fn backend_properties(&self) -> Option<BackendProperties> {
        self.state.lock().await.properties.clone()
    }

    /// Returns the running backend, starting it first if needed. A failed
    /// start is cleaned up so the next call tries again.
    pub async fn get_backend(
        &self,
        cancel: &CancelToken,
    ) -> Result<BackendProperties, BackendProcessError> {
        let mut state = self.state.lock().await;
        if let Some(properties) = &state.properties {
            return Ok(properties.clone());
        }

        match self.start(&mut state, cancel).await {
            Ok(properties) => {
                info!(backend_url = %properties.backend_url, "backend is running");
                state.properties = Some(properties.clone());
                Ok(properties)
            }
            Err(err) => {
                warn!(error = %err, "backend failed to start");
                cleanup_locked(&mut state).await;
                Err(err)
            }
        }
    }

    /// Kills the backend process, if any, and forgets its properties.
    pub async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        cleanup_locked(&mut state).await;
    }

    async fn start(
        &self,
        state: &mut ProcessState,
        cancel: &CancelToken,
    ) -> Result<BackendProperties, BackendProcessError> {
        check_storage_credentials(&self.connection)?;

        let http = reqwest::Client::builder()
            .timeout(self.settings.request_timeout())
            .build()
            .map_err(BackendError::from)?;
        let credentials = tokio::spawn({
            let connection = self.connection.clone();
            async move { verify_storage_credentials(&connection, &http).await }
        });

        match self.start_on_free_port(state, cancel).await {
            Ok(properties) => {
                credentials.abort();
                Ok(properties)
            }
            Err(BackendProcessError::Cancelled) => {
                credentials.abort();
                Err(BackendProcessError::Cancelled)
            }
            // Bad credentials explain a failed start better than the process does.
            Err(err) => match credentials.await {
                Ok(Err(credentials_err)) => Err(credentials_err),
                _ => Err(err),
            },
        }
    }

    async fn start_on_free_port(
        &self,
        state: &mut ProcessState,
        cancel: &CancelToken,
    ) -> Result<BackendProperties, BackendProcessError> {
        let port = find_free_port(BACKEND_PORT_RANGE.clone())
            .await
            .ok_or(BackendProcessError::NoFreePort {
                start: BACKEND_PORT_RANGE.start,
                end: BACKEND_PORT_RANGE.end,
            })?;
        let backend_url = self.settings.backend_url_for_port(port);
        info!(
            %backend_url,
            folder = %self.binaries_folder.display(),
            connection = %self.connection.masked_conn_string(),
            hub = %self.connection.hub_name,
            "starting backend"
        );

        let mut child = Command::new(&self.settings.backend_program)
            .args(self.settings.backend_args_for_port(port))
            .current_dir(&self.binaries_folder)
            .env(STORAGE_CONNECTION_ENV_VAR, &self.connection.storage_conn_string)
            .env(HUB_NAME_ENV_VAR, &self.connection.hub_name)
            .env(NONCE_ENV_VAR, &self.nonce)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendProcessError::Spawn {
                program: self.settings.backend_program.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "backend", "{line}");
                }
            });
        }

        let (first_error_tx, first_error) = oneshot::channel();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut first_error_tx = Some(first_error_tx);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    error!(target: "backend", "{line}");
                    if let Some(tx) = first_error_tx.take() {
                        let _ = tx.send(line);
                    }
                }
            });
        }

        state.child = Some(child);

        let client = HttpBackendClient::new(
            backend_url.clone(),
            Some(self.nonce.clone()),
            self.settings.request_timeout(),
        )?;
        let mut startup = Startup {
            state,
            first_error,
            cancel,
            deadline: Instant::now() + self.settings.backend_timeout(),
            timeout_seconds: self.settings.backend_timeout_seconds,
        };
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        debug!(%backend_url, "waiting for backend to respond");
        loop {
            interval.tick().await;
            startup.check()?;

            // A ping may hang; keep checking on every tick while it is pending.
            let ping = client.call(Method::GET, "/about");
            tokio::pin!(ping);
            let result = loop {
                tokio::select! {
                    result = &mut ping => break result,
                    _ = interval.tick() => startup.check()?,
                }
            };

            match result {
                Ok(payload) => {
                    let about: AboutResponse = serde_json::from_value(payload)
                        .map_err(|err| BackendError::Decode(err.to_string()))?;
                    return Ok(BackendProperties {
                        backend_url,
                        account_name: about.account_name,
                        hub_name: about.hub_name,
                    });
                }
                Err(err) => debug!(error = %err, "backend not ready yet"),
            }
        }
    }
}

/// What a starting backend is watched for between pings.
struct Startup<'a> {
    state: &'a mut ProcessState,
    first_error: oneshot::Receiver<String>,
    cancel: &'a CancelToken,
    deadline: Instant,
    timeout_seconds: u64,
}

impl Startup<'_> {
    fn check(&mut self) -> Result<(), BackendProcessError> {
        if self.cancel.is_cancelled() {
            return Err(BackendProcessError::Cancelled);
        }
        if let Ok(line) = self.first_error.try_recv() {
            return Err(BackendProcessError::Stderr(line));
        }
        if let Some(child) = self.state.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(BackendProcessError::Exited(status.to_string()));
            }
        }
        if Instant::now() >= self.deadline {
            return Err(BackendProcessError::Timeout(self.timeout_seconds));
        }
        Ok(())
    }
}

async fn cleanup_locked(state: &mut ProcessState) {
    state.properties = None;
    let Some(mut child) = state.child.take() else {
        return;
    };

    info!("stopping backend process");
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill backend process");
    }
}

/// The backend needs an account name and key to reach the task hub.
pub fn check_storage_credentials(
    settings: &StorageConnectionSettings,
) -> Result<(), BackendProcessError> {
    if connection::account_name(&settings.storage_conn_string).is_none() {
        return Err(BackendProcessError::MissingAccountName);
    }
    if connection::account_key(&settings.storage_conn_string).is_none() {
        return Err(BackendProcessError::MissingAccountKey);
    }
    Ok(())
}

/// Reads one row of the hub's `Instances` table with the given credentials.
pub async fn verify_storage_credentials(
    settings: &StorageConnectionSettings,
    http: &reqwest::Client,
) -> Result<(), BackendProcessError> {
    let conn_string = &settings.storage_conn_string;
    let account = connection::account_name(conn_string)
        .ok_or(BackendProcessError::MissingAccountName)?;
    let account_key = connection::account_key(conn_string)
        .ok_or(BackendProcessError::MissingAccountKey)?;
    let endpoint = connection::table_endpoint(conn_string)
        .ok_or(BackendProcessError::MissingAccountName)?;

    let invalid = |message: String| BackendProcessError::InvalidCredentials(message);
    let mut url = Url::parse(&format!("{endpoint}{}Instances", settings.hub_name))
        .map_err(|err| invalid(err.to_string()))?;
    let headers = storage_auth::table_auth_headers(&account, &account_key, &url, Utc::now())
        .map_err(|err| invalid(err.to_string()))?;
    url.set_query(Some("$top=1"));

    http.get(url)
        .headers(headers)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|err| invalid(err.to_string()))?;

    debug!(hub = %settings.hub_name, "storage credentials verified");
    Ok(())
}

/// First port in `range` that can be bound on the loopback interface.
pub async fn find_free_port(range: Range<u16>) -> Option<u16> {
    for port in range {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return Some(port);
        }
    }
    None
}

fn generate_nonce() -> String {
    let bytes: Vec<u8> = (0..4)
        .flat_map(|_| Uuid::new_v4().into_bytes())
        .collect();
    STANDARD.encode(bytes)
}

#[cfg(test)]
#[path = "tests/backend_process_tests.rs"]
mod tests;
