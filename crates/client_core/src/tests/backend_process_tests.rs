use super::*;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use shared::protocol::NONCE_HEADER_NAME;

const CONN_STRING: &str =
    "DefaultEndpointsProtocol=https;AccountName=devaccount;AccountKey=c2VjcmV0;EndpointSuffix=core.windows.net";
const ACCOUNT_KEY: &str = "ZGV2c3RvcmUtc2VjcmV0LWtleQ==";

async fn about(
    State(nonce): State<String>,
    headers: HeaderMap,
) -> Result<Json<AboutResponse>, StatusCode> {
    let presented = headers
        .get(NONCE_HEADER_NAME)
        .and_then(|value| value.to_str().ok());
    if presented != Some(nonce.as_str()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(AboutResponse {
        account_name: "devaccount".into(),
        hub_name: "TestHub".into(),
        version: "test".into(),
    }))
}

async fn spawn_about_server(nonce: String) -> Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().route("/about", get(about)).with_state(nonce);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

/// Answers `GET /devaccount/TestHubInstances?$top=1` only when the request
/// is signed with [`ACCOUNT_KEY`] and `accept` is set.
async fn instances_table(
    State(accept): State<bool>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let signature = storage_auth::shared_key_lite_signature(
        ACCOUNT_KEY,
        &header(storage_auth::DATE_HEADER_NAME),
        "/devaccount/devaccount/TestHubInstances",
    )
    .expect("signature");

    let signed = header("authorization") == format!("SharedKeyLite devaccount:{signature}");
    if accept && signed && query.get("$top").map(String::as_str) == Some("1") {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    }
}

/// Connection string whose table endpoint is a local stub.
async fn table_conn_string(accept: bool) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/devaccount/TestHubInstances", get(instances_table))
        .with_state(accept);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!(
        "AccountName=devaccount;AccountKey={ACCOUNT_KEY};TableEndpoint=http://{addr}/devaccount"
    )
}

/// Accepts connections and never answers them.
async fn spawn_silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    format!("http://{addr}")
}

fn settings(base_url: &str, program: &str, args: &[&str]) -> MonitorSettings {
    MonitorSettings {
        backend_base_url: base_url.to_string(),
        backend_timeout_seconds: 5,
        request_timeout_seconds: 1,
        backend_program: program.to_string(),
        backend_args: args.iter().map(|arg| arg.to_string()).collect(),
    }
}

async fn process(settings: MonitorSettings) -> BackendProcess {
    BackendProcess::new(
        std::env::temp_dir(),
        StorageConnectionSettings::new(table_conn_string(true).await, "TestHub"),
        settings,
    )
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("client")
}

#[test]
fn credentials_need_account_name_and_key() {
    let missing_name = StorageConnectionSettings::new("AccountKey=abc", "hub");
    assert!(matches!(
        check_storage_credentials(&missing_name),
        Err(BackendProcessError::MissingAccountName)
    ));

    let missing_key = StorageConnectionSettings::new("AccountName=dev", "hub");
    let err = check_storage_credentials(&missing_key).expect_err("missing key");
    assert_eq!(
        err.to_string(),
        "The provided Storage Connection String doesn't contain a valid accountKey."
    );

    let complete = StorageConnectionSettings::new(CONN_STRING, "hub");
    assert!(check_storage_credentials(&complete).is_ok());
}

#[tokio::test]
async fn nonce_is_random_and_base64() {
    let first = process(MonitorSettings::default()).await;
    let second = process(MonitorSettings::default()).await;
    assert_ne!(first.nonce(), second.nonce());
    assert_eq!(STANDARD.decode(first.nonce()).expect("base64").len(), 64);
}

#[tokio::test]
async fn skips_ports_in_use() {
    let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = taken.local_addr().expect("addr").port();

    assert_eq!(find_free_port(port..port + 1).await, None);
    drop(taken);
    assert_eq!(find_free_port(port..port + 1).await, Some(port));
}

#[tokio::test]
async fn invalid_credentials_fail_before_spawning() {
    let backend = BackendProcess::new(
        std::env::temp_dir(),
        StorageConnectionSettings::new("UseDevelopmentStorage=true", "hub"),
        settings(&unused_url().await, "definitely-not-a-real-program", &[]),
    );
    let err = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect_err("should fail");
    assert!(matches!(err, BackendProcessError::MissingAccountName));
}

#[tokio::test]
async fn missing_program_is_reported() {
    let backend = process(settings(
        &unused_url().await,
        "definitely-not-a-real-program",
        &[],
    ))
    .await;
    let err = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect_err("should fail");
    assert!(matches!(err, BackendProcessError::Spawn { .. }));
    assert!(backend.backend_properties().await.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn returns_properties_once_about_answers() {
    let backend = process(settings("", "sleep", &["30"])).await;
    let url = spawn_about_server(backend.nonce().to_string())
        .await
        .expect("spawn server");
    let backend = BackendProcess {
        settings: settings(&url, "sleep", &["30"]),
        ..backend
    };
    assert_eq!(backend.storage_connection_settings().hub_name, "TestHub");

    let properties = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect("backend");
    assert_eq!(
        properties,
        BackendProperties {
            backend_url: url.clone(),
            account_name: "devaccount".into(),
            hub_name: "TestHub".into(),
        }
    );

    // Second call reuses the running backend.
    let again = backend
        .get_backend(&CancelToken::new(1))
        .await
        .expect("backend");
    assert_eq!(again, properties);

    backend.cleanup().await;
    assert!(backend.backend_properties().await.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn first_stderr_line_fails_the_start() {
    let backend = process(settings(
        &unused_url().await,
        "sh",
        &["-c", "echo 'port already taken' >&2; sleep 30"],
    ))
    .await;
    let err = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect_err("should fail");
    assert_eq!(err.to_string(), "Func: port already taken");
}

#[cfg(unix)]
#[tokio::test]
async fn cancelled_start_is_cleaned_up() {
    let backend = process(settings(&unused_url().await, "sleep", &["30"])).await;
    let cancel = CancelToken::new(0);
    cancel.cancel();

    let err = backend.get_backend(&cancel).await.expect_err("should fail");
    assert_eq!(err.to_string(), "Cancelled by the user");
    assert!(backend.state.lock().await.child.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn silent_backend_times_out() {
    let mut silent = settings(&unused_url().await, "sleep", &["30"]);
    silent.backend_timeout_seconds = 0;
    let backend = process(silent).await;

    let err = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect_err("should fail");
    assert!(err
        .to_string()
        .starts_with("No response within 0 seconds."));
}

#[cfg(unix)]
#[tokio::test]
async fn exited_backend_is_reported() {
    let backend = process(settings(&unused_url().await, "true", &[])).await;
    let err = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect_err("should fail");
    assert!(matches!(err, BackendProcessError::Exited(_)));
}

#[tokio::test]
async fn signed_table_read_accepts_valid_credentials() {
    let connection = StorageConnectionSettings::new(table_conn_string(true).await, "TestHub");
    verify_storage_credentials(&connection, &http_client())
        .await
        .expect("credentials");
}

#[tokio::test]
async fn rejected_table_read_reports_invalid_credentials() {
    let connection = StorageConnectionSettings::new(table_conn_string(false).await, "TestHub");
    let err = verify_storage_credentials(&connection, &http_client())
        .await
        .expect_err("should fail");
    assert!(matches!(err, BackendProcessError::InvalidCredentials(_)));
    assert!(err
        .to_string()
        .starts_with("The provided Storage Connection String and/or Hub Name seem to be invalid."));
}

#[cfg(unix)]
#[tokio::test]
async fn invalid_credentials_replace_the_process_error() {
    let backend = BackendProcess::new(
        std::env::temp_dir(),
        StorageConnectionSettings::new(table_conn_string(false).await, "TestHub"),
        settings(&unused_url().await, "true", &[]),
    );
    let err = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect_err("should fail");
    assert!(matches!(err, BackendProcessError::InvalidCredentials(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn hung_ping_does_not_delay_the_timeout() {
    let mut hung = settings(&spawn_silent_server().await, "sleep", &["30"]);
    hung.backend_timeout_seconds = 1;
    hung.request_timeout_seconds = 30;
    let backend = process(hung).await;

    let started = std::time::Instant::now();
    let err = backend
        .get_backend(&CancelToken::new(0))
        .await
        .expect_err("should fail");
    assert!(matches!(err, BackendProcessError::Timeout(1)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[cfg(unix)]
#[tokio::test]
async fn hung_ping_does_not_delay_cancellation() {
    let mut hung = settings(&spawn_silent_server().await, "sleep", &["30"]);
    hung.backend_timeout_seconds = 60;
    hung.request_timeout_seconds = 30;
    let backend = process(hung).await;

    let cancel = Arc::new(CancelToken::new(0));
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            cancel.cancel();
        }
    });

    let started = std::time::Instant::now();
    let err = backend.get_backend(&cancel).await.expect_err("should fail");
    assert!(matches!(err, BackendProcessError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(backend.state.lock().await.child.is_none());
}
