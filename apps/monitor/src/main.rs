use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use client_core::{
    load_settings, orchestrations::fields, time::parse_timestamp, time::to_iso_string,
    BackendProcess, CancelToken, HttpBackendClient, OrchestrationsEvent, OrchestrationsState,
};
use shared::{
    connection::StorageConnectionSettings,
    domain::{EntityTypeFilter, FilterOperator, OrderDirection},
};
use storage::{sqlite_url_for_path, KeyValueStore, SqliteKeyValueStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "monitor", about = "Browse Durable Functions orchestrations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print orchestrations as JSON lines.
    List(ListArgs),
    /// Start a local backend and keep it running until Ctrl-C.
    StartBackend(StartBackendArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Backend api url, e.g. http://localhost:37072/a/p/i
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    nonce: Option<String>,
    /// SQLite file holding the persisted view state.
    #[arg(long, default_value = "./data/monitor-state.db")]
    state_db: PathBuf,
    #[arg(long, default_value = "default")]
    scope: String,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    till: Option<String>,
    #[arg(long, value_enum)]
    entity_type: Option<EntityTypeArg>,
    #[arg(long)]
    filter_column: Option<String>,
    #[arg(long, value_enum)]
    filter_operator: Option<FilterOperatorArg>,
    #[arg(long)]
    filter_value: Option<String>,
    #[arg(long)]
    order_by: Option<String>,
    #[arg(long, requires = "order_by")]
    desc: bool,
    /// Number of pages to fetch.
    #[arg(long, default_value_t = 1)]
    pages: usize,
    /// Keep refreshing the first page every N seconds until Ctrl-C.
    #[arg(long)]
    watch: Option<u64>,
}

#[derive(Args, Debug)]
struct StartBackendArgs {
    /// Folder with the backend binaries.
    #[arg(long)]
    binaries: PathBuf,
    #[arg(long)]
    connection_string: String,
    #[arg(long)]
    hub: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EntityTypeArg {
    Both,
    Orchestrations,
    Entities,
}

impl From<EntityTypeArg> for EntityTypeFilter {
    fn from(value: EntityTypeArg) -> Self {
        match value {
            EntityTypeArg::Both => Self::Both,
            EntityTypeArg::Orchestrations => Self::OrchestrationsOnly,
            EntityTypeArg::Entities => Self::EntitiesOnly,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FilterOperatorArg {
    Equals,
    StartsWith,
    Contains,
}

impl From<FilterOperatorArg> for FilterOperator {
    fn from(value: FilterOperatorArg) -> Self {
        match value {
            FilterOperatorArg::Equals => Self::Equals,
            FilterOperatorArg::StartsWith => Self::StartsWith,
            FilterOperatorArg::Contains => Self::Contains,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::List(args) => list(args).await,
        Command::StartBackend(args) => start_backend(args).await,
    }
}

async fn list(args: ListArgs) -> Result<()> {
    let settings = load_settings()?;
    let backend_url = args
        .backend_url
        .clone()
        .unwrap_or_else(|| settings.backend_base_url.clone());
    if backend_url.contains(client_core::settings::PORT_PLACEHOLDER) {
        bail!("no backend url configured; pass --backend-url or set DFM_BACKEND_BASE_URL");
    }

    let client =
        HttpBackendClient::new(&backend_url, args.nonce.clone(), settings.request_timeout())
            .context("failed to build http client")?;
    let store = SqliteKeyValueStore::new(&sqlite_url_for_path(&args.state_db), args.scope.clone())
        .await
        .with_context(|| format!("failed to open view state '{}'", args.state_db.display()))?;
    store.health_check().await?;
    save_overrides(&store, &args).await?;

    let state = OrchestrationsState::new(Arc::new(client), Arc::new(store)).await?;
    let mut events = state.subscribe_events();

    state.reload_orchestrations().await;
    for _ in 1..args.pages {
        if !state.has_more_pages() || state.error_message().is_some() {
            break;
        }
        state.load_orchestrations(false).await;
    }
    if let Some(message) = state.error_message() {
        bail!(message);
    }
    print_records(&state)?;

    let Some(seconds) = args.watch else {
        return Ok(());
    };
    info!(seconds, "watching orchestrations, press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                state.cancel();
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(OrchestrationsEvent::RecordsReplaced { total }) => {
                    info!(total, "orchestrations refreshed");
                    print_records(&state)?;
                }
                Ok(OrchestrationsEvent::LoadFailed { message }) => bail!(message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed orchestrations events"),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Writes the command line choices into the view state so the controller
/// starts from them.
async fn save_overrides(store: &SqliteKeyValueStore, args: &ListArgs) -> Result<()> {
    let mut items: Vec<(&str, Option<String>)> = Vec::new();

    if let Some(from) = &args.from {
        let value = parse_timestamp(from).with_context(|| format!("invalid --from '{from}'"))?;
        items.push((fields::TIME_FROM, Some(to_iso_string(value))));
    }
    if let Some(till) = &args.till {
        let value = parse_timestamp(till).with_context(|| format!("invalid --till '{till}'"))?;
        items.push((fields::TIME_TILL, Some(to_iso_string(value))));
    }
    if let Some(entity_type) = args.entity_type {
        items.push((
            fields::SHOW_ENTITY_TYPE,
            Some(EntityTypeFilter::from(entity_type).as_str().to_string()),
        ));
    }
    if let Some(column) = &args.filter_column {
        items.push((fields::FILTERED_COLUMN, Some(column.clone())));
    }
    if let Some(operator) = args.filter_operator {
        items.push((
            fields::FILTER_OPERATOR,
            Some(FilterOperator::from(operator).as_str().to_string()),
        ));
    }
    if let Some(value) = &args.filter_value {
        items.push((fields::FILTER_VALUE, Some(value.clone())));
    }
    if let Some(column) = &args.order_by {
        let direction = if args.desc {
            OrderDirection::Descending
        } else {
            OrderDirection::Ascending
        };
        items.push((fields::ORDER_BY, Some(column.clone())));
        items.push((fields::ORDER_BY_DIRECTION, Some(direction.as_str().to_string())));
    }
    items.push((fields::AUTO_REFRESH, Some(args.watch.unwrap_or(0).to_string())));

    store
        .set_items(&items)
        .await
        .context("failed to save view state")
}

fn print_records(state: &OrchestrationsState) -> Result<()> {
    for record in state.orchestrations() {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

async fn start_backend(args: StartBackendArgs) -> Result<()> {
    let settings = load_settings()?;
    let process = BackendProcess::new(
        args.binaries,
        StorageConnectionSettings::new(args.connection_string, args.hub),
        settings,
    );

    let cancel = Arc::new(CancelToken::new(0));
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let properties = process
        .get_backend(&cancel)
        .await
        .context("failed to start backend")?;
    let connection = process.storage_connection_settings();
    println!(
        "{}",
        serde_json::json!({
            "backend": properties,
            "nonce": process.nonce(),
            "connectionString": connection.masked_conn_string(),
        })
    );

    if let Err(error) = ctrl_c.await {
        warn!(%error, "ctrl-c listener stopped");
    }
    process.cleanup().await;
    Ok(())
}
