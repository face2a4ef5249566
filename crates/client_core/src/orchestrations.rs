//! View state of the orchestrations list: filters, sorting, time range, paging
//! and auto-refresh, persisted field by field in a [`KeyValueStore`].
//!
//! Every reload starts a new cancellation epoch. Responses that arrive for an
//! older epoch are dropped without touching the list or the error message, so
//! a slow page for a stale filter can never leak into the current view.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::Value;
use shared::domain::{EntityTypeFilter, FilterOperator, OrchestrationRecord, OrderDirection};
use storage::KeyValueStore;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    cancel::CancelToken,
    error::BackendError,
    query::{Column, OrchestrationsQuery, Predicate, QueryError},
    time::{parse_timestamp, to_iso_string, TimeBound},
    transport::BackendClient,
};

/// `filtered_column` value meaning "no column filter".
pub const NO_FILTER_COLUMN: &str = "0";

/// Field names under which the view state is persisted.
pub mod fields {
    pub const TIME_FROM: &str = "timeFrom";
    pub const TIME_TILL: &str = "timeTill";
    pub const FILTERED_COLUMN: &str = "filteredColumn";
    pub const FILTER_OPERATOR: &str = "filterOperator";
    pub const FILTER_VALUE: &str = "filterValue";
    pub const SHOW_ENTITY_TYPE: &str = "showEntityType";
    pub const ORDER_BY: &str = "orderBy";
    pub const ORDER_BY_DIRECTION: &str = "orderByDirection";
    pub const HIDDEN_COLUMNS: &str = "hiddenColumns";
    pub const AUTO_REFRESH: &str = "autoRefresh";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationsEvent {
    Reloaded,
    LoadStarted {
        epoch: u64,
        skip: usize,
        is_auto_refresh: bool,
    },
    PageAppended {
        loaded: usize,
        total: usize,
    },
    RecordsReplaced {
        total: usize,
    },
    NoMorePages,
    LoadFailed {
        message: String,
    },
    Cancelled {
        epoch: u64,
    },
}

pub struct OrchestrationsState {
    backend: Arc<dyn BackendClient>,
    store: Arc<dyn KeyValueStore>,
    inner: Mutex<QueryState>,
    events: broadcast::Sender<OrchestrationsEvent>,
}

struct QueryState {
    cancel_token: Arc<CancelToken>,
    next_epoch: u64,
    orchestrations: Vec<OrchestrationRecord>,
    no_more_pages: bool,
    order_by: String,
    order_by_direction: OrderDirection,
    auto_refresh: u64,
    time_from: TimeBound,
    old_time_from: DateTime<Utc>,
    time_till: Option<TimeBound>,
    old_time_till: Option<DateTime<Utc>>,
    filter_value: String,
    old_filter_value: String,
    filter_operator: FilterOperator,
    filtered_column: String,
    entity_type_filter: EntityTypeFilter,
    hidden_columns: Vec<String>,
    error_message: Option<String>,
    refresh_timer: Option<RefreshTimer>,
    next_timer_id: u64,
}

struct RefreshTimer {
    id: u64,
    handle: JoinHandle<()>,
}

impl QueryState {
    fn reset_order_by(&mut self) {
        self.order_by.clear();
        self.order_by_direction = OrderDirection::Ascending;
    }

    fn has_column_filter(&self) -> bool {
        !self.filter_value.is_empty() && self.filtered_column != NO_FILTER_COLUMN
    }

    fn start_new_epoch(&mut self) -> u64 {
        let cancelled = self.cancel_token.epoch();
        self.cancel_token.cancel();
        self.cancel_token = Arc::new(CancelToken::new(self.next_epoch));
        self.next_epoch += 1;
        cancelled
    }

    fn stop_refresh_timer(&mut self) {
        if let Some(timer) = self.refresh_timer.take() {
            timer.handle.abort();
        }
    }

    fn build_query(
        &self,
        skip: usize,
        now: DateTime<Utc>,
    ) -> std::result::Result<OrchestrationsQuery, QueryError> {
        let from = self.time_from.valid().unwrap_or(self.old_time_from);
        let till = match &self.time_till {
            Some(bound) => bound.valid().or(self.old_time_till).unwrap_or(now),
            None => now,
        };

        let mut query = OrchestrationsQuery::created_between(from, till)
            .with_skip(skip)
            .with_entity_type(self.entity_type_filter.entity_type());

        if self.has_column_filter() {
            query = query.with_predicate(Predicate::text_filter(
                Column::new(&self.filtered_column)?,
                self.filter_operator,
                &self.filter_value,
            ));
        }

        if !self.order_by.is_empty() {
            query = query.with_order_by(Column::new(&self.order_by)?, self.order_by_direction);
        }

        Ok(query.with_hidden_columns(&self.hidden_columns))
    }

    fn persisted_items(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            (
                fields::TIME_FROM,
                Some(to_iso_string(self.time_from.valid().unwrap_or(self.old_time_from))),
            ),
            (
                fields::TIME_TILL,
                self.time_till
                    .as_ref()
                    .and_then(TimeBound::valid)
                    .map(to_iso_string),
            ),
            (fields::FILTERED_COLUMN, Some(self.filtered_column.clone())),
            (
                fields::FILTER_OPERATOR,
                Some(self.filter_operator.as_str().to_string()),
            ),
            (
                fields::FILTER_VALUE,
                (!self.filter_value.is_empty()).then(|| self.filter_value.clone()),
            ),
            (
                fields::SHOW_ENTITY_TYPE,
                Some(self.entity_type_filter.as_str().to_string()),
            ),
            (
                fields::ORDER_BY,
                (!self.order_by.is_empty()).then(|| self.order_by.clone()),
            ),
            (
                fields::ORDER_BY_DIRECTION,
                Some(self.order_by_direction.as_str().to_string()),
            ),
        ]
    }
}

impl OrchestrationsState {
    /// Creates the view state, restoring whatever was persisted in `store`.
    pub async fn new(
        backend: Arc<dyn BackendClient>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<Self>> {
        let time_from = restore_timestamp(store.as_ref(), fields::TIME_FROM)
            .await?
            .unwrap_or_else(default_time_from);
        let time_till = restore_timestamp(store.as_ref(), fields::TIME_TILL).await?;

        let filtered_column = restore(store.as_ref(), fields::FILTERED_COLUMN)
            .await?
            .unwrap_or_else(|| NO_FILTER_COLUMN.to_string());
        let filter_operator =
            restore_parsed::<FilterOperator>(store.as_ref(), fields::FILTER_OPERATOR)
                .await?
                .unwrap_or_default();
        let filter_value = restore(store.as_ref(), fields::FILTER_VALUE)
            .await?
            .unwrap_or_default();
        let entity_type_filter =
            restore_parsed::<EntityTypeFilter>(store.as_ref(), fields::SHOW_ENTITY_TYPE)
                .await?
                .unwrap_or_default();
        let auto_refresh = restore_parsed::<u64>(store.as_ref(), fields::AUTO_REFRESH)
            .await?
            .unwrap_or(0);
        let order_by = restore(store.as_ref(), fields::ORDER_BY)
            .await?
            .unwrap_or_default();
        let order_by_direction =
            restore_parsed::<OrderDirection>(store.as_ref(), fields::ORDER_BY_DIRECTION)
                .await?
                .unwrap_or_default();
        let hidden_columns = restore(store.as_ref(), fields::HIDDEN_COLUMNS)
            .await?
            .map(|joined| {
                joined
                    .split('|')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            backend,
            store,
            inner: Mutex::new(QueryState {
                cancel_token: Arc::new(CancelToken::new(0)),
                next_epoch: 1,
                orchestrations: Vec::new(),
                no_more_pages: false,
                order_by,
                order_by_direction,
                auto_refresh,
                time_from: TimeBound::Valid(time_from),
                old_time_from: time_from,
                time_till: time_till.map(TimeBound::Valid),
                old_time_till: time_till,
                old_filter_value: filter_value.clone(),
                filter_value,
                filter_operator,
                filtered_column,
                entity_type_filter,
                hidden_columns,
                error_message: None,
                refresh_timer: None,
                next_timer_id: 0,
            }),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestrationsEvent> {
        self.events.subscribe()
    }

    pub fn orchestrations(&self) -> Vec<OrchestrationRecord> {
        self.lock().orchestrations.clone()
    }

    pub fn has_more_pages(&self) -> bool {
        !self.lock().no_more_pages
    }

    pub fn in_progress(&self) -> bool {
        let state = self.lock();
        state.cancel_token.in_progress() && !state.cancel_token.is_cancelled()
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    pub fn set_error_message(&self, message: impl Into<String>) {
        self.lock().error_message = Some(message.into());
    }

    pub fn clear_error_message(&self) {
        self.lock().error_message = None;
    }

    pub fn hidden_columns(&self) -> Vec<String> {
        self.lock().hidden_columns.clone()
    }

    pub fn auto_refresh(&self) -> u64 {
        self.lock().auto_refresh
    }

    /// Whether an auto-refresh tick is currently armed.
    pub fn has_pending_refresh(&self) -> bool {
        self.lock().refresh_timer.is_some()
    }

    pub fn time_from(&self) -> TimeBound {
        self.lock().time_from.clone()
    }

    /// The upper bound of the range; "now" while the bound is disabled.
    pub fn time_till(&self) -> TimeBound {
        self.lock()
            .time_till
            .clone()
            .unwrap_or_else(|| TimeBound::Valid(Utc::now()))
    }

    pub fn time_till_enabled(&self) -> bool {
        self.lock().time_till.is_some()
    }

    pub fn order_by(&self) -> String {
        self.lock().order_by.clone()
    }

    pub fn order_by_direction(&self) -> OrderDirection {
        self.lock().order_by_direction
    }

    pub fn filter_value(&self) -> String {
        self.lock().filter_value.clone()
    }

    pub fn filter_operator(&self) -> FilterOperator {
        self.lock().filter_operator
    }

    pub fn filtered_column(&self) -> String {
        self.lock().filtered_column.clone()
    }

    pub fn entity_type_filter(&self) -> EntityTypeFilter {
        self.lock().entity_type_filter
    }

    /// The backend only fills `lastEvent` while the list is filtered by it.
    pub fn show_last_event_column(&self) -> bool {
        let state = self.lock();
        state.filtered_column == "lastEvent" && !state.old_filter_value.is_empty()
    }

    pub fn set_time_from(&self, value: TimeBound) {
        let mut state = self.lock();
        state.time_from = value;
        state.reset_order_by();
    }

    pub async fn apply_time_from(self: &Arc<Self>) {
        let changed = {
            let mut state = self.lock();
            match state.time_from.valid() {
                Some(value) => value != state.old_time_from,
                None => {
                    state.time_from = TimeBound::Valid(state.old_time_from);
                    false
                }
            }
        };
        if changed {
            self.reload_orchestrations().await;
        }
    }

    pub fn set_time_till(&self, value: TimeBound) {
        let mut state = self.lock();
        state.time_till = Some(value);
        state.reset_order_by();
    }

    pub async fn apply_time_till(self: &Arc<Self>) {
        let changed = {
            let mut state = self.lock();
            match state.time_till.as_ref().map(TimeBound::valid) {
                Some(Some(value)) => Some(value) != state.old_time_till,
                Some(None) => {
                    state.time_till = state.old_time_till.map(TimeBound::Valid);
                    false
                }
                None => false,
            }
        };
        if changed {
            self.reload_orchestrations().await;
        }
    }

    pub async fn set_time_till_enabled(self: &Arc<Self>, enabled: bool) {
        {
            let mut state = self.lock();
            if enabled {
                state.time_till = Some(TimeBound::Valid(Utc::now()));
                return;
            }
            state.time_till = None;
            state.reset_order_by();
        }
        self.reload_orchestrations().await;
    }

    /// Cycles sorting by `column`: ascending, then descending, then unsorted.
    pub async fn set_order_by(self: &Arc<Self>, column: &str) {
        {
            let mut state = self.lock();
            if state.order_by != column {
                state.order_by = column.to_string();
                state.order_by_direction = OrderDirection::Ascending;
            } else if state.order_by_direction == OrderDirection::Descending {
                state.reset_order_by();
            } else {
                state.order_by_direction = OrderDirection::Descending;
            }
        }
        self.reload_orchestrations().await;
    }

    pub async fn set_filter_operator(self: &Arc<Self>, operator: FilterOperator) {
        let reload = {
            let mut state = self.lock();
            state.filter_operator = operator;
            state.has_column_filter()
        };
        if reload {
            self.reload_orchestrations().await;
        }
    }

    pub async fn set_filtered_column(self: &Arc<Self>, column: &str) {
        {
            let mut state = self.lock();
            state.filtered_column = column.to_string();
            if state.filter_value.is_empty() {
                return;
            }
            if state.filtered_column == NO_FILTER_COLUMN {
                state.filter_value.clear();
            }
        }
        self.reload_orchestrations().await;
    }

    pub fn set_filter_value(&self, value: impl Into<String>) {
        self.lock().filter_value = value.into();
    }

    pub async fn apply_filter_value(self: &Arc<Self>) {
        let changed = {
            let state = self.lock();
            state.filter_value != state.old_filter_value
        };
        if changed {
            self.reload_orchestrations().await;
        }
    }

    pub async fn set_entity_type_filter(self: &Arc<Self>, value: EntityTypeFilter) {
        self.lock().entity_type_filter = value;
        self.reload_orchestrations().await;
    }

    pub async fn hide_column(&self, name: &str) {
        let joined = {
            let mut state = self.lock();
            if !state.hidden_columns.iter().any(|hidden| hidden == name) {
                state.hidden_columns.push(name.to_string());
            }
            state.hidden_columns.join("|")
        };
        if let Err(error) = self.store.set_item(fields::HIDDEN_COLUMNS, &joined).await {
            warn!(%error, "failed to persist hidden columns");
        }
    }

    pub async fn unhide(self: &Arc<Self>) {
        self.lock().hidden_columns.clear();
        if let Err(error) = self.store.remove_item(fields::HIDDEN_COLUMNS).await {
            warn!(%error, "failed to persist hidden columns");
        }
        self.reload_orchestrations().await;
    }

    /// Sets the auto-refresh period in seconds (0 disables it) and refreshes
    /// the first page right away.
    pub async fn set_auto_refresh(self: &Arc<Self>, seconds: u64) {
        {
            let mut state = self.lock();
            state.auto_refresh = seconds;
            if seconds == 0 {
                state.stop_refresh_timer();
            }
        }
        if let Err(error) = self
            .store
            .set_item(fields::AUTO_REFRESH, &seconds.to_string())
            .await
        {
            warn!(%error, "failed to persist auto-refresh interval");
        }
        self.load_orchestrations(true).await;
    }

    /// Abandons the current epoch: its pending response is ignored. A running
    /// auto-refresh keeps ticking.
    pub fn cancel(&self) {
        let epoch = self.lock().start_new_epoch();
        debug!(epoch, "orchestrations load cancelled");
        self.emit(OrchestrationsEvent::Cancelled { epoch });
    }

    /// Starts over from the first page with the current filters, persisting them.
    pub async fn reload_orchestrations(self: &Arc<Self>) {
        let items = {
            let mut state = self.lock();
            state.start_new_epoch();
            state.stop_refresh_timer();
            state.orchestrations.clear();
            state.no_more_pages = false;

            if !state.time_from.is_valid() {
                state.time_from = TimeBound::Valid(state.old_time_from);
            }
            if matches!(state.time_till, Some(TimeBound::Invalid(_))) {
                state.time_till = state.old_time_till.map(TimeBound::Valid);
            }

            let items = state.persisted_items();

            state.old_filter_value = state.filter_value.clone();
            state.old_time_from = state.time_from.valid().unwrap_or(state.old_time_from);
            state.old_time_till = state.time_till.as_ref().and_then(TimeBound::valid);
            items
        };

        self.emit(OrchestrationsEvent::Reloaded);
        if let Err(error) = self.store.set_items(&items).await {
            warn!(%error, "failed to persist orchestrations view state");
        }

        self.load_orchestrations(false).await;
    }

    /// Loads the next page, or with `is_auto_refresh` re-fetches the first page
    /// and replaces the list with it. Dropped while another load of the same
    /// epoch is in flight.
    pub async fn load_orchestrations(self: &Arc<Self>, is_auto_refresh: bool) {
        let (token, request) = {
            let state = self.lock();
            let token = state.cancel_token.clone();
            if state.no_more_pages && state.auto_refresh == 0 {
                return;
            }
            if !token.try_begin() {
                return;
            }

            let skip = if is_auto_refresh {
                0
            } else {
                state.orchestrations.len()
            };
            (token, state.build_query(skip, Utc::now()))
        };

        let outcome = match request {
            Ok(query) => {
                debug!(
                    epoch = token.epoch(),
                    skip = query.skip,
                    is_auto_refresh,
                    "loading orchestrations page"
                );
                self.emit(OrchestrationsEvent::LoadStarted {
                    epoch: token.epoch(),
                    skip: query.skip,
                    is_auto_refresh,
                });
                match self.backend.call(Method::GET, &query.to_path()).await {
                    Ok(payload) => decode_page(payload),
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(BackendError::from(error)),
        };

        self.complete_load(&token, is_auto_refresh, outcome);
    }

    fn complete_load(
        self: &Arc<Self>,
        token: &CancelToken,
        is_auto_refresh: bool,
        outcome: std::result::Result<Vec<OrchestrationRecord>, BackendError>,
    ) {
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            token.finish();

            if token.is_cancelled() {
                debug!(epoch = token.epoch(), "discarding response of cancelled load");
                if state.auto_refresh > 0 && state.refresh_timer.is_none() {
                    self.schedule_refresh(&mut state);
                }
                return;
            }

            match outcome {
                Ok(page) if page.is_empty() => {
                    state.no_more_pages = true;
                    events.push(OrchestrationsEvent::NoMorePages);
                }
                Ok(page) if is_auto_refresh => {
                    state.orchestrations = page;
                    events.push(OrchestrationsEvent::RecordsReplaced {
                        total: state.orchestrations.len(),
                    });
                }
                Ok(page) => {
                    let loaded = page.len();
                    state.orchestrations.extend(page);
                    events.push(OrchestrationsEvent::PageAppended {
                        loaded,
                        total: state.orchestrations.len(),
                    });
                }
                Err(error) => {
                    // A failing backend must not be polled forever.
                    state.auto_refresh = 0;
                    state.stop_refresh_timer();

                    let message = format!(
                        "Load failed: {error}.{}",
                        error.response_body().unwrap_or_default()
                    );
                    warn!(epoch = token.epoch(), %message, "orchestrations load failed");
                    state.error_message = Some(message.clone());
                    events.push(OrchestrationsEvent::LoadFailed { message });
                }
            }

            if state.auto_refresh > 0 {
                self.schedule_refresh(&mut state);
            }
        }

        for event in events {
            self.emit(event);
        }
    }

    fn schedule_refresh(self: &Arc<Self>, state: &mut QueryState) {
        state.stop_refresh_timer();

        let id = state.next_timer_id;
        state.next_timer_id += 1;
        let delay = Duration::from_secs(state.auto_refresh);
        let this = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = this.upgrade() else {
                return;
            };
            {
                let mut state = this.lock();
                let current = state.refresh_timer.as_ref().map(|timer| timer.id);
                if current != Some(id) {
                    return;
                }
                state.refresh_timer = None;
            }
            this.load_orchestrations(true).await;
        });

        state.refresh_timer = Some(RefreshTimer { id, handle });
    }

    fn emit(&self, event: OrchestrationsEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, QueryState> {
        // The state is plain data; a panic elsewhere does not invalidate it.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for OrchestrationsState {
    fn drop(&mut self) {
        let state = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.stop_refresh_timer();
    }
}

fn default_time_from() -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(24)
}

fn decode_page(payload: Value) -> std::result::Result<Vec<OrchestrationRecord>, BackendError> {
    if payload.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(payload).map_err(|err| BackendError::Decode(err.to_string()))
}

async fn restore(store: &dyn KeyValueStore, field: &str) -> Result<Option<String>> {
    Ok(store
        .get_item(field)
        .await?
        .filter(|value| !value.is_empty()))
}

async fn restore_parsed<T>(store: &dyn KeyValueStore, field: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = restore(store, field).await? else {
        return Ok(None);
    };
    match raw.parse() {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            warn!(field, value = %raw, %error, "ignoring unreadable persisted value");
            Ok(None)
        }
    }
}

async fn restore_timestamp(
    store: &dyn KeyValueStore,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = restore(store, field).await? else {
        return Ok(None);
    };
    let parsed = parse_timestamp(&raw);
    if parsed.is_none() {
        warn!(field, value = %raw, "ignoring unreadable persisted timestamp");
    }
    Ok(parsed)
}

#[cfg(test)]
#[path = "tests/orchestrations_tests.rs"]
mod tests;
