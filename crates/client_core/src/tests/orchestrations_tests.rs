use super::*;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::TimeZone;
use serde_json::json;
use storage::MemoryKeyValueStore;
use tokio::sync::{oneshot, Notify};
use url::Url;

#[derive(Default)]
struct ScriptedBackend {
    responses: StdMutex<VecDeque<std::result::Result<Value, BackendError>>>,
    paths: StdMutex<Vec<String>>,
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    entered: Notify,
}

impl ScriptedBackend {
    fn with_responses(
        responses: impl IntoIterator<Item = std::result::Result<Value, BackendError>>,
    ) -> Arc<Self> {
        let backend = Self::default();
        backend
            .responses
            .lock()
            .expect("responses")
            .extend(responses);
        Arc::new(backend)
    }

    fn push(&self, response: std::result::Result<Value, BackendError>) {
        self.responses.lock().expect("responses").push_back(response);
    }

    /// Makes the next call wait until the returned sender fires.
    fn hold_next(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.gate.try_lock().expect("gate") = Some(gate);
        release
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().expect("paths").clone()
    }

    fn filter_of(&self, index: usize) -> String {
        query_value(&self.paths()[index], "$filter").unwrap_or_default()
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn call(&self, method: Method, path: &str) -> std::result::Result<Value, BackendError> {
        assert_eq!(method, Method::GET);
        self.paths.lock().expect("paths").push(path.to_string());

        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            self.entered.notify_one();
            let _ = gate.await;
        }

        self.responses
            .lock()
            .expect("responses")
            .pop_front()
            .unwrap_or_else(|| Ok(json!([])))
    }
}

fn page(len: usize, offset: usize) -> std::result::Result<Value, BackendError> {
    Ok(Value::Array(
        (0..len)
            .map(|i| {
                json!({
                    "instanceId": format!("instance-{}", offset + i),
                    "runtimeStatus": "Completed",
                })
            })
            .collect(),
    ))
}

fn query_value(path: &str, key: &str) -> Option<String> {
    Url::parse(&format!("http://localhost{path}"))
        .expect("url")
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn controller(
    backend: &Arc<ScriptedBackend>,
    store: &Arc<MemoryKeyValueStore>,
) -> Arc<OrchestrationsState> {
    OrchestrationsState::new(backend.clone(), store.clone())
        .await
        .expect("state")
}

#[tokio::test]
async fn restores_defaults_from_empty_store() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    let from = state.time_from().valid().expect("valid time_from");
    let expected = Utc::now() - chrono::Duration::hours(24);
    assert!((expected - from).num_seconds().abs() < 5);
    assert!(!state.time_till_enabled());
    assert_eq!(state.filtered_column(), NO_FILTER_COLUMN);
    assert_eq!(state.filter_operator(), FilterOperator::Equals);
    assert_eq!(state.entity_type_filter(), EntityTypeFilter::Both);
    assert_eq!(state.order_by(), "");
    assert_eq!(state.order_by_direction(), OrderDirection::Ascending);
    assert_eq!(state.auto_refresh(), 0);
    assert!(state.hidden_columns().is_empty());
    assert!(state.has_more_pages());
    assert!(backend.paths().is_empty());
}

#[tokio::test]
async fn unreadable_persisted_values_fall_back_to_defaults() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    store.set_item(fields::FILTER_OPERATOR, "Fuzzy").await.expect("set");
    store.set_item(fields::AUTO_REFRESH, "soon").await.expect("set");
    store.set_item(fields::TIME_FROM, "not a date").await.expect("set");

    let state = controller(&backend, &store).await;
    assert_eq!(state.filter_operator(), FilterOperator::Equals);
    assert_eq!(state.auto_refresh(), 0);
    assert!(state.time_from().is_valid());
}

#[tokio::test]
async fn pages_are_appended_until_an_empty_page() {
    let backend = ScriptedBackend::with_responses([page(50, 0), page(50, 50), page(0, 100)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.reload_orchestrations().await;
    state.load_orchestrations(false).await;
    state.load_orchestrations(false).await;

    assert_eq!(state.orchestrations().len(), 100);
    assert_eq!(state.orchestrations()[99].instance_id, "instance-99");
    assert!(!state.has_more_pages());

    let skips: Vec<_> = backend
        .paths()
        .iter()
        .map(|path| query_value(path, "$skip").expect("skip"))
        .collect();
    assert_eq!(skips, vec!["0", "50", "100"]);

    // Nothing left to page through and auto-refresh is off.
    state.load_orchestrations(false).await;
    assert_eq!(backend.paths().len(), 3);
}

#[tokio::test]
async fn overlapping_loads_issue_a_single_request() {
    let backend = ScriptedBackend::with_responses([page(50, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    let release = backend.hold_next();
    let first = tokio::spawn({
        let state = state.clone();
        async move { state.load_orchestrations(false).await }
    });
    backend.entered.notified().await;
    assert!(state.in_progress());

    state.load_orchestrations(false).await;
    assert_eq!(backend.paths().len(), 1);

    release.send(()).expect("release");
    first.await.expect("first load");

    assert_eq!(backend.paths().len(), 1);
    assert_eq!(state.orchestrations().len(), 50);
    assert!(!state.in_progress());
}

#[tokio::test]
async fn cancelled_response_is_discarded() {
    let backend = ScriptedBackend::with_responses([page(50, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    let release = backend.hold_next();
    let load = tokio::spawn({
        let state = state.clone();
        async move { state.load_orchestrations(false).await }
    });
    backend.entered.notified().await;

    state.cancel();
    assert!(!state.in_progress());
    release.send(()).expect("release");
    load.await.expect("load");

    assert!(state.orchestrations().is_empty());
    assert!(state.has_more_pages());
    assert_eq!(state.error_message(), None);
}

#[tokio::test]
async fn cancelled_failure_leaves_error_and_auto_refresh_alone() {
    let backend = ScriptedBackend::with_responses([Err(BackendError::status(500, "boom"))]);
    let store = Arc::new(MemoryKeyValueStore::new());
    store.set_item(fields::AUTO_REFRESH, "5").await.expect("set");
    let state = controller(&backend, &store).await;

    let release = backend.hold_next();
    let load = tokio::spawn({
        let state = state.clone();
        async move { state.load_orchestrations(false).await }
    });
    backend.entered.notified().await;

    state.cancel();
    release.send(()).expect("release");
    load.await.expect("load");

    assert_eq!(state.error_message(), None);
    assert_eq!(state.auto_refresh(), 5);
}

#[tokio::test]
async fn reload_supersedes_a_slow_page() {
    let backend = ScriptedBackend::with_responses([page(50, 0), page(3, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    let release = backend.hold_next();
    let stale = tokio::spawn({
        let state = state.clone();
        async move { state.load_orchestrations(false).await }
    });
    backend.entered.notified().await;

    // The held call pops its response only after release, so script the
    // fresh epoch's reply first.
    backend.responses.lock().expect("responses").swap(0, 1);
    state
        .set_entity_type_filter(EntityTypeFilter::OrchestrationsOnly)
        .await;
    assert_eq!(state.orchestrations().len(), 3);

    release.send(()).expect("release");
    stale.await.expect("stale load");
    assert_eq!(state.orchestrations().len(), 3);
}

#[tokio::test]
async fn reload_clears_records_before_the_next_page() {
    let backend = ScriptedBackend::with_responses([page(50, 0), page(3, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.load_orchestrations(false).await;
    assert_eq!(state.orchestrations().len(), 50);

    let mut events = state.subscribe_events();
    state
        .set_entity_type_filter(EntityTypeFilter::OrchestrationsOnly)
        .await;

    assert_eq!(state.orchestrations().len(), 3);
    assert_eq!(events.recv().await.expect("event"), OrchestrationsEvent::Reloaded);
    assert!(matches!(
        events.recv().await.expect("event"),
        OrchestrationsEvent::LoadStarted { skip: 0, is_auto_refresh: false, .. }
    ));
    assert_eq!(
        events.recv().await.expect("event"),
        OrchestrationsEvent::PageAppended { loaded: 3, total: 3 }
    );
    assert!(backend
        .filter_of(1)
        .ends_with(" and entityType eq 'Orchestration'"));
}

#[tokio::test]
async fn deferred_setters_keep_records() {
    let backend = ScriptedBackend::with_responses([page(10, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;
    state.set_order_by("name").await;

    state.set_filter_value("abc");
    state.set_time_from(TimeBound::Valid(Utc::now() - chrono::Duration::hours(1)));

    assert_eq!(state.orchestrations().len(), 10);
    assert_eq!(backend.paths().len(), 1);
    assert_eq!(state.order_by(), "");
}

#[tokio::test]
async fn order_by_toggle_cycles() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_order_by("name").await;
    assert_eq!(
        (state.order_by(), state.order_by_direction()),
        ("name".to_string(), OrderDirection::Ascending)
    );
    state.set_order_by("name").await;
    assert_eq!(
        (state.order_by(), state.order_by_direction()),
        ("name".to_string(), OrderDirection::Descending)
    );
    state.set_order_by("name").await;
    assert_eq!(
        (state.order_by(), state.order_by_direction()),
        (String::new(), OrderDirection::Ascending)
    );

    let orders: Vec<_> = backend
        .paths()
        .iter()
        .map(|path| query_value(path, "$orderby"))
        .collect();
    assert_eq!(
        orders,
        vec![
            Some("name asc".to_string()),
            Some("name desc".to_string()),
            None
        ]
    );
}

#[tokio::test]
async fn switching_sort_column_starts_ascending() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_order_by("name").await;
    state.set_order_by("name").await;
    state.set_order_by("createdTime").await;

    assert_eq!(state.order_by(), "createdTime");
    assert_eq!(state.order_by_direction(), OrderDirection::Ascending);
}

#[tokio::test]
async fn failing_auto_refresh_is_disabled() {
    let backend = ScriptedBackend::with_responses([Err(BackendError::status(500, "boom"))]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_auto_refresh(5).await;

    assert_eq!(state.auto_refresh(), 0);
    assert!(!state.has_pending_refresh());
    assert_eq!(
        state.error_message().as_deref(),
        Some("Load failed: Request failed with status code 500.boom")
    );
    // The failure only disables auto-refresh in memory.
    assert_eq!(
        store.get_item(fields::AUTO_REFRESH).await.expect("get"),
        Some("5".to_string())
    );
}

#[tokio::test]
async fn transport_failure_has_no_body_suffix() {
    let backend =
        ScriptedBackend::with_responses([Err(BackendError::transport("connection refused"))]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.reload_orchestrations().await;
    assert_eq!(
        state.error_message().as_deref(),
        Some("Load failed: connection refused.")
    );

    state.clear_error_message();
    assert_eq!(state.error_message(), None);
}

#[tokio::test]
async fn error_sink_is_settable_and_replaced_by_the_next_failure() {
    let backend = ScriptedBackend::with_responses([Err(BackendError::status(404, ""))]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_error_message("Backend is not running");
    assert_eq!(state.error_message().as_deref(), Some("Backend is not running"));

    state.reload_orchestrations().await;
    assert_eq!(
        state.error_message().as_deref(),
        Some("Load failed: Request failed with status code 404.")
    );
}

#[tokio::test(start_paused = true)]
async fn auto_refresh_replaces_first_page_on_each_tick() {
    let backend = ScriptedBackend::with_responses([page(2, 0), page(3, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_auto_refresh(5).await;
    assert_eq!(state.orchestrations().len(), 2);
    assert!(state.has_pending_refresh());

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(backend.paths().len(), 2);
    assert_eq!(state.orchestrations().len(), 3);
    assert_eq!(query_value(&backend.paths()[1], "$skip").as_deref(), Some("0"));
    assert!(state.has_pending_refresh());

    state.set_auto_refresh(0).await;
    assert!(!state.has_pending_refresh());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.paths().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_keeps_auto_refresh_ticking() {
    let backend = ScriptedBackend::with_responses([page(2, 0), page(4, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_auto_refresh(1).await;
    assert!(state.has_pending_refresh());
    state.cancel();
    assert!(state.has_pending_refresh());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(backend.paths().len(), 2);
    assert_eq!(state.orchestrations().len(), 4);
    assert_eq!(state.auto_refresh(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_tick_rearms_auto_refresh() {
    let backend = ScriptedBackend::with_responses([page(2, 0), page(3, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_auto_refresh(5).await;
    let release = backend.hold_next();
    backend.entered.notified().await;
    assert_eq!(backend.paths().len(), 2);

    state.cancel();
    release.send(()).expect("release");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(state.auto_refresh(), 5);
    assert!(state.has_pending_refresh());
    assert!(backend.paths().len() > 2);
    // The cancelled tick's page never replaced the list.
    assert_eq!(state.orchestrations().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_controller_stops_auto_refresh() {
    let backend = ScriptedBackend::with_responses([page(2, 0)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_auto_refresh(1).await;
    drop(state);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.paths().len(), 1);
}

#[tokio::test]
async fn filter_state_round_trips_through_the_store() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_filtered_column("name").await;
    state.set_filter_operator(FilterOperator::StartsWith).await;
    assert!(backend.paths().is_empty());

    state.set_filter_value("O'Neil");
    state.apply_filter_value().await;
    state.set_order_by("createdTime").await;
    state.hide_column("input").await;
    state.hide_column("output").await;
    state.hide_column("input").await;

    assert_eq!(
        backend.filter_of(0).rsplit(" and ").next(),
        Some("startswith(name, 'O''Neil')")
    );

    let restored = controller(&backend, &store).await;
    assert_eq!(restored.filtered_column(), "name");
    assert_eq!(restored.filter_operator(), FilterOperator::StartsWith);
    assert_eq!(restored.filter_value(), "O'Neil");
    assert_eq!(restored.order_by(), "createdTime");
    assert_eq!(restored.hidden_columns(), vec!["input", "output"]);
    assert_eq!(restored.time_from().to_string(), state.time_from().to_string());
    assert!(!restored.time_till_enabled());
}

#[tokio::test]
async fn invalid_time_from_is_reverted_without_a_request() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;
    let previous = state.time_from();

    state.set_time_from(TimeBound::parse("next tuesday"));
    state.apply_time_from().await;

    assert_eq!(state.time_from(), previous);
    assert!(backend.paths().is_empty());
}

#[tokio::test]
async fn invalid_time_is_reverted_on_reload() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;
    let previous = state.time_from().valid().expect("valid");

    state.set_time_from(TimeBound::parse("garbage"));
    state.reload_orchestrations().await;

    assert_eq!(state.time_from(), TimeBound::Valid(previous));
    assert!(backend
        .filter_of(0)
        .starts_with(&format!("createdTime ge '{}'", to_iso_string(previous))));
}

#[tokio::test]
async fn applying_a_new_time_range_reloads() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;
    let from = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().expect("from");
    let till = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).single().expect("till");

    state.set_time_from(TimeBound::Valid(from));
    state.apply_time_from().await;
    state.apply_time_from().await;
    assert_eq!(backend.paths().len(), 1);

    state.set_time_till_enabled(true).await;
    assert_eq!(backend.paths().len(), 1);
    state.set_time_till(TimeBound::Valid(till));
    state.apply_time_till().await;

    assert_eq!(backend.paths().len(), 2);
    assert_eq!(
        backend.filter_of(1),
        "createdTime ge '2024-03-01T00:00:00.000Z' and createdTime le '2024-03-02T12:00:00.000Z'"
    );
    assert_eq!(
        store.get_item(fields::TIME_TILL).await.expect("get"),
        Some("2024-03-02T12:00:00.000Z".to_string())
    );

    state.set_time_till_enabled(false).await;
    assert_eq!(backend.paths().len(), 3);
    assert!(!state.time_till_enabled());
    assert_eq!(store.get_item(fields::TIME_TILL).await.expect("get"), None);
}

#[tokio::test]
async fn clearing_the_filter_column_clears_the_value() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_filtered_column("name").await;
    state.set_filter_value("abc");
    state.apply_filter_value().await;
    state.set_filter_operator(FilterOperator::Contains).await;
    assert_eq!(backend.paths().len(), 2);
    assert!(backend.filter_of(1).ends_with("contains(name, 'abc')"));

    state.set_filtered_column(NO_FILTER_COLUMN).await;
    assert_eq!(state.filter_value(), "");
    assert_eq!(backend.paths().len(), 3);
    assert!(!backend.filter_of(2).contains("abc"));
    assert_eq!(store.get_item(fields::FILTER_VALUE).await.expect("get"), None);
}

#[tokio::test]
async fn last_event_column_follows_applied_filter() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.set_filtered_column("lastEvent").await;
    state.set_filter_value("TaskCompleted");
    assert!(!state.show_last_event_column());

    state.apply_filter_value().await;
    assert!(state.show_last_event_column());
}

#[tokio::test]
async fn hidden_columns_are_sent_and_unhide_reloads() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.hide_column("input").await;
    state.hide_column("customStatus").await;
    assert!(backend.paths().is_empty());
    assert_eq!(
        store.get_item(fields::HIDDEN_COLUMNS).await.expect("get"),
        Some("input|customStatus".to_string())
    );

    state.load_orchestrations(false).await;
    assert_eq!(
        query_value(&backend.paths()[0], "hidden-columns").as_deref(),
        Some("input|customStatus")
    );

    state.unhide().await;
    assert!(state.hidden_columns().is_empty());
    assert_eq!(store.get_item(fields::HIDDEN_COLUMNS).await.expect("get"), None);
    assert_eq!(query_value(&backend.paths()[1], "hidden-columns"), None);
}

#[tokio::test]
async fn invalid_column_fails_without_a_request() {
    let backend = ScriptedBackend::with_responses([]);
    let store = Arc::new(MemoryKeyValueStore::new());
    store
        .set_item(fields::FILTERED_COLUMN, "name) or (1")
        .await
        .expect("set");
    store.set_item(fields::FILTER_VALUE, "x").await.expect("set");
    let state = controller(&backend, &store).await;

    state.reload_orchestrations().await;

    assert!(backend.paths().is_empty());
    assert_eq!(
        state.error_message().as_deref(),
        Some("Load failed: invalid column name 'name) or (1'.")
    );
    assert!(!state.in_progress());
}

#[tokio::test]
async fn null_payload_ends_paging() {
    let backend = ScriptedBackend::with_responses([Ok(Value::Null)]);
    let store = Arc::new(MemoryKeyValueStore::new());
    let state = controller(&backend, &store).await;

    state.load_orchestrations(false).await;
    assert!(!state.has_more_pages());
    assert_eq!(state.error_message(), None);

    backend.push(page(1, 0));
    state.load_orchestrations(false).await;
    assert_eq!(backend.paths().len(), 1);
}
