use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use charla::flow::catalog::{MENU_FLOW, STORES_SOURCE, StoreDirectory, register_builtin_flows};
use charla::flow::loader::{FlowLoader, watch_flow_dir};
use charla::flow::{
    ConversationState, FlowData, FlowManager, InMemoryStateStore, InputKind, StateStoreType,
};
use charla::flow_commands::validate_flow_file;
use charla::message::MessageContent;
use chrono::Utc;
use tempfile::tempdir;

const USER: &str = "5491100000001";

/// Loader wired the way the binary wires it.
fn engine_loader() -> FlowLoader {
    FlowLoader::new().with_source(STORES_SOURCE, StoreDirectory::sample())
}

fn shipped_flow(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("flows")
        .join(name)
}

/// Built-in flows plus the definitions shipped under `flows/`.
fn manager_with_shipped_flows() -> Arc<FlowManager> {
    let manager = FlowManager::new();
    register_builtin_flows(&manager).unwrap();
    let loader = engine_loader();
    for file in ["stores.yaml", "survey.json"] {
        let (code, flow) = loader.load_file(&shipped_flow(file)).unwrap();
        manager.register_flow(code, flow);
    }
    manager
}

#[test]
fn shipped_definitions_build_and_validate() {
    let loader = engine_loader();

    let (code, stores) = loader.load_file(&shipped_flow("stores.yaml")).unwrap();
    assert_eq!(code, "stores");
    assert_eq!(stores.timeout_minutes(), 15);
    assert!(stores.has_step("ask_zone"));
    assert!(stores.has_step("show_stores"));

    let (code, survey) = loader.load_file(&shipped_flow("survey.json")).unwrap();
    assert_eq!(code, "survey");
    assert!(survey.has_step("ask_score"));

    validate_flow_file(shipped_flow("stores.yaml"), &loader).unwrap();
    validate_flow_file(shipped_flow("survey.json"), &loader).unwrap();
}

#[tokio::test]
async fn stores_flow_walks_from_zone_to_branch_list() {
    let manager = manager_with_shipped_flows();

    let turn = manager.start_flow("stores", USER).await.unwrap().unwrap();
    let MessageContent::List(zones) = turn.message.content() else {
        panic!("zone question should be a list");
    };
    assert_eq!(zones.sections[0].rows[0].id, "zone_center");

    let turn = manager
        .process_input(&turn.state, "zone_west", InputKind::ListReply, USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(turn.state.flow_data.get("zone"), Some("zone_west"));
    let MessageContent::List(stores) = turn.message.content() else {
        panic!("branches should render as a list");
    };
    let rows: Vec<_> = stores
        .sections
        .iter()
        .flat_map(|section| section.rows.iter())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "store_caballito");
    assert_eq!(rows[0].description.as_deref(), Some("Av. Rivadavia 5000"));

    let turn = manager
        .process_input(&turn.state, "store_caballito", InputKind::ListReply, USER)
        .await
        .unwrap()
        .unwrap();
    assert!(turn.completed);
    assert!(!turn.transfer_to_agent);
    assert!(turn.message.text().contains("Terminamos"));
}

#[tokio::test]
async fn menu_routes_into_the_deployed_stores_flow() {
    let manager = manager_with_shipped_flows();

    let turn = manager.start_flow(MENU_FLOW, USER).await.unwrap().unwrap();
    let turn = manager
        .process_input(&turn.state, "opt_store", InputKind::ListReply, USER)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(turn.state.flow_type.as_deref(), Some("stores"));
    assert_eq!(turn.state.flow_step.as_deref(), Some("ask_zone"));
    assert_eq!(turn.state.flow_data.from_flow(), Some(MENU_FLOW));
    let MessageContent::List(zones) = turn.message.content() else {
        panic!("stores flow should open with the zone list");
    };
    assert!(zones.body.contains("zona"));
}

#[tokio::test]
async fn survey_reasks_unknown_buttons_and_hands_off_on_bad_score() {
    let manager = manager_with_shipped_flows();
    let start = manager.start_flow("survey", USER).await.unwrap().unwrap();

    // Typed text is not a button tap; the step re-prompts.
    let turn = manager
        .process_input(&start.state, "mala", InputKind::Text, USER)
        .await
        .unwrap()
        .unwrap();
    assert!(!turn.completed);
    assert_eq!(turn.state.flow_step.as_deref(), Some("ask_score"));

    // An unknown button id falls through to the wildcard, which re-asks.
    let turn = manager
        .process_input(&turn.state, "score_meh", InputKind::ButtonReply, USER)
        .await
        .unwrap()
        .unwrap();
    assert!(!turn.completed);
    assert_eq!(turn.state.flow_step.as_deref(), Some("ask_score"));
    assert!(matches!(turn.message.content(), MessageContent::Buttons(_)));

    let turn = manager
        .process_input(&turn.state, "score_bad", InputKind::ButtonReply, USER)
        .await
        .unwrap()
        .unwrap();
    assert!(turn.completed);
    assert!(turn.transfer_to_agent);
    assert!(!turn.state.is_in_flow());
    assert!(turn.message.text().contains("derivamos"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn watcher_registers_definitions_dropped_in_later() {
    let manager = FlowManager::new();
    let dir = tempdir().unwrap();
    std::fs::copy(shipped_flow("stores.yaml"), dir.path().join("stores.yaml")).unwrap();

    let watcher = watch_flow_dir(
        Arc::new(engine_loader()),
        manager.clone(),
        dir.path().to_path_buf(),
    )
    .await
    .unwrap();

    // The initial scan picks up what was already there.
    assert!(manager.flow("stores").is_some());
    assert!(manager.flow("survey").is_none());

    std::fs::copy(shipped_flow("survey.json"), dir.path().join("survey.json")).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(manager.flow("survey").is_some());

    watcher.shutdown();
}

#[tokio::test]
async fn idle_sessions_expire_from_the_store() {
    let store = InMemoryStateStore::new(1);
    let state = ConversationState::started("claims", "ask_details", FlowData::default(), Utc::now());

    store.save(USER, state.clone()).await;
    assert_eq!(
        store.load(USER).await.map(|s| s.flow_step),
        Some(Some("ask_details".to_string()))
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.load(USER).await.is_none());
}
