//! End-to-end flows through the public API against the in-memory store.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use governance_engine::config::{EngineConfig, Settings, StatusEncoding};
use governance_engine::governance::*;
use governance_engine::routes::create_router;
use governance_engine::state::AppState;
use governance_engine::store::{InMemoryMetadataStore, MetadataStore, Pagination};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tower::ServiceExt;

const STEWARD: &str = "steward";

struct Harness {
    store: Arc<dyn MetadataStore>,
    engine: GovernanceEngine,
    services: Arc<ServiceRegistry>,
}

fn harness() -> Harness {
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let engine = GovernanceEngine::new(
        store.clone(),
        Arc::new(ListenerRegistry::default()),
        StatusEncoding::Property,
    );
    let services = Arc::new(
        ServiceRegistry::with_builtins()
            .with("classify-asset", Arc::new(NoOpService::new(["classified"])))
            .with("quarantine-asset", Arc::new(NoOpService::default())),
    );
    Harness {
        store,
        engine,
        services,
    }
}

fn host(h: &Harness, engine_guid: &str) -> EngineHost {
    let config = EngineConfig {
        engine_guid: engine_guid.to_string(),
        engine_name: "flow-engine".to_string(),
        ..Default::default()
    };
    EngineHost::new(&config, h.engine.actions.clone(), h.services.clone())
}

/// Poll until the backlog is empty
async fn drain(host: &EngineHost) {
    for _ in 0..20 {
        let summary = host.poll_once().await.unwrap();
        host.wait_for_tasks().await;
        if summary.inspected == 0 {
            break;
        }
    }
}

fn step(name: &str, request_type: &str, params: &[(&str, &str)]) -> GovernanceActionStep {
    GovernanceActionStep {
        guid: String::new(),
        qualified_name: name.to_string(),
        display_name: None,
        description: None,
        request_type: request_type.to_string(),
        request_parameters: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ignore_multiple_triggers: false,
        process_guid: None,
    }
}

fn guarded(guard: &str, mandatory: bool) -> LinkProperties {
    LinkProperties {
        guard: Some(guard.to_string()),
        mandatory_guard: mandatory,
        ignore_multiple_triggers: false,
    }
}

async fn process_with_first_step(h: &Harness, name: &str, first: GovernanceActionStep) -> (String, String) {
    let process = h
        .engine
        .graph
        .create_process(
            STEWARD,
            GovernanceActionProcess {
                guid: String::new(),
                qualified_name: name.to_string(),
                display_name: None,
                description: None,
                status: ProcessStatus::Draft,
            },
        )
        .await
        .unwrap();
    let first = h.engine.graph.create_step(STEWARD, first).await.unwrap();
    h.engine
        .graph
        .set_first_step(STEWARD, &process, &first, None, false)
        .await
        .unwrap();
    h.engine.graph.publish_process(STEWARD, &process).await.unwrap();
    (process, first)
}

async fn all_actions(h: &Harness) -> Vec<EngineAction> {
    h.engine
        .actions
        .list_engine_actions(STEWARD, &EngineActionFilter::default(), Pagination::all())
        .await
        .unwrap()
}

#[tokio::test]
async fn onboard_asset_runs_validate_then_classify() {
    let h = harness();
    let (process, validate) = process_with_first_step(
        &h,
        "onboard-asset",
        step("validate", "echo-guards", &[("guards", "valid")]),
    )
    .await;
    let classify = h
        .engine
        .graph
        .create_step(STEWARD, step("classify", "classify-asset", &[]))
        .await
        .unwrap();
    let quarantine = h
        .engine
        .graph
        .create_step(STEWARD, step("quarantine", "quarantine-asset", &[]))
        .await
        .unwrap();
    h.engine
        .graph
        .add_next_step_link(STEWARD, &validate, &classify, guarded("valid", false))
        .await
        .unwrap();
    h.engine
        .graph
        .add_next_step_link(STEWARD, &validate, &quarantine, guarded("invalid", false))
        .await
        .unwrap();
    assert!(h
        .engine
        .graph
        .validate_process(STEWARD, &process)
        .await
        .unwrap()
        .warnings
        .is_empty());

    let asset = h
        .store
        .create_element(STEWARD, "Asset", Default::default())
        .await
        .unwrap();
    let first = h
        .engine
        .factory
        .initiate_process(
            STEWARD,
            ProcessInitiation {
                process_qualified_name: "onboard-asset".to_string(),
                action_target_guids: vec![asset.clone()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    drain(&host(&h, "engine-1")).await;

    let actions = all_actions(&h).await;
    assert_eq!(actions.len(), 2);

    let validated = actions.iter().find(|a| a.guid == first).unwrap();
    assert_eq!(validated.status, EngineActionStatus::Actioned);
    assert_eq!(validated.completion_guards, BTreeSet::from(["valid".to_string()]));

    let classified = actions.iter().find(|a| a.guid != first).unwrap();
    assert_eq!(classified.step_guid.as_deref(), Some(classify.as_str()));
    assert_eq!(classified.previous_engine_action_guid.as_deref(), Some(first.as_str()));
    assert_eq!(classified.received_guards, BTreeSet::from(["valid".to_string()]));
    assert_eq!(classified.action_target_guids, vec![asset]);
    assert_eq!(classified.process_guid.as_deref(), Some(process.as_str()));
    assert_eq!(classified.status, EngineActionStatus::Actioned);
    assert!(classified.completion_guards.contains("classified"));
}

#[tokio::test]
async fn wildcard_and_guarded_links_fan_out() {
    let h = harness();
    let (_, review) = process_with_first_step(
        &h,
        "review",
        step("review", "echo-guards", &[("guards", "approved")]),
    )
    .await;

    let mut targets = Vec::new();
    for (name, guard) in [("a", Some("approved")), ("b", Some("approved")), ("c", None)] {
        let guid = h
            .engine
            .graph
            .create_step(STEWARD, step(name, "no-op", &[]))
            .await
            .unwrap();
        let props = match guard {
            Some(g) => guarded(g, false),
            None => LinkProperties::default(),
        };
        h.engine
            .graph
            .add_next_step_link(STEWARD, &review, &guid, props)
            .await
            .unwrap();
        targets.push(guid);
    }

    h.engine
        .factory
        .initiate_process(
            STEWARD,
            ProcessInitiation {
                process_qualified_name: "review".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drain(&host(&h, "engine-1")).await;

    let mut triggered: Vec<String> = all_actions(&h)
        .await
        .into_iter()
        .filter(|a| a.previous_engine_action_guid.is_some())
        .filter_map(|a| a.step_guid)
        .collect();
    triggered.sort();
    targets.sort();
    assert_eq!(triggered, targets);
}

#[tokio::test]
async fn unsatisfied_mandatory_guard_stops_the_process() {
    let h = harness();
    let (_, review) = process_with_first_step(
        &h,
        "sign-off",
        step("review", "echo-guards", &[("guards", "approved")]),
    )
    .await;
    let publish = h
        .engine
        .graph
        .create_step(STEWARD, step("publish", "no-op", &[]))
        .await
        .unwrap();
    let notify = h
        .engine
        .graph
        .create_step(STEWARD, step("notify", "no-op", &[]))
        .await
        .unwrap();
    h.engine
        .graph
        .add_next_step_link(STEWARD, &review, &publish, guarded("signed-off", true))
        .await
        .unwrap();
    h.engine
        .graph
        .add_next_step_link(STEWARD, &review, &notify, guarded("approved", false))
        .await
        .unwrap();

    // Override the step default so the mandatory guard is produced as well.
    let satisfied = h
        .engine
        .factory
        .initiate_process(
            STEWARD,
            ProcessInitiation {
                process_qualified_name: "sign-off".to_string(),
                request_parameters: BTreeMap::from([(
                    "guards".to_string(),
                    "approved,signed-off".to_string(),
                )]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let blocked = h
        .engine
        .factory
        .initiate_process(
            STEWARD,
            ProcessInitiation {
                process_qualified_name: "sign-off".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drain(&host(&h, "engine-1")).await;

    let actions = all_actions(&h).await;
    let successors_of = |guid: &str| {
        actions
            .iter()
            .filter(|a| a.previous_engine_action_guid.as_deref() == Some(guid))
            .count()
    };
    assert_eq!(successors_of(&satisfied), 2);
    assert_eq!(successors_of(&blocked), 0);

    let blocked = actions.iter().find(|a| a.guid == blocked).unwrap();
    assert_eq!(blocked.status, EngineActionStatus::Actioned);
}

#[tokio::test]
async fn listeners_observe_the_lifecycle() {
    let h = harness();
    let mut events = h.engine.listeners.register_listener().await;

    let guid = h
        .engine
        .factory
        .initiate_engine_action(STEWARD, EngineActionRequest::new("no-op"))
        .await
        .unwrap();
    drain(&host(&h, "engine-1")).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.engine_action_guid, guid);
        kinds.push((event.kind, event.status));
    }
    assert_eq!(kinds.first(), Some(&(EngineActionEventKind::Created, EngineActionStatus::Requested)));
    assert!(kinds.contains(&(EngineActionEventKind::Claimed, EngineActionStatus::Activating)));
    assert_eq!(kinds.last(), Some(&(EngineActionEventKind::Completed, EngineActionStatus::Actioned)));
}

// =============================================================================
// HTTP
// =============================================================================

fn app_with_store(store: Arc<dyn MetadataStore>) -> axum::Router {
    let settings = Settings::default();
    let state = Arc::new(AppState::new(
        store,
        Arc::new(ServiceRegistry::with_builtins()),
        Arc::new(ListenerRegistry::default()),
        settings.clone(),
    ));
    create_router(state, &settings)
}

async fn call(app: &axum::Router, method: &str, uri: &str, caller: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(caller) = caller {
        builder = builder.header("x-caller-id", caller);
    }
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn http_define_initiate_and_claim() {
    let app = app_with_store(Arc::new(InMemoryMetadataStore::new()));
    let me = Some(STEWARD);

    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "memory");

    let (status, body) = call(&app, "POST", "/api/processes", me, Some(json!({"qualifiedName": "onboard-asset"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let process = body["data"]["guid"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        "POST",
        "/api/steps",
        me,
        Some(json!({"qualifiedName": "validate", "requestType": "echo-guards"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let step = body["data"]["guid"].as_str().unwrap().to_string();

    // Initiating before a first step exists is NotFound.
    let initiate = json!({"processQualifiedName": "onboard-asset"});
    let (status, body) = call(&app, "POST", "/api/processes/initiate", me, Some(initiate.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = call(
        &app,
        "PUT",
        &format!("/api/processes/{}/first-step", process),
        me,
        Some(json!({"stepGuid": step})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "POST", "/api/processes/initiate", me, Some(initiate)).await;
    assert_eq!(status, StatusCode::CREATED);
    let action = body["data"]["guid"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "GET", &format!("/api/engine-actions/{}", action), me, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "requested");
    assert_eq!(body["data"]["requestType"], "echo-guards");

    let claim = |engine: &str| json!({ "engineGuid": engine });
    let uri = format!("/api/engine-actions/{}/claim", action);
    let (_, first) = call(&app, "POST", &uri, me, Some(claim("engine-a"))).await;
    let (_, second) = call(&app, "POST", &uri, me, Some(claim("engine-b"))).await;
    assert_eq!(first["data"]["claimed"], true);
    assert_eq!(second["data"]["claimed"], false);
    assert_eq!(second["data"]["engineAction"]["processingEngineGuid"], "engine-a");

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/api/engine-actions/{}/status", action),
        me,
        Some(json!({"engineGuid": "engine-a", "status": "in_progress"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");

    let (status, body) = call(
        &app,
        "GET",
        "/api/engine-actions?status=requested&processingEngineGuid=engine-a",
        me,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["engineActions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn http_rejects_invalid_and_unauthorized_requests() {
    let app = app_with_store(Arc::new(InMemoryMetadataStore::with_authorized_users([STEWARD])));

    let (status, body) = call(&app, "POST", "/api/processes", Some("mallory"), Some(json!({"qualifiedName": "p"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "NOT_AUTHORIZED");

    let (status, _) = call(&app, "GET", "/api/processes", None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, "POST", "/api/engine-actions", Some(STEWARD), Some(json!({"requestType": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, body) = call(
        &app,
        "POST",
        "/api/steps/missing/next-steps",
        Some(STEWARD),
        Some(json!({"nextStepGuid": "also-missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAMETER");
}
