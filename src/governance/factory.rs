//! Engine Action Factory
//!
//! The three ways an engine action comes into being: initiating a process,
//! requesting a bare request type, and a guard firing a successor step.

use crate::config::StatusEncoding;
use crate::error::{invalid_parameter, require_non_empty, AppError};
use crate::governance::engine_action::write_status_classification;
use crate::governance::graph::ProcessGraph;
use crate::governance::listener::{EngineActionEvent, EngineActionEventKind, ListenerRegistry};
use crate::governance::types::*;
use crate::store::MetadataStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Request to run a process from its first step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInitiation {
    pub process_qualified_name: String,
    /// Overrides for the first step's default request parameters
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub request_source_guids: Vec<String>,
    #[serde(default)]
    pub action_target_guids: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
}

/// Request to run a single governance service outside any process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineActionRequest {
    pub qualified_name: Option<String>,
    pub request_type: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub request_source_guids: Vec<String>,
    #[serde(default)]
    pub action_target_guids: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl EngineActionRequest {
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct EngineActionFactory {
    store: Arc<dyn MetadataStore>,
    graph: ProcessGraph,
    listeners: Arc<ListenerRegistry>,
    status_encoding: StatusEncoding,
}

impl EngineActionFactory {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        graph: ProcessGraph,
        listeners: Arc<ListenerRegistry>,
        status_encoding: StatusEncoding,
    ) -> Self {
        Self {
            store,
            graph,
            listeners,
            status_encoding,
        }
    }

    /// Start a process: one REQUESTED action for its first step
    pub async fn initiate_process(&self, user_id: &str, request: ProcessInitiation) -> Result<String, AppError> {
        require_non_empty(&request.process_qualified_name, "processQualifiedName")?;

        let process = self
            .graph
            .get_process_by_name(user_id, &request.process_qualified_name)
            .await?;
        if process.status == ProcessStatus::Deprecated {
            return Err(invalid_parameter(format!(
                "Process '{}' has been withdrawn",
                process.qualified_name
            )));
        }

        let first = self.graph.get_first_step(user_id, &process.guid).await?;
        self.validate_targets(user_id, &request.action_target_guids)
            .await?;

        let mut request_parameters = first.step.request_parameters.clone();
        request_parameters.extend(request.request_parameters);

        let action = new_action(
            format!("{}::{}", process.qualified_name, Uuid::new_v4()),
            first.step.request_type.clone(),
            request_parameters,
            request.request_source_guids,
            request.action_target_guids,
            request.start_time,
            user_id,
        );
        let action = EngineAction {
            process_guid: Some(process.guid.clone()),
            step_guid: Some(first.step.guid.clone()),
            ..action
        };

        let guid = self.create(user_id, action).await?;
        info!(
            "🚀 Initiated process '{}' with engine action {} for step '{}'",
            process.qualified_name, guid, first.step.qualified_name
        );
        Ok(guid)
    }

    /// Create a standalone action for a request type, outside any process
    pub async fn initiate_engine_action(&self, user_id: &str, request: EngineActionRequest) -> Result<String, AppError> {
        require_non_empty(&request.request_type, "requestType")?;
        self.validate_targets(user_id, &request.action_target_guids)
            .await?;

        let qualified_name = match request.qualified_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => format!("{}::{}", request.request_type, Uuid::new_v4()),
        };
        let action = new_action(
            qualified_name,
            request.request_type,
            request.request_parameters,
            request.request_source_guids,
            request.action_target_guids,
            request.start_time,
            user_id,
        );

        let guid = self.create(user_id, action).await?;
        info!("Initiated engine action {}", guid);
        Ok(guid)
    }

    /// Create the successor action of `previous` for a step whose guard fired
    pub async fn create_for_step(
        &self,
        user_id: &str,
        step: &GovernanceActionStep,
        previous: &EngineAction,
    ) -> Result<String, AppError> {
        require_non_empty(&step.guid, "stepGuid")?;
        require_non_empty(&previous.guid, "previousEngineActionGuid")?;

        let action = new_action(
            format!("{}::{}", step.qualified_name, Uuid::new_v4()),
            step.request_type.clone(),
            step.request_parameters.clone(),
            previous.request_source_guids.clone(),
            previous.action_target_guids.clone(),
            None,
            user_id,
        );
        let action = EngineAction {
            process_guid: previous.process_guid.clone().or_else(|| step.process_guid.clone()),
            step_guid: Some(step.guid.clone()),
            received_guards: previous.completion_guards.clone(),
            previous_engine_action_guid: Some(previous.guid.clone()),
            ..action
        };

        let guid = self.create(user_id, action).await?;
        debug!(
            "Engine action {} triggered step '{}' as {}",
            previous.guid, step.qualified_name, guid
        );
        Ok(guid)
    }

    async fn validate_targets(&self, user_id: &str, targets: &[String]) -> Result<(), AppError> {
        for target in targets {
            require_non_empty(target, "actionTargetGuid")?;
            if !self.store.element_exists(user_id, target).await? {
                return Err(invalid_parameter(format!(
                    "Action target {} does not exist",
                    target
                )));
            }
        }
        Ok(())
    }

    async fn create(&self, user_id: &str, mut action: EngineAction) -> Result<String, AppError> {
        let guid = self
            .store
            .create_element(user_id, ENGINE_ACTION_TYPE, encode_properties(&action)?)
            .await?;
        write_status_classification(
            self.store.as_ref(),
            self.status_encoding,
            user_id,
            &guid,
            action.status,
        )
        .await?;

        action.guid = guid.clone();
        self.listeners
            .publish(EngineActionEvent::new(EngineActionEventKind::Created, &action))
            .await;
        Ok(guid)
    }
}

fn new_action(
    qualified_name: String,
    request_type: String,
    request_parameters: BTreeMap<String, String>,
    request_source_guids: Vec<String>,
    action_target_guids: Vec<String>,
    start_time: Option<DateTime<Utc>>,
    user_id: &str,
) -> EngineAction {
    let now = Utc::now();
    EngineAction {
        guid: String::new(),
        qualified_name,
        process_guid: None,
        step_guid: None,
        request_type,
        request_parameters,
        request_source_guids,
        action_target_guids,
        received_guards: BTreeSet::new(),
        previous_engine_action_guid: None,
        status: EngineActionStatus::Requested,
        processing_engine_guid: None,
        start_time,
        activation_time: None,
        completion_time: None,
        completion_guards: BTreeSet::new(),
        completion_message: None,
        successors_resolved: false,
        requested_by: Some(user_id.to_string()),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::types::LinkProperties;
    use crate::store::InMemoryMetadataStore;
    use pretty_assertions::assert_eq;

    const USER: &str = "steward";

    struct Fixture {
        store: Arc<dyn MetadataStore>,
        graph: ProcessGraph,
        factory: EngineActionFactory,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let graph = ProcessGraph::new(store.clone());
        let factory = EngineActionFactory::new(
            store.clone(),
            graph.clone(),
            Arc::new(ListenerRegistry::default()),
            StatusEncoding::Property,
        );
        Fixture { store, graph, factory }
    }

    async fn onboard_process(f: &Fixture) -> String {
        let process = f
            .graph
            .create_process(
                USER,
                GovernanceActionProcess {
                    guid: String::new(),
                    qualified_name: "onboard-asset".to_string(),
                    display_name: None,
                    description: None,
                    status: ProcessStatus::Draft,
                },
            )
            .await
            .unwrap();
        let step = f
            .graph
            .create_step(
                USER,
                GovernanceActionStep {
                    guid: String::new(),
                    qualified_name: "validate".to_string(),
                    display_name: None,
                    description: None,
                    request_type: "validate-asset".to_string(),
                    request_parameters: BTreeMap::from([
                        ("level".to_string(), "basic".to_string()),
                        ("owner".to_string(), "data-team".to_string()),
                    ]),
                    ignore_multiple_triggers: false,
                    process_guid: Some(process.clone()),
                },
            )
            .await
            .unwrap();
        f.graph
            .set_first_step(USER, &process, &step, None, false)
            .await
            .unwrap();
        step
    }

    async fn get(f: &Fixture, guid: &str) -> EngineAction {
        decode_engine_action(&f.store.get_element(USER, guid).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_initiate_process_merges_parameters() {
        let f = fixture();
        let step = onboard_process(&f).await;
        let asset = f
            .store
            .create_element(USER, "Asset", Default::default())
            .await
            .unwrap();

        let guid = f
            .factory
            .initiate_process(
                USER,
                ProcessInitiation {
                    process_qualified_name: "onboard-asset".to_string(),
                    request_parameters: BTreeMap::from([("level".to_string(), "strict".to_string())]),
                    action_target_guids: vec![asset.clone()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let action = get(&f, &guid).await;
        assert_eq!(action.status, EngineActionStatus::Requested);
        assert_eq!(action.step_guid.as_deref(), Some(step.as_str()));
        assert_eq!(action.request_type, "validate-asset");
        assert_eq!(action.request_parameters.get("level").map(String::as_str), Some("strict"));
        assert_eq!(action.request_parameters.get("owner").map(String::as_str), Some("data-team"));
        assert!(action.received_guards.is_empty());
        assert_eq!(action.action_target_guids, vec![asset]);
        assert_eq!(action.requested_by.as_deref(), Some(USER));
    }

    #[tokio::test]
    async fn test_initiate_process_failures_create_nothing() {
        let f = fixture();
        onboard_process(&f).await;

        let unknown = f
            .factory
            .initiate_process(
                USER,
                ProcessInitiation {
                    process_qualified_name: "offboard-asset".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(unknown, Err(AppError::NotFound(_))));

        let bad_target = f
            .factory
            .initiate_process(
                USER,
                ProcessInitiation {
                    process_qualified_name: "onboard-asset".to_string(),
                    action_target_guids: vec!["missing".to_string()],
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad_target, Err(AppError::InvalidParameter(_))));

        let empty = f
            .factory
            .initiate_process(USER, ProcessInitiation::default())
            .await;
        assert!(matches!(empty, Err(AppError::InvalidParameter(_))));

        let actions = f
            .store
            .find_elements(USER, ENGINE_ACTION_TYPE, &Default::default(), Default::default())
            .await
            .unwrap();
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn test_process_without_first_step_is_not_found() {
        let f = fixture();
        f.graph
            .create_process(
                USER,
                GovernanceActionProcess {
                    guid: String::new(),
                    qualified_name: "empty".to_string(),
                    display_name: None,
                    description: None,
                    status: ProcessStatus::Draft,
                },
            )
            .await
            .unwrap();
        let result = f
            .factory
            .initiate_process(
                USER,
                ProcessInitiation {
                    process_qualified_name: "empty".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_bare_request_type() {
        let f = fixture();
        assert!(f
            .factory
            .initiate_engine_action(USER, EngineActionRequest::new(""))
            .await
            .is_err());

        let past = Utc::now() - chrono::Duration::hours(1);
        let guid = f
            .factory
            .initiate_engine_action(
                USER,
                EngineActionRequest {
                    start_time: Some(past),
                    ..EngineActionRequest::new("scan-asset")
                },
            )
            .await
            .unwrap();
        let action = get(&f, &guid).await;
        assert!(action.step_guid.is_none());
        assert!(action.process_guid.is_none());
        assert!(action.is_due(Utc::now()));
        assert!(action.qualified_name.starts_with("scan-asset::"));
    }

    #[tokio::test]
    async fn test_create_for_step_carries_guards_and_predecessor() {
        let f = fixture();
        let step_guid = onboard_process(&f).await;
        let next = f
            .graph
            .create_step(
                USER,
                GovernanceActionStep {
                    guid: String::new(),
                    qualified_name: "classify".to_string(),
                    display_name: None,
                    description: None,
                    request_type: "classify-asset".to_string(),
                    request_parameters: BTreeMap::new(),
                    ignore_multiple_triggers: false,
                    process_guid: None,
                },
            )
            .await
            .unwrap();
        f.graph
            .add_next_step_link(
                USER,
                &step_guid,
                &next,
                LinkProperties {
                    guard: Some("valid".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = f
            .factory
            .initiate_process(
                USER,
                ProcessInitiation {
                    process_qualified_name: "onboard-asset".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut previous = get(&f, &first).await;
        previous.completion_guards = BTreeSet::from(["valid".to_string()]);

        let step = f.graph.get_step(USER, &next).await.unwrap();
        let guid = f.factory.create_for_step(USER, &step, &previous).await.unwrap();
        let successor = get(&f, &guid).await;
        assert_eq!(successor.previous_engine_action_guid.as_deref(), Some(first.as_str()));
        assert_eq!(successor.received_guards, BTreeSet::from(["valid".to_string()]));
        assert_eq!(successor.process_guid, previous.process_guid);
        assert_eq!(successor.request_type, "classify-asset");
    }
}
