//! Governance Service Registry
//!
//! Maps request types to the services that carry them out.

use crate::error::AppError;
use crate::governance::types::{CompletionStatus, EngineAction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Request parameter read by `GuardEchoService`
pub const GUARDS_PARAMETER: &str = "guards";
/// Optional request parameter choosing the echoed completion status
pub const COMPLETION_STATUS_PARAMETER: &str = "completionStatus";

/// What a governance service sees while it runs
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub engine_guid: String,
    pub user_id: String,
    pub engine_action: EngineAction,
}

impl ExecutionContext {
    pub fn request_type(&self) -> &str {
        &self.engine_action.request_type
    }

    pub fn request_parameter(&self, name: &str) -> Option<&str> {
        self.engine_action
            .request_parameters
            .get(name)
            .map(String::as_str)
    }

    pub fn received_guards(&self) -> &BTreeSet<String> {
        &self.engine_action.received_guards
    }

    pub fn action_target_guids(&self) -> &[String] {
        &self.engine_action.action_target_guids
    }
}

/// Result of running a governance service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOutcome {
    pub status: CompletionStatus,
    #[serde(default)]
    pub guards: BTreeSet<String>,
    pub message: Option<String>,
}

impl ServiceOutcome {
    pub fn actioned<I, S>(guards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            status: CompletionStatus::Actioned,
            guards: guards.into_iter().map(Into::into).collect(),
            message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Invalid,
            guards: BTreeSet::new(),
            message: Some(message.into()),
        }
    }

    pub fn ignored(message: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Ignored,
            guards: BTreeSet::new(),
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A governance service. An `Err` is recorded as a FAILED completion.
#[async_trait]
pub trait GovernanceService: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ServiceOutcome, AppError>;
}

#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn GovernanceService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in services under their conventional names
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("no-op", Arc::new(NoOpService::default()));
        registry.register("echo-guards", Arc::new(GuardEchoService));
        registry
    }

    /// Register a service, replacing any previous one for the request type
    pub fn register(&mut self, request_type: impl Into<String>, service: Arc<dyn GovernanceService>) {
        self.services.insert(request_type.into(), service);
    }

    pub fn with(mut self, request_type: impl Into<String>, service: Arc<dyn GovernanceService>) -> Self {
        self.register(request_type, service);
        self
    }

    pub fn get(&self, request_type: &str) -> Option<Arc<dyn GovernanceService>> {
        self.services.get(request_type).cloned()
    }

    pub fn request_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.services.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Completes as ACTIONED with a fixed set of guards
#[derive(Debug, Clone, Default)]
pub struct NoOpService {
    guards: BTreeSet<String>,
}

impl NoOpService {
    pub fn new<I, S>(guards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            guards: guards.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl GovernanceService for NoOpService {
    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ServiceOutcome, AppError> {
        Ok(ServiceOutcome::actioned(self.guards.iter().cloned()))
    }
}

/// Produces the comma-separated guards named in its `guards` request parameter
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardEchoService;

#[async_trait]
impl GovernanceService for GuardEchoService {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ServiceOutcome, AppError> {
        let guards: BTreeSet<String> = ctx
            .request_parameter(GUARDS_PARAMETER)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();

        let status = match ctx.request_parameter(COMPLETION_STATUS_PARAMETER) {
            None => CompletionStatus::Actioned,
            Some(raw) => serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
                .map_err(|_| AppError::InvalidParameter(format!("Unknown completion status '{}'", raw)))?,
        };

        Ok(ServiceOutcome {
            status,
            guards,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::types::EngineActionStatus;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn context(params: &[(&str, &str)]) -> ExecutionContext {
        ExecutionContext {
            engine_guid: "engine".to_string(),
            user_id: "engine".to_string(),
            engine_action: EngineAction {
                guid: "ea".to_string(),
                qualified_name: "ea".to_string(),
                process_guid: None,
                step_guid: None,
                request_type: "echo-guards".to_string(),
                request_parameters: params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
                request_source_guids: vec![],
                action_target_guids: vec![],
                received_guards: BTreeSet::new(),
                previous_engine_action_guid: None,
                status: EngineActionStatus::InProgress,
                processing_engine_guid: Some("engine".to_string()),
                start_time: None,
                activation_time: None,
                completion_time: None,
                completion_guards: BTreeSet::new(),
                completion_message: None,
                successors_resolved: false,
                requested_by: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_echo_service_parses_guards() {
        let outcome = GuardEchoService
            .execute(&context(&[("guards", "valid, needs-review,,")]))
            .await
            .unwrap();
        assert_eq!(outcome.status, CompletionStatus::Actioned);
        assert_eq!(
            outcome.guards,
            BTreeSet::from(["needs-review".to_string(), "valid".to_string()])
        );
    }

    #[tokio::test]
    async fn test_echo_service_completion_status() {
        let outcome = GuardEchoService
            .execute(&context(&[("completionStatus", "INVALID")]))
            .await
            .unwrap();
        assert_eq!(outcome.status, CompletionStatus::Invalid);
        assert!(GuardEchoService
            .execute(&context(&[("completionStatus", "maybe")]))
            .await
            .is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ServiceRegistry::with_builtins()
            .with("classify-asset", Arc::new(NoOpService::new(["classified"])));
        assert_eq!(registry.request_types(), vec!["classify-asset", "echo-guards", "no-op"]);
        assert!(registry.get("classify-asset").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_no_op_service_reports_fixed_guards() {
        let service = NoOpService::new(["done"]);
        let outcome = tokio_test::block_on(service.execute(&context(&[]))).unwrap();
        assert_eq!(outcome, ServiceOutcome::actioned(["done"]));
    }
}
