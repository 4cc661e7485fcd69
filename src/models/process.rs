//! Process, step and link DTOs

use crate::governance::{
    GovernanceActionProcess, GovernanceActionStep, GraphWarning, LinkProperties, NextStepLink,
    ProcessStatus, ProcessUpdate, StepUpdate,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Request to define a new process
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessRequest {
    #[validate(length(min = 1, max = 255, message = "qualifiedName must be between 1 and 255 characters"))]
    pub qualified_name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

impl From<CreateProcessRequest> for GovernanceActionProcess {
    fn from(request: CreateProcessRequest) -> Self {
        Self {
            guid: String::new(),
            qualified_name: request.qualified_name,
            display_name: request.display_name,
            description: request.description,
            status: ProcessStatus::Draft,
        }
    }
}

/// Request to change a process; `replace` clears omitted optional fields
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProcessRequest {
    #[validate(length(min = 1, max = 255, message = "qualifiedName must be between 1 and 255 characters"))]
    pub qualified_name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub replace: bool,
}

impl From<UpdateProcessRequest> for ProcessUpdate {
    fn from(request: UpdateProcessRequest) -> Self {
        Self {
            qualified_name: request.qualified_name,
            display_name: request.display_name,
            description: request.description,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProcessListQuery {
    pub status: Option<ProcessStatus>,
    #[serde(default)]
    pub start_from: usize,
    #[serde(default)]
    #[validate(range(max = 1000, message = "pageSize must be at most 1000"))]
    pub page_size: usize,
}

/// Request to define a new step
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateStepRequest {
    #[validate(length(min = 1, max = 255, message = "qualifiedName must be between 1 and 255 characters"))]
    pub qualified_name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[validate(length(min = 1, message = "requestType is required"))]
    pub request_type: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_multiple_triggers: bool,
    pub process_guid: Option<String>,
}

impl From<CreateStepRequest> for GovernanceActionStep {
    fn from(request: CreateStepRequest) -> Self {
        Self {
            guid: String::new(),
            qualified_name: request.qualified_name,
            display_name: request.display_name,
            description: request.description,
            request_type: request.request_type,
            request_parameters: request.request_parameters,
            ignore_multiple_triggers: request.ignore_multiple_triggers,
            process_guid: request.process_guid,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStepRequest {
    #[validate(length(min = 1, max = 255, message = "qualifiedName must be between 1 and 255 characters"))]
    pub qualified_name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[validate(length(min = 1, message = "requestType must not be empty"))]
    pub request_type: Option<String>,
    pub request_parameters: Option<BTreeMap<String, String>>,
    pub ignore_multiple_triggers: Option<bool>,
}

impl From<UpdateStepRequest> for StepUpdate {
    fn from(request: UpdateStepRequest) -> Self {
        Self {
            qualified_name: request.qualified_name,
            display_name: request.display_name,
            description: request.description,
            request_type: request.request_type,
            request_parameters: request.request_parameters,
            ignore_multiple_triggers: request.ignore_multiple_triggers,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetFirstStepRequest {
    #[validate(length(min = 1, message = "stepGuid is required"))]
    pub step_guid: String,
    pub guard: Option<String>,
    #[serde(default)]
    pub mandatory_guard: bool,
}

/// Request to link a step to a successor
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddNextStepRequest {
    #[validate(length(min = 1, message = "nextStepGuid is required"))]
    pub next_step_guid: String,
    pub guard: Option<String>,
    #[serde(default)]
    pub mandatory_guard: bool,
    #[serde(default)]
    pub ignore_multiple_triggers: bool,
}

impl AddNextStepRequest {
    pub fn link_properties(&self) -> LinkProperties {
        LinkProperties {
            guard: self.guard.clone(),
            mandatory_guard: self.mandatory_guard,
            ignore_multiple_triggers: self.ignore_multiple_triggers,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLinkRequest {
    pub guard: Option<String>,
    #[serde(default)]
    pub mandatory_guard: bool,
    #[serde(default)]
    pub ignore_multiple_triggers: bool,
}

impl From<UpdateLinkRequest> for LinkProperties {
    fn from(request: UpdateLinkRequest) -> Self {
        Self {
            guard: request.guard,
            mandatory_guard: request.mandatory_guard,
            ignore_multiple_triggers: request.ignore_multiple_triggers,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidResponse {
    pub guid: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessListResponse {
    pub processes: Vec<GovernanceActionProcess>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStepsResponse {
    pub links: Vec<NextStepLink>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDeletedResponse {
    pub warnings: Vec<GraphWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_step_request_validation() {
        let request: CreateStepRequest = serde_json::from_value(serde_json::json!({
            "qualifiedName": "validate",
            "requestType": ""
        }))
        .unwrap();
        assert!(request.validate().is_err());

        let request: CreateStepRequest = serde_json::from_value(serde_json::json!({
            "qualifiedName": "validate",
            "requestType": "validate-asset",
            "requestParameters": {"level": "strict"}
        }))
        .unwrap();
        assert!(request.validate().is_ok());
        let step: GovernanceActionStep = request.into();
        assert!(!step.ignore_multiple_triggers);
        assert_eq!(step.request_parameters.len(), 1);
    }

    #[test]
    fn test_update_process_rejects_empty_name() {
        let request: UpdateProcessRequest =
            serde_json::from_value(serde_json::json!({"qualifiedName": ""})).unwrap();
        assert!(request.validate().is_err());
    }
}
