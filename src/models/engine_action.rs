//! Engine action DTOs

use crate::error::AppError;
use crate::governance::{
    CompletionStatus, EngineAction, EngineActionFilter, EngineActionRequest, EngineActionStatus,
    ProcessInitiation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Request to start a process by qualified name
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiateProcessRequest {
    #[validate(length(min = 1, message = "processQualifiedName is required"))]
    pub process_qualified_name: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub request_source_guids: Vec<String>,
    #[serde(default)]
    pub action_target_guids: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl From<InitiateProcessRequest> for ProcessInitiation {
    fn from(request: InitiateProcessRequest) -> Self {
        Self {
            process_qualified_name: request.process_qualified_name,
            request_parameters: request.request_parameters,
            request_source_guids: request.request_source_guids,
            action_target_guids: request.action_target_guids,
            start_time: request.start_time,
        }
    }
}

/// Request to run a single request type
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiateEngineActionRequest {
    pub qualified_name: Option<String>,
    #[validate(length(min = 1, message = "requestType is required"))]
    pub request_type: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub request_source_guids: Vec<String>,
    #[serde(default)]
    pub action_target_guids: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl From<InitiateEngineActionRequest> for EngineActionRequest {
    fn from(request: InitiateEngineActionRequest) -> Self {
        Self {
            qualified_name: request.qualified_name,
            request_type: request.request_type,
            request_parameters: request.request_parameters,
            request_source_guids: request.request_source_guids,
            action_target_guids: request.action_target_guids,
            start_time: request.start_time,
        }
    }
}

/// Query string for listing engine actions
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EngineActionListQuery {
    /// Comma-separated statuses
    pub status: Option<String>,
    pub process_guid: Option<String>,
    pub step_guid: Option<String>,
    pub request_type: Option<String>,
    pub processing_engine_guid: Option<String>,
    pub previous_engine_action_guid: Option<String>,
    pub action_target_guid: Option<String>,
    #[serde(default)]
    pub unclaimed: bool,
    #[serde(default)]
    pub start_from: usize,
    #[serde(default)]
    #[validate(range(max = 1000, message = "pageSize must be at most 1000"))]
    pub page_size: usize,
}

impl EngineActionListQuery {
    pub fn filter(&self) -> Result<EngineActionFilter, AppError> {
        let statuses = match &self.status {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse::<EngineActionStatus>)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(EngineActionFilter {
            statuses,
            process_guid: self.process_guid.clone(),
            step_guid: self.step_guid.clone(),
            request_type: self.request_type.clone(),
            processing_engine_guid: self.processing_engine_guid.clone(),
            previous_engine_action_guid: self.previous_engine_action_guid.clone(),
            action_target_guid: self.action_target_guid.clone(),
            unclaimed: self.unclaimed,
        })
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    #[validate(length(min = 1, message = "engineGuid is required"))]
    pub engine_guid: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    #[validate(length(min = 1, message = "engineGuid is required"))]
    pub engine_guid: String,
    pub status: EngineActionStatus,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    #[validate(length(min = 1, message = "engineGuid is required"))]
    pub engine_guid: String,
    pub status: CompletionStatus,
    #[serde(default)]
    pub guards: Vec<String>,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub claimed: bool,
    pub engine_action: EngineAction,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineActionListResponse {
    pub engine_actions: Vec<EngineAction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_list_query_parses_statuses() {
        let query = EngineActionListQuery {
            status: Some("requested, IN_PROGRESS".to_string()),
            unclaimed: true,
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(
            filter.statuses,
            vec![EngineActionStatus::Requested, EngineActionStatus::InProgress]
        );
        assert!(filter.unclaimed);

        let bad = EngineActionListQuery {
            status: Some("finished".to_string()),
            ..Default::default()
        };
        assert!(bad.filter().is_err());
    }

    #[test]
    fn test_complete_request_shape() {
        let request: CompleteRequest = serde_json::from_value(serde_json::json!({
            "engineGuid": "engine-1",
            "status": "actioned",
            "guards": ["valid"]
        }))
        .unwrap();
        assert!(request.validate().is_ok());
        assert_eq!(request.status, CompletionStatus::Actioned);
    }
}
